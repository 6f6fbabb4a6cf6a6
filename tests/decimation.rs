use std::time::Duration;

use sdracq::codec::{ScalarOrder, WireBuffer, WireFormat};
use sdracq::decimators::{ChannelDecimator, Placement};
use sdracq::hardware::{Device, ReadStatus, RxStream};
use sdracq::synthetic::{SyntheticConfig, SyntheticDevice, Tone};
use sdracq::utils::rms_amplitude;
use sdracq::{DEFAULT_SAMP_RATE, MAX_LOG2_DECIM};

const FORMATS: [WireFormat; 4] = [
    WireFormat::Cs8,
    WireFormat::Cs12,
    WireFormat::Cs16,
    WireFormat::Cf32,
];
const PLACEMENTS: [Placement; 3] = [Placement::Center, Placement::Infra, Placement::Supra];
const BLOCK: usize = 4096;
const NBLOCKS: usize = 4;

/// Input tone frequency landing at an eighth of the output rate inside the
/// retained band.
fn tone_freq(log2_decim: u32, placement: Placement) -> f64 {
    let fs = DEFAULT_SAMP_RATE as f64;
    let offset = fs / (1u64 << (log2_decim + 3)) as f64;
    match placement {
        Placement::Center => offset,
        Placement::Infra => -fs / 4.0 + offset,
        Placement::Supra => fs / 4.0 - offset,
    }
}

/// Peak of the generated tone relative to canonical full scale.
fn input_amplitude(format: WireFormat, amplitude: f64) -> f64 {
    match format {
        WireFormat::Cf32 => amplitude,
        f => amplitude * (f.full_scale() - 1.0) / f.full_scale(),
    }
}

fn run_decimator(format: WireFormat, log2_decim: u32, placement: Placement, order: ScalarOrder) -> Vec<num::Complex<i16>> {
    run_decimator_on(tone_freq(log2_decim, placement), format, log2_decim, placement, order)
}

fn run_decimator_on(
    freq: f64,
    format: WireFormat,
    log2_decim: u32,
    placement: Placement,
    order: ScalarOrder,
) -> Vec<num::Complex<i16>> {
    let dev = SyntheticDevice::new(SyntheticConfig {
        mtu: BLOCK,
        tones: vec![Tone {
            freq,
            amplitude: 0.9,
        }],
        ..Default::default()
    });
    let mut stream = dev.open_stream(format, &[0]).expect("stream");
    let mut buffers = vec![WireBuffer::new(format, BLOCK)];
    let mut decimator = ChannelDecimator::new(format, log2_decim, placement, order).expect("decimator");

    let mut out = Vec::new();
    for _ in 0..NBLOCKS {
        let status = stream.read(&mut buffers, BLOCK, Duration::from_millis(10));
        assert_eq!(status, ReadStatus::Samples(BLOCK));
        decimator.decimate(buffers[0].slice(BLOCK), &mut out);
    }
    out
}

#[test]
fn test_passband_amplitude_all_paths() {
    for format in FORMATS {
        for log2_decim in 0..=MAX_LOG2_DECIM {
            for placement in PLACEMENTS {
                let out = run_decimator(format, log2_decim, placement, ScalarOrder::Iq);
                assert_eq!(
                    out.len(),
                    (BLOCK * NBLOCKS) >> log2_decim,
                    "{:?} e={} {:?}",
                    format,
                    log2_decim,
                    placement
                );

                let settled = &out[out.len() / 2..];
                let gain_db = 20.0 * (rms_amplitude(settled) / input_amplitude(format, 0.9)).log10();
                assert!(
                    gain_db.abs() < 0.5,
                    "{:?} e={} {:?}: {:.3} dB",
                    format,
                    log2_decim,
                    placement,
                    gain_db
                );
            }
        }
    }
}

#[test]
fn test_stopband_rejected() {
    // a tone in the discarded half of the spectrum must not survive
    let dev = SyntheticDevice::new(SyntheticConfig {
        mtu: BLOCK,
        tones: vec![Tone {
            freq: tone_freq(3, Placement::Supra),
            amplitude: 0.9,
        }],
        ..Default::default()
    });
    let mut stream = dev.open_stream(WireFormat::Cs16, &[0]).expect("stream");
    let mut buffers = vec![WireBuffer::new(WireFormat::Cs16, BLOCK)];
    let mut decimator =
        ChannelDecimator::new(WireFormat::Cs16, 3, Placement::Infra, ScalarOrder::Iq).expect("decimator");

    let mut out = Vec::new();
    for _ in 0..NBLOCKS {
        stream.read(&mut buffers, BLOCK, Duration::from_millis(10));
        decimator.decimate(buffers[0].slice(BLOCK), &mut out);
    }
    let settled = &out[out.len() / 2..];
    assert!(20.0 * rms_amplitude(settled).log10() < -40.0);
}

#[test]
fn test_qi_order_mirrors_spectrum() {
    // without rate change a swapped pair comes out swapped
    let iq = run_decimator(WireFormat::Cs16, 0, Placement::Center, ScalarOrder::Iq);
    let qi = run_decimator(WireFormat::Cs16, 0, Placement::Center, ScalarOrder::Qi);
    for (a, b) in iq.iter().zip(&qi) {
        assert_eq!((a.re, a.im), (b.im, b.re));
    }
}

#[test]
fn test_qi_order_through_offset_bands() {
    // swapping I and Q mirrors the spectrum, so a lower-band tone read
    // Q first shows up in the upper band
    let freq = tone_freq(3, Placement::Infra);
    let db = |out: &[num::Complex<i16>]| {
        let settled = &out[out.len() / 2..];
        20.0 * (rms_amplitude(settled) / input_amplitude(WireFormat::Cs16, 0.9)).log10()
    };

    let supra = run_decimator_on(freq, WireFormat::Cs16, 3, Placement::Supra, ScalarOrder::Qi);
    assert_eq!(supra.len(), (BLOCK * NBLOCKS) >> 3);
    let gain_db = db(&supra);
    assert!(gain_db.abs() < 0.5, "supra {:.3} dB", gain_db);

    let infra = run_decimator_on(freq, WireFormat::Cs16, 3, Placement::Infra, ScalarOrder::Qi);
    let gain_db = db(&infra);
    assert!(gain_db < -40.0, "infra {:.3} dB", gain_db);
}
