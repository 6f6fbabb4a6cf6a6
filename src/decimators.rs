//! Per-channel decimator bank.
//!
//! A [`Decimator`] is generic over the wire [`Codec`], the spectral
//! [`Shift`] and the scalar order, so every format x placement x order
//! combination is a separate monomorphized loop. The combination is chosen
//! once, when a channel is configured, by [`ChannelDecimator::new`].
//!
//! Rate reduction is a cascade of `log2_decim` half-band stages. Centre
//! placement keeps the band around DC. Infra and supra first rotate the input
//! by +fs/4 or -fs/4 so that the lower or upper half of the spectrum lands on
//! DC before the same cascade runs.

use std::marker::PhantomData;

use num::Complex;

use crate::codec::{Cf32, Codec, Cs8, Cs12, Cs16, ScalarOrder, WireFormat, WireSlice, convert};
use crate::halfband::HalfBand;
use crate::sample::{Accu, Sample, saturate};
use crate::{Error, MAX_LOG2_DECIM, Result};

/// Which part of the input spectrum survives decimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    /// Band just below the hardware centre frequency
    Infra,
    /// Band just above the hardware centre frequency
    Supra,
    #[default]
    Center,
}

/// Offset in Hz of the retained band relative to the hardware centre.
pub fn frequency_shift(log2_decim: u32, placement: Placement, device_rate: u32) -> i64 {
    if log2_decim == 0 {
        return 0;
    }
    match placement {
        Placement::Infra => -(device_rate as i64) / 4,
        Placement::Supra => device_rate as i64 / 4,
        Placement::Center => 0,
    }
}

/// Output sample rate of a channel.
pub fn output_rate(device_rate: u32, log2_decim: u32) -> u32 {
    device_rate >> log2_decim.min(MAX_LOG2_DECIM)
}

/// Per-sample spectral rotation applied before the cascade, in quarter turns.
pub trait Shift: Send + 'static {
    const PLACEMENT: Placement;
    const QUARTER_TURNS: u8;
}

pub struct CenterShift;
pub struct InfraShift;
pub struct SupraShift;

impl Shift for CenterShift {
    const PLACEMENT: Placement = Placement::Center;
    const QUARTER_TURNS: u8 = 0;
}

impl Shift for InfraShift {
    const PLACEMENT: Placement = Placement::Infra;
    // multiply by j^n: +fs/4
    const QUARTER_TURNS: u8 = 1;
}

impl Shift for SupraShift {
    const PLACEMENT: Placement = Placement::Supra;
    // multiply by (-j)^n: -fs/4
    const QUARTER_TURNS: u8 = 3;
}

#[inline(always)]
fn rotate(x: Accu, quarter: u8) -> Accu {
    match quarter & 3 {
        0 => x,
        1 => Complex::new(-x.im, x.re),
        2 => Complex::new(-x.re, -x.im),
        _ => Complex::new(x.im, -x.re),
    }
}

/// Object-safe face of a decimator over one wire scalar type.
pub trait Decimate<T>: Send {
    /// Consume `input` (interleaved scalar pairs) and append the decimated
    /// samples to `out`. Returns the number of samples appended.
    fn decimate(&mut self, input: &[T], out: &mut Vec<Sample>) -> usize;

    fn log2_decim(&self) -> u32;

    fn placement(&self) -> Placement;

    /// Clear delay lines and rotation phase.
    fn reset(&mut self);
}

/// Long-lived decimator for one channel.
pub struct Decimator<C: Codec, S: Shift, const QI: bool> {
    stages: Vec<HalfBand>,
    phase: u8,
    work: Vec<Accu>,
    _codec: PhantomData<fn() -> (C, S)>,
}

impl<C: Codec, S: Shift, const QI: bool> Decimator<C, S, QI> {
    pub fn new(log2_decim: u32) -> Self {
        Self {
            stages: (0..log2_decim).map(|_| HalfBand::new()).collect(),
            phase: 0,
            work: Vec::new(),
            _codec: PhantomData,
        }
    }

    fn rotate_work(&mut self) {
        let mut phase = self.phase;
        for x in self.work.iter_mut() {
            *x = rotate(*x, phase.wrapping_mul(S::QUARTER_TURNS));
            phase = (phase + 1) & 3;
        }
        self.phase = phase;
    }
}

impl<C: Codec, S: Shift, const QI: bool> Decimate<C::Scalar> for Decimator<C, S, QI> {
    fn decimate(&mut self, input: &[C::Scalar], out: &mut Vec<Sample>) -> usize {
        self.work.clear();
        convert::<C, QI>(input, &mut self.work);

        if S::QUARTER_TURNS != 0 {
            self.rotate_work();
        }
        for stage in self.stages.iter_mut() {
            stage.decimate_in_place(&mut self.work);
        }

        out.extend(self.work.iter().map(|&x| saturate(x)));
        self.work.len()
    }

    fn log2_decim(&self) -> u32 {
        self.stages.len() as u32
    }

    fn placement(&self) -> Placement {
        S::PLACEMENT
    }

    fn reset(&mut self) {
        self.stages.iter_mut().for_each(HalfBand::reset);
        self.phase = 0;
    }
}

fn build<C: Codec>(
    log2_decim: u32,
    placement: Placement,
    order: ScalarOrder,
) -> Box<dyn Decimate<C::Scalar>> {
    // without rate change there is nothing to place
    let placement = if log2_decim == 0 {
        Placement::Center
    } else {
        placement
    };

    match (placement, order) {
        (Placement::Center, ScalarOrder::Iq) => {
            Box::new(Decimator::<C, CenterShift, false>::new(log2_decim))
        }
        (Placement::Center, ScalarOrder::Qi) => {
            Box::new(Decimator::<C, CenterShift, true>::new(log2_decim))
        }
        (Placement::Infra, ScalarOrder::Iq) => {
            Box::new(Decimator::<C, InfraShift, false>::new(log2_decim))
        }
        (Placement::Infra, ScalarOrder::Qi) => {
            Box::new(Decimator::<C, InfraShift, true>::new(log2_decim))
        }
        (Placement::Supra, ScalarOrder::Iq) => {
            Box::new(Decimator::<C, SupraShift, false>::new(log2_decim))
        }
        (Placement::Supra, ScalarOrder::Qi) => {
            Box::new(Decimator::<C, SupraShift, true>::new(log2_decim))
        }
    }
}

/// Decimator of one channel, tagged by wire format.
pub enum ChannelDecimator {
    Cs8(Box<dyn Decimate<i8>>),
    Cs12(Box<dyn Decimate<i16>>),
    Cs16(Box<dyn Decimate<i16>>),
    Cf32(Box<dyn Decimate<f32>>),
}

impl ChannelDecimator {
    pub fn new(
        format: WireFormat,
        log2_decim: u32,
        placement: Placement,
        order: ScalarOrder,
    ) -> Result<Self> {
        if log2_decim > MAX_LOG2_DECIM {
            return Err(Error::InvalidDecimation(log2_decim));
        }

        Ok(match format {
            WireFormat::Cs8 => ChannelDecimator::Cs8(build::<Cs8>(log2_decim, placement, order)),
            WireFormat::Cs12 => {
                ChannelDecimator::Cs12(build::<Cs12>(log2_decim, placement, order))
            }
            WireFormat::Cs16 => {
                ChannelDecimator::Cs16(build::<Cs16>(log2_decim, placement, order))
            }
            WireFormat::Cf32 => {
                ChannelDecimator::Cf32(build::<Cf32>(log2_decim, placement, order))
            }
        })
    }

    pub fn format(&self) -> WireFormat {
        match self {
            ChannelDecimator::Cs8(_) => WireFormat::Cs8,
            ChannelDecimator::Cs12(_) => WireFormat::Cs12,
            ChannelDecimator::Cs16(_) => WireFormat::Cs16,
            ChannelDecimator::Cf32(_) => WireFormat::Cf32,
        }
    }

    pub fn log2_decim(&self) -> u32 {
        match self {
            ChannelDecimator::Cs8(d) => d.log2_decim(),
            ChannelDecimator::Cs12(d) | ChannelDecimator::Cs16(d) => d.log2_decim(),
            ChannelDecimator::Cf32(d) => d.log2_decim(),
        }
    }

    /// Effective placement; always centre when there is no rate change.
    pub fn placement(&self) -> Placement {
        match self {
            ChannelDecimator::Cs8(d) => d.placement(),
            ChannelDecimator::Cs12(d) | ChannelDecimator::Cs16(d) => d.placement(),
            ChannelDecimator::Cf32(d) => d.placement(),
        }
    }

    pub fn reset(&mut self) {
        match self {
            ChannelDecimator::Cs8(d) => d.reset(),
            ChannelDecimator::Cs12(d) | ChannelDecimator::Cs16(d) => d.reset(),
            ChannelDecimator::Cf32(d) => d.reset(),
        }
    }

    /// Decimate one contiguous slice of the channel's stream.
    ///
    /// A slice whose container does not match the decimator's format yields
    /// nothing.
    pub fn decimate(&mut self, input: WireSlice<'_>, out: &mut Vec<Sample>) -> usize {
        match (self, input) {
            (ChannelDecimator::Cs8(d), WireSlice::I8(b)) => d.decimate(b, out),
            (ChannelDecimator::Cs12(d), WireSlice::I16(b)) => d.decimate(b, out),
            (ChannelDecimator::Cs16(d), WireSlice::I16(b)) => d.decimate(b, out),
            (ChannelDecimator::Cf32(d), WireSlice::F32(b)) => d.decimate(b, out),
            (d, _) => {
                log::error!("wire slice does not match {:?} decimator", d.format());
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_copy() {
        let mut d = ChannelDecimator::new(WireFormat::Cs16, 0, Placement::Supra, ScalarOrder::Iq)
            .expect("decimator");
        assert_eq!(d.placement(), Placement::Center);
        let wire: Vec<i16> = (0..64).collect();
        let mut out = Vec::new();
        assert_eq!(d.decimate(WireSlice::I16(&wire), &mut out), 32);
        assert_eq!(out[3], Complex::new(6, 7));
    }

    #[test]
    fn test_rejects_exponent_above_six() {
        assert!(matches!(
            ChannelDecimator::new(WireFormat::Cs8, 7, Placement::Center, ScalarOrder::Iq),
            Err(Error::InvalidDecimation(7))
        ));
    }

    #[test]
    fn test_mismatched_slice_yields_nothing() {
        let mut d = ChannelDecimator::new(WireFormat::Cs8, 1, Placement::Center, ScalarOrder::Iq)
            .expect("decimator");
        let mut out = Vec::new();
        assert_eq!(d.decimate(WireSlice::F32(&[0.0; 8]), &mut out), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_rotation_phase_carries_across_calls() {
        // a DC input rotated by +fs/4 must follow 1, j, -1, -j regardless of
        // how the stream is split
        let mut whole = Decimator::<Cs16, InfraShift, false>::new(0);
        let mut split = Decimator::<Cs16, InfraShift, false>::new(0);
        let wire: Vec<i16> = [100i16, 0].repeat(8);

        let mut a = Vec::new();
        whole.decimate(&wire, &mut a);
        let mut b = Vec::new();
        split.decimate(&wire[..6], &mut b);
        split.decimate(&wire[6..], &mut b);

        assert_eq!(a, b);
        assert_eq!(&a[..4], &[
            Complex::new(100, 0),
            Complex::new(0, 100),
            Complex::new(-100, 0),
            Complex::new(0, -100),
        ]);
    }

    #[test]
    fn test_frequency_shift() {
        assert_eq!(frequency_shift(0, Placement::Infra, 4_000_000), 0);
        assert_eq!(frequency_shift(3, Placement::Infra, 4_000_000), -1_000_000);
        assert_eq!(frequency_shift(3, Placement::Supra, 4_000_000), 1_000_000);
        assert_eq!(frequency_shift(3, Placement::Center, 4_000_000), 0);
        assert_eq!(output_rate(4_000_000, 3), 500_000);
    }
}
