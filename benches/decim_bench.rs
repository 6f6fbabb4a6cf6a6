use std::time::Duration;

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use sdracq::codec::{ScalarOrder, WireBuffer, WireFormat, decode};
use sdracq::decimators::{ChannelDecimator, Placement};
use sdracq::hardware::{Device, RxStream};
use sdracq::synthetic::{SyntheticConfig, SyntheticDevice, Tone};

const BLOCK: usize = 65536;

fn wire_block(format: WireFormat) -> WireBuffer {
    let dev = SyntheticDevice::new(SyntheticConfig {
        mtu: BLOCK,
        tones: vec![Tone {
            freq: 100_000.0,
            amplitude: 0.7,
        }],
        noise: 0.01,
        ..Default::default()
    });
    let mut stream = dev.open_stream(format, &[0]).expect("stream");
    let mut buffers = vec![WireBuffer::new(format, BLOCK)];
    stream.read(&mut buffers, BLOCK, Duration::from_millis(10));
    buffers.remove(0)
}

fn bench_decimate(c: &mut Criterion) {
    for format in [WireFormat::Cs8, WireFormat::Cs16, WireFormat::Cf32] {
        let block = wire_block(format);
        for (log2_decim, placement) in [(1, Placement::Center), (4, Placement::Center), (4, Placement::Supra), (6, Placement::Infra)] {
            let mut d = ChannelDecimator::new(format, log2_decim, placement, ScalarOrder::Iq).expect("decimator");
            let mut out = Vec::with_capacity(BLOCK);
            let name = format!("decim_{}_e{}_{:?}", format.stream_format(), log2_decim, placement);
            c.bench_function(&name, |b| {
                b.iter(|| {
                    out.clear();
                    d.decimate(black_box(block.slice(BLOCK)), &mut out);
                    black_box(&out);
                })
            });
        }
    }
}

fn bench_decode(c: &mut Criterion) {
    let block = wire_block(WireFormat::Cs16);
    let mut out = Vec::with_capacity(BLOCK);
    c.bench_function("decode_cs16_65536", |b| {
        b.iter(|| {
            out.clear();
            decode(black_box(block.slice(BLOCK)), WireFormat::Cs16, ScalarOrder::Qi, &mut out);
            black_box(&out);
        })
    });
}

criterion_group!(benches, bench_decimate, bench_decode);
criterion_main!(benches);
