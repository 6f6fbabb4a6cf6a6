//! Wire sample formats and their conversion to the canonical sample.
//!
//! Hardware delivers interleaved scalar pairs in one of four encodings. Each
//! encoding is a zero-sized [`Codec`] so that the conversion is resolved at
//! compile time and the per-sample loop carries no format dispatch.

use num::Complex;

use crate::sample::{Accu, Sample, SAMPLE_BITS, saturate};

/// Encoding of the raw samples delivered by the hardware stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireFormat {
    /// 8-bit signed pairs, full scale 128
    Cs8,
    /// 12-bit signed values in 16-bit words, full scale 2048
    Cs12,
    /// 16-bit signed pairs, full scale 32768
    Cs16,
    /// 32-bit float pairs, full scale 1.0
    Cf32,
}

impl WireFormat {
    /// Pick the wire format from the device's native format probe.
    ///
    /// Anything outside the three native integer buckets is streamed as
    /// `CF32` and converted by the hardware layer.
    pub fn from_native(format: &str, full_scale: f64) -> WireFormat {
        match format {
            "CS8" if full_scale == 128.0 => WireFormat::Cs8,
            "CS16" if full_scale == 2048.0 => WireFormat::Cs12,
            "CS16" if full_scale == 32768.0 => WireFormat::Cs16,
            _ => WireFormat::Cf32,
        }
    }

    /// Format string requested when the stream is set up.
    pub fn stream_format(&self) -> &'static str {
        match self {
            WireFormat::Cs8 => "CS8",
            WireFormat::Cs12 | WireFormat::Cs16 => "CS16",
            WireFormat::Cf32 => "CF32",
        }
    }

    /// Size in bytes of one complex (I+Q) element.
    pub fn element_size(&self) -> usize {
        match self {
            WireFormat::Cs8 => 2,
            WireFormat::Cs12 | WireFormat::Cs16 => 4,
            WireFormat::Cf32 => 8,
        }
    }

    /// Full-scale magnitude of one scalar in wire units.
    pub fn full_scale(&self) -> f64 {
        match self {
            WireFormat::Cs8 => 128.0,
            WireFormat::Cs12 => 2048.0,
            WireFormat::Cs16 => 32768.0,
            WireFormat::Cf32 => 1.0,
        }
    }
}

/// Scalar order inside each wire pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScalarOrder {
    #[default]
    Iq,
    Qi,
}

/// Compile-time description of one wire format.
pub trait Codec: Send + 'static {
    type Scalar: Copy + Default + Send + Sync + 'static;
    const FORMAT: WireFormat;

    /// Scale one wire scalar to canonical [`SAMPLE_BITS`] units.
    fn to_fixed(x: Self::Scalar) -> i32;
}

pub struct Cs8;
pub struct Cs12;
pub struct Cs16;
pub struct Cf32;

impl Codec for Cs8 {
    type Scalar = i8;
    const FORMAT: WireFormat = WireFormat::Cs8;

    #[inline(always)]
    fn to_fixed(x: i8) -> i32 {
        (x as i32) << (SAMPLE_BITS - 8)
    }
}

impl Codec for Cs12 {
    type Scalar = i16;
    const FORMAT: WireFormat = WireFormat::Cs12;

    #[inline(always)]
    fn to_fixed(x: i16) -> i32 {
        (x as i32) << (SAMPLE_BITS - 12)
    }
}

impl Codec for Cs16 {
    type Scalar = i16;
    const FORMAT: WireFormat = WireFormat::Cs16;

    #[inline(always)]
    fn to_fixed(x: i16) -> i32 {
        x as i32
    }
}

impl Codec for Cf32 {
    type Scalar = f32;
    const FORMAT: WireFormat = WireFormat::Cf32;

    #[inline(always)]
    fn to_fixed(x: f32) -> i32 {
        const SCALE: f32 = (1 << (SAMPLE_BITS - 1)) as f32;
        // NaN saturates to 0 in the cast
        (x * SCALE).round().clamp(-SCALE, SCALE - 1.0) as i32
    }
}

/// Convert one wire pair. `QI` swaps the scalar order.
#[inline(always)]
pub fn to_accu<C: Codec, const QI: bool>(pair: &[C::Scalar]) -> Accu {
    let (i, q) = if QI { (pair[1], pair[0]) } else { (pair[0], pair[1]) };
    Complex::new(C::to_fixed(i), C::to_fixed(q))
}

/// Append the converted pairs of `input` to `out`. A trailing odd scalar is ignored.
pub fn convert<C: Codec, const QI: bool>(input: &[C::Scalar], out: &mut Vec<Accu>) {
    out.extend(input.chunks_exact(2).map(to_accu::<C, QI>));
}

fn decode_as<C: Codec>(input: &[C::Scalar], order: ScalarOrder, out: &mut Vec<Sample>) {
    let mut work = Vec::with_capacity(input.len() / 2);
    match order {
        ScalarOrder::Iq => convert::<C, false>(input, &mut work),
        ScalarOrder::Qi => convert::<C, true>(input, &mut work),
    }
    out.extend(work.into_iter().map(saturate));
}

/// Convert a wire slice to canonical samples without rate change.
///
/// `format` disambiguates 12- and 16-bit data which share a 16-bit container.
pub fn decode(input: WireSlice<'_>, format: WireFormat, order: ScalarOrder, out: &mut Vec<Sample>) {
    match (input, format) {
        (WireSlice::I8(b), _) => decode_as::<Cs8>(b, order, out),
        (WireSlice::I16(b), WireFormat::Cs12) => decode_as::<Cs12>(b, order, out),
        (WireSlice::I16(b), _) => decode_as::<Cs16>(b, order, out),
        (WireSlice::F32(b), _) => decode_as::<Cf32>(b, order, out),
    }
}

/// Per-channel receive buffer sized for one stream MTU.
#[derive(Debug, Clone)]
pub enum WireBuffer {
    I8(Vec<i8>),
    I16(Vec<i16>),
    F32(Vec<f32>),
}

impl WireBuffer {
    pub fn new(format: WireFormat, samples: usize) -> Self {
        match format {
            WireFormat::Cs8 => WireBuffer::I8(vec![0; samples * 2]),
            WireFormat::Cs12 | WireFormat::Cs16 => WireBuffer::I16(vec![0; samples * 2]),
            WireFormat::Cf32 => WireBuffer::F32(vec![0.0; samples * 2]),
        }
    }

    /// Capacity in complex samples.
    pub fn capacity(&self) -> usize {
        match self {
            WireBuffer::I8(b) => b.len() / 2,
            WireBuffer::I16(b) => b.len() / 2,
            WireBuffer::F32(b) => b.len() / 2,
        }
    }

    /// The first `samples` complex samples, clamped to capacity.
    pub fn slice(&self, samples: usize) -> WireSlice<'_> {
        let n = samples.min(self.capacity()) * 2;
        match self {
            WireBuffer::I8(b) => WireSlice::I8(&b[..n]),
            WireBuffer::I16(b) => WireSlice::I16(&b[..n]),
            WireBuffer::F32(b) => WireSlice::F32(&b[..n]),
        }
    }
}

/// Borrowed view of interleaved wire scalars.
#[derive(Debug, Clone, Copy)]
pub enum WireSlice<'a> {
    I8(&'a [i8]),
    I16(&'a [i16]),
    F32(&'a [f32]),
}

impl WireSlice<'_> {
    /// Number of complete complex samples.
    pub fn samples(&self) -> usize {
        match self {
            WireSlice::I8(b) => b.len() / 2,
            WireSlice::I16(b) => b.len() / 2,
            WireSlice::F32(b) => b.len() / 2,
        }
    }
}
