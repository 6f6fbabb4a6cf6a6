use num::Complex;

/// Bit width of the canonical fixed-point sample.
pub const SAMPLE_BITS: u32 = 16;

/// Magnitude of a full-scale canonical component.
pub const FULL_SCALE: i32 = 1 << (SAMPLE_BITS - 1);

/// Canonical complex sample delivered to consumers, independent of wire format.
pub type Sample = Complex<i16>;

/// Working sample carried through the decimation cascade at canonical scale,
/// with headroom above [`SAMPLE_BITS`].
pub type Accu = Complex<i32>;

#[inline(always)]
fn saturate_scalar(x: i32) -> i16 {
    x.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

/// Narrow a working sample to the canonical width.
#[inline(always)]
pub fn saturate(x: Accu) -> Sample {
    Complex::new(saturate_scalar(x.re), saturate_scalar(x.im))
}

/// One block of decimated samples as written to a destination FIFO.
#[derive(Debug, Default)]
pub struct SampleBlock {
    /// Per-channel block counter, incremented for every block produced.
    pub seq: u64,
    /// Set on the first block after a (re)start or a hardware overflow.
    pub discontinuity: bool,
    pub samples: Vec<Sample>,
}

impl SampleBlock {
    pub fn reset(&mut self) {
        self.seq = 0;
        self.discontinuity = false;
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturate() {
        assert_eq!(saturate(Complex::new(40000, -40000)), Complex::new(32767, -32768));
        assert_eq!(saturate(Complex::new(-5, 7)), Complex::new(-5, 7));
    }
}
