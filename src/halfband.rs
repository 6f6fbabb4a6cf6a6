//! Fixed-point half-band decimate-by-2 stage.
//!
//! A 47-tap half-band low-pass: every other tap is zero and the centre tap is
//! exactly one half, so one output costs 12 symmetric multiplies plus the
//! centre. Coefficients are Q15; the passband (up to 0.2 fs) is flat within
//! 0.02 dB and the stopband (from 0.3 fs) is below -56 dB.

use num::Complex;

use crate::sample::Accu;

/// Number of taps of the prototype filter.
pub const HB_TAPS: usize = 47;

const HB_CENTER: usize = HB_TAPS / 2;
const HB_SHIFT: u32 = 15;

/// Non-zero side taps h[0], h[2] ... h[22] in Q15. They sum to 1/4 so that
/// the DC gain is exactly one.
const HB_SIDE: [i64; 12] = [
    -33, 56, -100, 166, -259, 389, -571, 829, -1220, 1885, -3353, 10403,
];

const HB_MID: i64 = 1 << (HB_SHIFT - 1);

/// One decimate-by-2 stage with its delay line.
///
/// The stage is stateful: consecutive calls must be fed a contiguous stream.
/// An odd trailing input is kept and paired with the first input of the
/// next call.
#[derive(Clone)]
pub struct HalfBand {
    // double-length ring so the newest HB_TAPS samples are always contiguous
    ring: [Accu; 2 * HB_TAPS],
    ptr: usize,
    odd: bool,
}

impl Default for HalfBand {
    fn default() -> Self {
        Self::new()
    }
}

impl HalfBand {
    pub fn new() -> Self {
        Self {
            ring: [Complex::new(0, 0); 2 * HB_TAPS],
            ptr: 0,
            odd: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    #[inline(always)]
    fn store(&mut self, x: Accu) {
        self.ring[self.ptr] = x;
        self.ring[self.ptr + HB_TAPS] = x;
        self.ptr += 1;
        if self.ptr == HB_TAPS {
            self.ptr = 0;
        }
    }

    /// Filter output for the current window (oldest at index 0).
    #[inline(always)]
    fn fir(&self) -> Accu {
        let win = &self.ring[self.ptr..self.ptr + HB_TAPS];
        let mid = win[HB_CENTER];
        let mut re = (mid.re as i64) << (HB_SHIFT - 1);
        let mut im = (mid.im as i64) << (HB_SHIFT - 1);

        for (k, &c) in HB_SIDE.iter().enumerate() {
            let a = win[2 * k];
            let b = win[HB_TAPS - 1 - 2 * k];
            re += c * (a.re as i64 + b.re as i64);
            im += c * (a.im as i64 + b.im as i64);
        }

        Complex::new(
            ((re + HB_MID) >> HB_SHIFT) as i32,
            ((im + HB_MID) >> HB_SHIFT) as i32,
        )
    }

    /// Push one input; returns an output on every second call.
    #[inline]
    pub fn push(&mut self, x: Accu) -> Option<Accu> {
        self.store(x);
        self.odd = !self.odd;
        if self.odd { None } else { Some(self.fir()) }
    }

    /// Decimate `buf` by two in place, keeping the stage phase across calls.
    pub fn decimate_in_place(&mut self, buf: &mut Vec<Accu>) {
        let mut out = 0;
        for i in 0..buf.len() {
            if let Some(y) = self.push(buf[i]) {
                // out <= i / 2, never overtakes the read index
                buf[out] = y;
                out += 1;
            }
        }
        buf.truncate(out);
    }
}
