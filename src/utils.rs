use std::slice::from_raw_parts;
use std::sync::{Mutex, MutexGuard, PoisonError};

use num::Complex;
use rustfft::FftPlanner;

use crate::sample::{FULL_SCALE, Sample};

pub fn slice_as_u8<T: Sized>(x: &[T]) -> &[u8] {
    unsafe { from_raw_parts(x.as_ptr() as *const u8, std::mem::size_of_val(x)) }
}

/// Lock a mutex, carrying on with the inner value if a holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn normalized(samples: &[Sample]) -> Vec<Complex<f32>> {
    let scale = 1.0 / FULL_SCALE as f32;
    samples
        .iter()
        .map(|x| Complex::new(x.re as f32 * scale, x.im as f32 * scale))
        .collect()
}

/// RMS magnitude of a block relative to full scale.
pub fn rms_amplitude(samples: &[Sample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let power: f64 = normalized(samples)
        .iter()
        .map(|x| x.norm_sqr() as f64)
        .sum::<f64>()
        / samples.len() as f64;
    power.sqrt()
}

/// Strongest FFT bin of a block: its frequency in Hz (negative below DC) and
/// its level in dBFS.
pub fn peak_bin(samples: &[Sample], sample_rate: f64) -> Option<(f64, f64)> {
    let n = samples.len();
    if n == 0 {
        return None;
    }
    let mut buf = normalized(samples);
    let fft = FftPlanner::<f32>::new().plan_fft_forward(n);
    fft.process(&mut buf);

    let (k, x) = buf
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.norm_sqr().total_cmp(&b.1.norm_sqr()))?;

    let bin = if k > n / 2 { k as f64 - n as f64 } else { k as f64 };
    let level = 20.0 * (x.norm() as f64 / n as f64).max(1e-12).log10();
    Some((bin * sample_rate / n as f64, level))
}
