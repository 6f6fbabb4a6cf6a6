use std::time::Duration;

use crate::DEFAULT_SAMP_RATE;

/// Engine-wide tunables shared by every acquisition thread of a device.
#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    /// Device sample rate applied when a thread starts, in S/s.
    pub sample_rate: u32,
    /// Depth of destination FIFOs created for consumers, in blocks.
    pub fifo_depth: usize,
    /// Block size used when the stream reports an MTU of zero.
    pub fallback_mtu: usize,
    /// Lower bound of the per-read timeout.
    pub min_read_timeout: Duration,
    /// Read timeout as a multiple of one block duration.
    pub timeout_blocks: u32,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMP_RATE,
            fifo_depth: 64,
            fallback_mtu: 65536,
            min_read_timeout: Duration::from_millis(250),
            timeout_blocks: 10,
        }
    }
}

impl AcquisitionConfig {
    /// Timeout for one blocking read of `mtu` samples at `sample_rate`.
    ///
    /// Ten block durations, never less than 250 ms by default. A zero rate
    /// is treated as [`DEFAULT_SAMP_RATE`].
    pub fn read_timeout(&self, mtu: usize, sample_rate: u32) -> Duration {
        let rate = if sample_rate == 0 {
            DEFAULT_SAMP_RATE
        } else {
            sample_rate
        };
        let block = Duration::from_secs_f64(mtu as f64 / rate as f64);
        (block * self.timeout_blocks).max(self.min_read_timeout)
    }
}
