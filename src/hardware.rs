//! Hardware abstraction consumed by the acquisition thread.
//!
//! Return codes follow the SoapySDR convention so that a native backend can
//! pass them through unchanged.

use std::time::Duration;

use crate::Result;
use crate::codec::{WireBuffer, WireFormat};

pub const ERR_TIMEOUT: i32 = -1;
pub const ERR_STREAM: i32 = -2;
pub const ERR_CORRUPTION: i32 = -3;
pub const ERR_OVERFLOW: i32 = -4;
pub const ERR_NOT_SUPPORTED: i32 = -5;
pub const ERR_TIME: i32 = -6;
pub const ERR_UNDERFLOW: i32 = -7;

pub fn err_to_str(code: i32) -> &'static str {
    match code {
        ERR_TIMEOUT => "TIMEOUT",
        ERR_STREAM => "STREAM_ERROR",
        ERR_CORRUPTION => "CORRUPTION",
        ERR_OVERFLOW => "OVERFLOW",
        ERR_NOT_SUPPORTED => "NOT_SUPPORTED",
        ERR_TIME => "TIME_ERROR",
        ERR_UNDERFLOW => "UNDERFLOW",
        _ => "UNKNOWN",
    }
}

/// Outcome of one blocking stream read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Complex samples written to every channel buffer.
    Samples(usize),
    /// Nothing arrived within the timeout.
    Timeout,
    /// Samples were lost upstream; buffers hold whatever the driver left.
    Overflow,
    /// Unrecoverable stream error.
    Fatal(i32),
}

impl ReadStatus {
    pub fn from_code(ret: i32) -> Self {
        match ret {
            ERR_TIMEOUT => ReadStatus::Timeout,
            ERR_OVERFLOW => ReadStatus::Overflow,
            r if r < 0 => ReadStatus::Fatal(r),
            n => ReadStatus::Samples(n as usize),
        }
    }
}

/// An open receive stream. Dropping it closes the stream.
pub trait RxStream: Send {
    /// Largest number of complex samples one read may return per channel.
    fn mtu(&self) -> usize;

    fn activate(&mut self) -> Result<()>;

    fn deactivate(&mut self) -> Result<()>;

    /// Block until up to `max_samples` samples per channel are available in
    /// `buffers` (one buffer per stream channel) or `timeout` expires.
    fn read(&mut self, buffers: &mut [WireBuffer], max_samples: usize, timeout: Duration)
    -> ReadStatus;
}

/// A physical receiver shared by every consumer of its channels.
pub trait Device: Send + Sync {
    fn label(&self) -> String;

    fn set_sample_rate(&self, channel: usize, rate: u32) -> Result<()>;

    /// Native stream format of `channel` and its full-scale value.
    fn native_format(&self, channel: usize) -> (String, f64);

    /// Set up a receive stream over `channels` in the given wire format.
    fn open_stream(&self, format: WireFormat, channels: &[usize]) -> Result<Box<dyn RxStream>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_code() {
        assert_eq!(ReadStatus::from_code(4096), ReadStatus::Samples(4096));
        assert_eq!(ReadStatus::from_code(0), ReadStatus::Samples(0));
        assert_eq!(ReadStatus::from_code(ERR_TIMEOUT), ReadStatus::Timeout);
        assert_eq!(ReadStatus::from_code(ERR_OVERFLOW), ReadStatus::Overflow);
        assert_eq!(ReadStatus::from_code(ERR_STREAM), ReadStatus::Fatal(ERR_STREAM));
        assert_eq!(err_to_str(ERR_CORRUPTION), "CORRUPTION");
    }
}
