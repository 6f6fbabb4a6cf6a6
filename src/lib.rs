pub mod codec;
pub mod config;
pub mod decimators;
pub mod error;
pub mod fifo;
pub mod halfband;
pub mod hardware;
pub mod pipeline;
pub mod sample;
pub mod sdr;
#[cfg(feature = "soapysdr")]
pub mod soapy;
pub mod synthetic;
pub mod utils;

pub use error::{Error, Result};

/// Device sample rate used when none has been configured.
pub const DEFAULT_SAMP_RATE: u32 = 1_024_000;

/// Highest supported log2 decimation (factor 64).
pub const MAX_LOG2_DECIM: u32 = 6;
