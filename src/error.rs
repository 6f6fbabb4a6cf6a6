//! Error types for the acquisition engine

use crate::MAX_LOG2_DECIM;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("hardware error: {0}")]
    Hardware(String),

    #[error("channel index {index} out of range ({count} channels)")]
    ChannelOutOfRange { index: usize, count: usize },

    #[error("log2 decimation {0} out of range (0..={MAX_LOG2_DECIM})")]
    InvalidDecimation(u32),

    #[error("channel {0} is already attached to a consumer")]
    ChannelInUse(usize),

    #[error("no destination FIFO set on any channel")]
    NoActiveChannel,

    #[error("consumer {0} is not attached to this device")]
    UnknownConsumer(u64),

    #[error("consumer {0} does not own the acquisition thread")]
    NotOwner(u64),

    #[error("failed to spawn acquisition thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("device refused to start: {0}")]
    Refused(Box<Error>),
}

pub type Result<T = ()> = std::result::Result<T, Error>;
