use crate::convert::SampleEncoding;
use crate::device::{Direction, host_error_text};
use thiserror::Error;

/// Errors surfaced by the host adapter.
///
/// Real-time transients (missed periods, input overflow, output underflow)
/// are never reported through this type; they accumulate as status flags and
/// are delivered to the next processor invocation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("requested {requested} {direction} channels, device has {available}")]
    InvalidChannelCount {
        direction: Direction,
        requested: usize,
        available: usize,
    },

    #[error("{direction} channel selector {selector} out of range (device has {available} channels)")]
    InvalidChannelSelector {
        direction: Direction,
        selector: u32,
        available: usize,
    },

    #[error("device sample encoding {0:?} is not supported")]
    UnsupportedSampleEncoding(SampleEncoding),

    #[error("no granted {direction} slot is stamped with physical channel {channel}")]
    ChannelMapMismatch { direction: Direction, channel: u32 },

    #[error("no host buffer size in [{min}, {max}] is a multiple of {user_frames}")]
    NoCompatibleBufferSize {
        min: usize,
        max: usize,
        user_frames: usize,
    },

    #[error("another stream already has the device open")]
    DeviceUnavailable,

    #[error("driver rejected buffer creation at {frames} frames and at its preferred size: {text} ({code})")]
    BufferCreation {
        frames: usize,
        code: i32,
        text: &'static str,
    },

    #[error("driver error: {text} ({code})")]
    Host { code: i32, text: &'static str },

    #[error("stream must be stopped first")]
    StreamNotStopped,

    #[error("graceful stop timed out waiting for drain completion")]
    DrainTimeout,

    #[error("blocking read/write timed out waiting for the switch callback")]
    IoTimeout,
}

impl Error {
    /// Wrap a driver-reported status code, keeping its canonical text.
    pub fn host(code: i32) -> Self {
        Error::Host {
            code,
            text: host_error_text(code),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
