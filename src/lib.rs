//! Real-time audio hardware host adapter.
//!
//! This crate negotiates a device's native buffer layout against the
//! channel layout an application asks for, selects a host buffer size from
//! the device's constraints, and drives the device's double-buffered switch
//! callback with reentrancy protection, in-place sample format conversion,
//! and orderly start/stop/abort semantics.
//!
//! The driver side is abstracted behind [`HostDevice`]; the application
//! side implements [`StreamProcessor`] (or uses [`BlockingStream`] for
//! synchronous I/O) and controls the stream through [`Stream`].

pub mod blocking;
pub mod buffer_size;
pub mod channels;
pub mod convert;
pub mod device;
pub mod dummy;
mod error;
pub mod options;
mod stream;
mod switch;
mod sync;

pub use blocking::BlockingStream;
pub use channels::ChannelRequest;
pub use convert::{CanonicalFormat, SampleEncoding};
pub use device::{
    BufferSizeRange, DeviceCapabilities, Direction, GrantedSlot, HostDevice, SlotRequest,
    StreamLatency,
};
pub use error::{Error, Result};
pub use options::{BufferSizePolicy, StreamOptions};
pub use stream::{LatencySeconds, Stream, StreamState};
pub use switch::{
    ProcessIo, ProcessResult, StatusFlags, StreamProcessor, StreamTime, SwitchHandle,
};
