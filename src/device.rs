//! Driver collaborator interface.
//!
//! The core never loads or enumerates drivers itself; it talks to whatever
//! implements [`HostDevice`]. Implementations are expected to wrap an FFI
//! driver handle and carry their own interior synchronization, since the
//! driver side is shared between the control thread and the switch callback
//! context.

use crate::convert::SampleEncoding;
use crate::error::Result;
use crate::switch::SwitchHandle;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => write!(f, "input"),
            Direction::Output => write!(f, "output"),
        }
    }
}

/// Device-declared buffer size constraints, in frames.
///
/// `granularity` follows the driver convention: `0` means the size is fixed
/// at `preferred`, `-1` means sizes are powers of two, a positive value is an
/// arithmetic step between valid sizes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BufferSizeRange {
    pub min: usize,
    pub max: usize,
    pub preferred: usize,
    pub granularity: i32,
}

/// Immutable snapshot of what the driver reports at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub input_channels: usize,
    pub output_channels: usize,
    pub buffer_sizes: BufferSizeRange,
    /// Whether the driver supports the post-output-ready optimization.
    pub post_output: bool,
}

impl DeviceCapabilities {
    pub fn channels(&self, direction: Direction) -> usize {
        match direction {
            Direction::Input => self.input_channels,
            Direction::Output => self.output_channels,
        }
    }
}

/// One physical channel slot submitted to [`HostDevice::create_buffers`].
/// Slots are ordered inputs first, then outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRequest {
    pub direction: Direction,
    pub channel: u32,
}

/// The two half-buffer pointers the driver populates for a granted slot.
///
/// The memory is owned by the driver and stays valid from the grant until
/// `dispose_buffers`; the core only zeroes, converts in place, and hands the
/// pointers to the processor. It never frees them.
#[derive(Debug, Clone, Copy)]
pub struct SlotBuffers {
    pub halves: [*mut u8; 2],
}

impl SlotBuffers {
    pub fn half(&self, index: usize) -> *mut u8 {
        self.halves[index]
    }
}

// The pointers are driver-owned and only dereferenced under the switch
// engine's reentrancy protocol or while the device is stopped.
unsafe impl Send for SlotBuffers {}
unsafe impl Sync for SlotBuffers {}

/// A slot as actually granted by the driver.
///
/// `channel` is the stamped physical channel number. The grant is NOT
/// guaranteed to preserve request order, which is why all channel mapping
/// resolves against this field and never against the slot's array index.
#[derive(Debug, Clone)]
pub struct GrantedSlot {
    pub direction: Direction,
    pub channel: u32,
    pub encoding: SampleEncoding,
    pub name: String,
    pub buffers: SlotBuffers,
}

/// Latencies reported by the driver, in frames. These already include the
/// double-buffer latency.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamLatency {
    pub input_frames: usize,
    pub output_frames: usize,
}

/// The driver contract consumed by the core.
///
/// All methods take `&self`: FFI-backed drivers are inherently shared
/// objects, and `output_ready` is fired from the switch callback while the
/// control thread may be inside `stop`.
pub trait HostDevice: Send + Sync {
    fn capabilities(&self) -> DeviceCapabilities;

    fn can_sample_rate(&self, rate: f64) -> Result<()>;
    fn sample_rate(&self) -> Result<f64>;
    fn set_sample_rate(&self, rate: f64) -> Result<()>;

    /// Allocate double buffers for the requested slots and register the
    /// switch callback. Returns one granted slot per request, stamped with
    /// the physical channel number the driver actually assigned.
    fn create_buffers(
        &self,
        requests: &[SlotRequest],
        frames: usize,
        callback: SwitchHandle,
    ) -> Result<Vec<GrantedSlot>>;

    fn dispose_buffers(&self) -> Result<()>;

    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;

    fn latencies(&self) -> Result<StreamLatency>;

    /// Post-output-ready hook; only called when the capability snapshot
    /// advertises `post_output`.
    fn output_ready(&self) {}

    fn control_panel(&self) -> Result<()> {
        Err(crate::error::Error::host(status::INVALID_MODE))
    }
}

/// Driver status codes, as reported through [`crate::Error::Host`].
pub mod status {
    pub const OK: i32 = 0;
    pub const SUCCESS: i32 = 0x3f48_47a0;
    pub const NOT_PRESENT: i32 = -1000;
    pub const HW_MALFUNCTION: i32 = -999;
    pub const INVALID_PARAMETER: i32 = -998;
    pub const INVALID_MODE: i32 = -997;
    pub const SP_NOT_ADVANCING: i32 = -996;
    pub const NO_CLOCK: i32 = -995;
    pub const NO_MEMORY: i32 = -994;
}

/// Canonical text for a driver status code.
pub fn host_error_text(code: i32) -> &'static str {
    match code {
        status::OK | status::SUCCESS => "success",
        status::NOT_PRESENT => "hardware input or output is not present or available",
        status::HW_MALFUNCTION => "hardware is malfunctioning",
        status::INVALID_PARAMETER => "input parameter invalid",
        status::INVALID_MODE => "hardware is in a bad mode or used in a bad mode",
        status::SP_NOT_ADVANCING => "hardware is not running when sample position is inquired",
        status::NO_CLOCK => "sample clock or rate cannot be determined or is not present",
        status::NO_MEMORY => "not enough memory for completing the request",
        _ => "unknown driver error",
    }
}
