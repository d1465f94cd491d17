//! A software device with no hardware behind it.
//!
//! [`ManualDevice`] implements [`HostDevice`] over plain memory buffers and
//! lets the caller pump switch periods by hand, or on a background clock
//! thread that stands in for the driver's real-time context. Its
//! configuration can make it misbehave in the ways real drivers do: grant
//! slots in a different order than requested, stamp wrong channel numbers,
//! reject buffer sizes, or refuse to start. That makes it the natural
//! harness for exercising the negotiation and lifecycle paths headlessly.

use crate::convert::SampleEncoding;
use crate::device::{
    BufferSizeRange, DeviceCapabilities, Direction, GrantedSlot, HostDevice, SlotBuffers,
    SlotRequest, StreamLatency, status,
};
use crate::error::{Error, Result};
use crate::switch::SwitchHandle;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ManualDeviceConfig {
    pub input_channels: usize,
    pub output_channels: usize,
    pub buffer_sizes: BufferSizeRange,
    pub post_output: bool,
    pub encoding: SampleEncoding,
    /// Rates accepted by `can_sample_rate`; `None` accepts any positive rate.
    pub supported_rates: Option<Vec<f64>>,
    /// Grant slots sorted by (direction, channel) instead of request order.
    pub sort_grants_ascending: bool,
    /// Stamp output grants with `channel + 64`, like a driver that reports
    /// nonsense channel numbers.
    pub misstamp_outputs: bool,
    /// Reject buffer creation at any size except the preferred one.
    pub fail_create_except_preferred: bool,
    pub fail_start: bool,
    /// When set, `start` spawns a clock thread pumping alternating halves
    /// at this period.
    pub clock_period: Option<Duration>,
}

impl Default for ManualDeviceConfig {
    fn default() -> Self {
        Self {
            input_channels: 2,
            output_channels: 2,
            buffer_sizes: BufferSizeRange {
                min: 32,
                max: 4096,
                preferred: 64,
                granularity: crate::buffer_size::GRANULARITY_POWER_OF_TWO,
            },
            post_output: false,
            encoding: if cfg!(target_endian = "little") {
                SampleEncoding::Float32Lsb
            } else {
                SampleEncoding::Float32Msb
            },
            supported_rates: None,
            sort_grants_ascending: false,
            misstamp_outputs: false,
            fail_create_except_preferred: false,
            fail_start: false,
            clock_period: None,
        }
    }
}

struct SlotStore {
    request: SlotRequest,
    stamped: u32,
    halves: [Box<[u8]>; 2],
}

#[derive(Default)]
struct Inner {
    sample_rate: f64,
    frames: usize,
    slots: Vec<SlotStore>,
    handle: Option<SwitchHandle>,
    started: bool,
    clock: Option<(Arc<AtomicBool>, JoinHandle<()>)>,
    last_requests: Vec<SlotRequest>,
}

pub struct ManualDevice {
    config: ManualDeviceConfig,
    inner: Mutex<Inner>,
    start_calls: AtomicU32,
    stop_calls: AtomicU32,
    output_ready_calls: AtomicU32,
    control_panel_calls: AtomicU32,
}

impl ManualDevice {
    pub fn new(config: ManualDeviceConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: Mutex::new(Inner::default()),
            start_calls: AtomicU32::new(0),
            stop_calls: AtomicU32::new(0),
            output_ready_calls: AtomicU32::new(0),
            control_panel_calls: AtomicU32::new(0),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("manual device poisoned")
    }

    /// Deliver one switch period by hand, with no driver timestamp.
    pub fn pump(&self, half: usize) {
        self.pump_inner(half, None);
    }

    /// Deliver one switch period with an explicit driver timestamp.
    pub fn pump_at(&self, half: usize, timestamp: f64) {
        self.pump_inner(half, Some(timestamp));
    }

    fn pump_inner(&self, half: usize, timestamp: Option<f64>) {
        // Clone the handle out so the callback runs without the device lock
        // held; processors are allowed to call back into the device.
        let handle = self.lock().handle.clone();
        if let Some(handle) = handle {
            handle.buffer_switch(half, timestamp);
        }
    }

    /// Copy of one granted slot's half buffer, looked up by stamped channel.
    pub fn slot_snapshot(&self, direction: Direction, channel: u32, half: usize) -> Option<Vec<u8>> {
        let inner = self.lock();
        inner
            .slots
            .iter()
            .find(|slot| slot.request.direction == direction && slot.stamped == channel)
            .map(|slot| slot.halves[half].to_vec())
    }

    /// Fill one granted input slot's half buffer, looked up by stamped
    /// channel. Returns false when no such slot exists.
    pub fn fill_input(&self, channel: u32, half: usize, bytes: &[u8]) -> bool {
        self.fill_slot(Direction::Input, channel, half, bytes)
    }

    /// Scribble into a granted output slot, standing in for a driver that
    /// leaves garbage in its buffers.
    pub fn fill_output(&self, channel: u32, half: usize, bytes: &[u8]) -> bool {
        self.fill_slot(Direction::Output, channel, half, bytes)
    }

    fn fill_slot(&self, direction: Direction, channel: u32, half: usize, bytes: &[u8]) -> bool {
        let mut inner = self.lock();
        let Some(slot) = inner
            .slots
            .iter_mut()
            .find(|slot| slot.request.direction == direction && slot.stamped == channel)
        else {
            return false;
        };
        let len = bytes.len().min(slot.halves[half].len());
        slot.halves[half][..len].copy_from_slice(&bytes[..len]);
        true
    }

    /// The slot requests submitted by the most recent `create_buffers`.
    pub fn last_requests(&self) -> Vec<SlotRequest> {
        self.lock().last_requests.clone()
    }

    pub fn granted_frames(&self) -> usize {
        self.lock().frames
    }

    pub fn start_calls(&self) -> u32 {
        self.start_calls.load(Ordering::Relaxed)
    }

    pub fn stop_calls(&self) -> u32 {
        self.stop_calls.load(Ordering::Relaxed)
    }

    pub fn output_ready_calls(&self) -> u32 {
        self.output_ready_calls.load(Ordering::Relaxed)
    }

    pub fn control_panel_calls(&self) -> u32 {
        self.control_panel_calls.load(Ordering::Relaxed)
    }

    fn stop_clock(&self) {
        let clock = self.lock().clock.take();
        if let Some((stop, thread)) = clock {
            stop.store(true, Ordering::Release);
            let _ = thread.join();
        }
    }
}

impl HostDevice for ManualDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            input_channels: self.config.input_channels,
            output_channels: self.config.output_channels,
            buffer_sizes: self.config.buffer_sizes,
            post_output: self.config.post_output,
        }
    }

    fn can_sample_rate(&self, rate: f64) -> Result<()> {
        let supported = match &self.config.supported_rates {
            Some(rates) => rates.iter().any(|&r| r == rate),
            None => rate > 0.0,
        };
        if supported {
            Ok(())
        } else {
            Err(Error::host(status::NO_CLOCK))
        }
    }

    fn sample_rate(&self) -> Result<f64> {
        Ok(self.lock().sample_rate)
    }

    fn set_sample_rate(&self, rate: f64) -> Result<()> {
        self.can_sample_rate(rate)?;
        self.lock().sample_rate = rate;
        Ok(())
    }

    fn create_buffers(
        &self,
        requests: &[SlotRequest],
        frames: usize,
        callback: SwitchHandle,
    ) -> Result<Vec<GrantedSlot>> {
        if self.config.fail_create_except_preferred && frames != self.config.buffer_sizes.preferred
        {
            return Err(Error::host(status::INVALID_MODE));
        }

        let mut inner = self.lock();
        inner.last_requests = requests.to_vec();

        let bytes = frames * self.config.encoding.bytes_per_sample();
        let mut stores: Vec<SlotStore> = requests
            .iter()
            .map(|&request| {
                let stamped = if self.config.misstamp_outputs
                    && request.direction == Direction::Output
                {
                    request.channel + 64
                } else {
                    request.channel
                };
                SlotStore {
                    request,
                    stamped,
                    halves: [
                        vec![0u8; bytes].into_boxed_slice(),
                        vec![0u8; bytes].into_boxed_slice(),
                    ],
                }
            })
            .collect();
        if self.config.sort_grants_ascending {
            stores.sort_by_key(|slot| (slot.request.direction == Direction::Output, slot.stamped));
        }

        let granted = stores
            .iter_mut()
            .map(|slot| GrantedSlot {
                direction: slot.request.direction,
                channel: slot.stamped,
                encoding: self.config.encoding,
                name: format!("{} {}", slot.request.direction, slot.stamped),
                buffers: SlotBuffers {
                    halves: [slot.halves[0].as_mut_ptr(), slot.halves[1].as_mut_ptr()],
                },
            })
            .collect();

        inner.slots = stores;
        inner.frames = frames;
        inner.handle = Some(callback);
        Ok(granted)
    }

    fn dispose_buffers(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.slots.clear();
        inner.frames = 0;
        inner.handle = None;
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::Relaxed);
        if self.config.fail_start {
            return Err(Error::host(status::NOT_PRESENT));
        }
        let mut inner = self.lock();
        inner.started = true;

        if let Some(period) = self.config.clock_period {
            let stop = Arc::new(AtomicBool::new(false));
            let thread_stop = stop.clone();
            let handle = inner.handle.clone();
            let thread = std::thread::spawn(move || {
                let mut half = 0usize;
                while !thread_stop.load(Ordering::Acquire) {
                    std::thread::sleep(period);
                    if let Some(handle) = &handle {
                        handle.buffer_switch(half, None);
                    }
                    half ^= 1;
                }
            });
            inner.clock = Some((stop, thread));
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::Relaxed);
        self.stop_clock();
        self.lock().started = false;
        Ok(())
    }

    fn latencies(&self) -> Result<StreamLatency> {
        let frames = self.lock().frames;
        Ok(StreamLatency {
            input_frames: frames,
            output_frames: frames * 2,
        })
    }

    fn output_ready(&self) {
        self.output_ready_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn control_panel(&self) -> Result<()> {
        self.control_panel_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for ManualDevice {
    fn drop(&mut self) {
        self.stop_clock();
    }
}
