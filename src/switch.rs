//! The buffer switch engine: the real-time entry point the driver invokes
//! once per hardware buffer period.
//!
//! Everything on this path runs under two rules: no heap allocation and no
//! blocking. Reentrancy is handled by an atomic counter protocol — an
//! overlapped invocation is never processed, it is recorded as a missed
//! period and drained by the invocation that owns the counter, so the driver
//! always gets its callback returned and never deadlocks.

use crate::convert::{CanonicalFormat, ConvertFn};
use crate::device::HostDevice;
use crate::sync::{
    CompletionSignal, FLAG_INPUT_OVERFLOW, FLAG_OUTPUT_UNDERFLOW, REENTER_IDLE, RtCell,
    SharedState,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Buffer timestamps handed to the processor, in seconds.
///
/// `current` is the driver's timestamp for this period when it provides one,
/// otherwise time since the stream was opened. The ADC/DAC times are offset
/// by the driver-reported latencies.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamTime {
    pub current: f64,
    pub input_adc: f64,
    pub output_dac: f64,
}

/// Transient conditions accumulated since the last processor invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusFlags {
    pub input_overflow: bool,
    pub output_underflow: bool,
}

/// What the processor wants the stream to do after this period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    Continue,
    /// Finish once already-buffered output has played out.
    Complete,
    /// Go silent immediately.
    Abort,
}

/// The application-side processing interface invoked from the callback
/// context. Implementations must not allocate or block inside `process` and
/// `drain`.
pub trait StreamProcessor: Send {
    /// One period of work: read converted input, write output.
    fn process(&mut self, io: &mut ProcessIo<'_>) -> ProcessResult;

    /// Called instead of `process` once a graceful stop has been requested.
    /// Emit any still-buffered output and return whether the backlog is now
    /// empty. The default has nothing buffered.
    fn drain(&mut self, io: &mut ProcessIo<'_>) -> bool {
        let _ = io;
        true
    }

    /// Queried when `process` returns [`ProcessResult::Complete`]; `false`
    /// keeps the stream in drain until the backlog empties.
    fn output_drained(&self) -> bool {
        true
    }

    /// Stream-finished notification. Delivered exactly once per start, from
    /// whichever side (callback or control) completes the stop.
    fn finished(&mut self) {}
}

/// Per-period I/O view handed to the processor.
///
/// Channel data lives in the driver's half buffers, already normalized to
/// the canonical formats by the in-place converters. Channels are indexed
/// logically; the mapping to physical slots happened at open time.
pub struct ProcessIo<'a> {
    frames: usize,
    time: StreamTime,
    flags: StatusFlags,
    input_format: Option<CanonicalFormat>,
    output_format: Option<CanonicalFormat>,
    inputs: &'a [*mut u8],
    outputs: &'a [*mut u8],
}

impl ProcessIo<'_> {
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn time(&self) -> StreamTime {
        self.time
    }

    pub fn flags(&self) -> StatusFlags {
        self.flags
    }

    pub fn input_channels(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_channels(&self) -> usize {
        self.outputs.len()
    }

    pub fn input_format(&self) -> Option<CanonicalFormat> {
        self.input_format
    }

    pub fn output_format(&self) -> Option<CanonicalFormat> {
        self.output_format
    }

    /// Raw bytes of one input channel for this period.
    pub fn input_bytes(&self, channel: usize) -> &[u8] {
        let bytes = self.frames * self.input_format.map_or(0, CanonicalFormat::bytes_per_sample);
        unsafe { std::slice::from_raw_parts(self.inputs[channel], bytes) }
    }

    /// Raw bytes of one output channel for this period.
    pub fn output_bytes_mut(&mut self, channel: usize) -> &mut [u8] {
        let bytes = self.frames * self.output_format.map_or(0, CanonicalFormat::bytes_per_sample);
        unsafe { std::slice::from_raw_parts_mut(self.outputs[channel], bytes) }
    }

    /// Typed view of an input channel; `None` unless the canonical input
    /// format is `F32`. Driver buffers are naturally aligned for their
    /// sample type.
    pub fn input_f32(&self, channel: usize) -> Option<&[f32]> {
        (self.input_format == Some(CanonicalFormat::F32))
            .then(|| unsafe { std::slice::from_raw_parts(self.inputs[channel].cast(), self.frames) })
    }

    pub fn input_i32(&self, channel: usize) -> Option<&[i32]> {
        (self.input_format == Some(CanonicalFormat::I32))
            .then(|| unsafe { std::slice::from_raw_parts(self.inputs[channel].cast(), self.frames) })
    }

    pub fn input_i16(&self, channel: usize) -> Option<&[i16]> {
        (self.input_format == Some(CanonicalFormat::I16))
            .then(|| unsafe { std::slice::from_raw_parts(self.inputs[channel].cast(), self.frames) })
    }

    pub fn output_f32_mut(&mut self, channel: usize) -> Option<&mut [f32]> {
        (self.output_format == Some(CanonicalFormat::F32)).then(|| unsafe {
            std::slice::from_raw_parts_mut(self.outputs[channel].cast(), self.frames)
        })
    }

    pub fn output_i32_mut(&mut self, channel: usize) -> Option<&mut [i32]> {
        (self.output_format == Some(CanonicalFormat::I32)).then(|| unsafe {
            std::slice::from_raw_parts_mut(self.outputs[channel].cast(), self.frames)
        })
    }

    pub fn output_i16_mut(&mut self, channel: usize) -> Option<&mut [i16]> {
        (self.output_format == Some(CanonicalFormat::I16)).then(|| unsafe {
            std::slice::from_raw_parts_mut(self.outputs[channel].cast(), self.frames)
        })
    }
}

/// One granted output slot as seen by the zeroing pass.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ZeroSlot {
    pub halves: [*mut u8; 2],
    pub bytes_per_sample: usize,
    /// Allocated only to pin the audible range; kept silent.
    pub silent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ZeroScope {
    /// Every granted output slot.
    All,
    /// Only the designated-silent slots.
    SilentSubset,
}

/// Everything the callback context needs, installed once at open time and
/// immutable while the stream can become active.
pub(crate) struct RtState {
    pub device: Arc<dyn HostDevice>,
    pub processor: Box<dyn StreamProcessor>,
    pub frames: usize,
    pub post_output: bool,

    pub input_convert: Option<ConvertFn>,
    pub input_shift: u32,
    pub input_format: Option<CanonicalFormat>,
    /// Native bytes of one input half buffer (before conversion).
    pub input_native_bytes: usize,

    pub output_convert: Option<ConvertFn>,
    pub output_shift: u32,
    pub output_format: Option<CanonicalFormat>,
    pub output_native_bytes: usize,

    /// Per-half pointer tables in logical channel order, resolved through
    /// the channel map at open time. Indexing a slot any other way is how
    /// reordered grants turn into misrouted audio.
    pub input_ptrs: [Vec<*mut u8>; 2],
    pub output_ptrs: [Vec<*mut u8>; 2],

    /// All granted output slots in grant order, for the zeroing passes.
    pub zero_slots: Vec<ZeroSlot>,

    pub input_latency_secs: f64,
    pub output_latency_secs: f64,
    pub epoch: Instant,
}

// Raw pointers into driver-owned buffers; dereferenced only under the
// reentrancy protocol or while the device is stopped.
unsafe impl Send for RtState {}

impl RtState {
    fn stream_time(&self, timestamp: Option<f64>) -> StreamTime {
        let current = timestamp.unwrap_or_else(|| self.epoch.elapsed().as_secs_f64());
        StreamTime {
            current,
            input_adc: current - self.input_latency_secs,
            output_dac: current + self.output_latency_secs,
        }
    }
}

/// Handle the driver invokes once per buffer period.
#[derive(Clone)]
pub struct SwitchHandle {
    engine: Arc<SwitchEngine>,
}

impl SwitchHandle {
    pub(crate) fn new(engine: Arc<SwitchEngine>) -> Self {
        Self { engine }
    }

    /// Entry point for the driver: `half` selects which of the two buffer
    /// halves is now safe to fill, `timestamp` is the driver's buffer time
    /// in seconds if it has one.
    pub fn buffer_switch(&self, half: usize, timestamp: Option<f64>) {
        self.engine.on_switch(half & 1, timestamp);
    }
}

pub(crate) struct SwitchEngine {
    pub shared: SharedState,
    pub completion: CompletionSignal,
    rt: RtCell<Option<RtState>>,
    armed: AtomicBool,
}

impl SwitchEngine {
    pub fn new() -> Self {
        Self {
            shared: SharedState::new(),
            completion: CompletionSignal::new(),
            rt: RtCell::new(None),
            armed: AtomicBool::new(false),
        }
    }

    /// Install the real-time tables. Only called while no callback can be in
    /// flight (buffers granted, device not yet started).
    pub fn install(&self, rt: RtState) {
        unsafe { *self.rt.get_mut() = Some(rt) };
        self.armed.store(true, Ordering::Release);
    }

    /// Tear down for close: refuse new callbacks, wait out any in-flight
    /// one, then take the tables back.
    pub fn disarm(&self) -> Option<RtState> {
        self.armed.store(false, Ordering::Release);
        if !self.wait_idle(Duration::from_secs(2)) {
            tracing::warn!("switch callback still in flight after 2s; tearing down anyway");
        }
        unsafe { self.rt.get_mut().take() }
    }

    /// Bounded wait for any in-flight callback to exit.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.shared.reenter_count.load(Ordering::Acquire) != REENTER_IDLE {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// Reset per-start state and zero both halves of every output slot.
    /// Only called while the device is stopped.
    pub fn prepare_start(&self) {
        let rt = unsafe { self.rt.get_mut() };
        if let Some(rt) = rt.as_ref() {
            zero_slots(rt, 0, ZeroScope::All);
            zero_slots(rt, 1, ZeroScope::All);
        }
        self.shared.stop_processing.store(false, Ordering::Release);
        self.shared.zero_output.store(false, Ordering::Release);
        self.shared.reenter_count.store(REENTER_IDLE, Ordering::Release);
        self.shared.reenter_error.store(0, Ordering::Relaxed);
        self.shared.callback_flags.store(0, Ordering::Relaxed);
        self.shared.stop_playout_count.store(0, Ordering::Relaxed);
        self.shared.silent_periods.store(0, Ordering::Relaxed);
        self.shared.finished_called.store(false, Ordering::Release);
        self.completion.reset();
    }

    /// Route all further periods to the silence path. Shared by the abort
    /// control path and the callback's completion transitions.
    pub fn request_silence(&self) {
        self.shared.stop_playout_count.store(0, Ordering::Relaxed);
        self.shared.silent_periods.store(0, Ordering::Relaxed);
        self.shared.zero_output.store(true, Ordering::Release);
    }

    /// Deliver the finished notification from the control side if the
    /// callback never got to it. Only called after the device has stopped
    /// and the callback is idle.
    pub fn deliver_finished(&self) {
        if self.shared.finished_called.swap(true, Ordering::AcqRel) {
            return;
        }
        let rt = unsafe { self.rt.get_mut() };
        if let Some(rt) = rt.as_mut() {
            rt.processor.finished();
        }
    }

    fn on_switch(&self, half: usize, timestamp: Option<f64>) {
        // Reentrancy guard. An overlapped invocation leaves the counter
        // raised and bails; the owning invocation drains it below.
        let prev = self.shared.reenter_count.fetch_add(1, Ordering::AcqRel);
        if prev != REENTER_IDLE {
            self.shared.reenter_error.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if !self.armed.load(Ordering::Acquire) {
            self.drain_counter();
            return;
        }
        // Sole owner of the RT tables: the counter is non-idle and every
        // competing invocation returned above.
        let rt = match unsafe { self.rt.get_mut() } {
            Some(rt) => rt,
            None => {
                self.drain_counter();
                return;
            }
        };

        let mut buffers_done = 0u32;
        loop {
            if buffers_done > 0 {
                // A period queued up behind us while we were processing; it
                // cannot be recovered, only accounted for.
                let mut flags = 0;
                if !rt.input_ptrs[half].is_empty() {
                    flags |= FLAG_INPUT_OVERFLOW;
                }
                if !rt.output_ptrs[half].is_empty() {
                    flags |= FLAG_OUTPUT_UNDERFLOW;
                }
                self.shared.callback_flags.fetch_or(flags, Ordering::AcqRel);
            } else if self.shared.zero_output.load(Ordering::Acquire) {
                self.silent_period(rt, half);
            } else {
                self.process_period(rt, half, timestamp);
            }

            buffers_done += 1;
            let remaining = self.shared.reenter_count.fetch_sub(1, Ordering::AcqRel) - 1;
            if remaining < REENTER_IDLE + 1 {
                break;
            }
        }
    }

    fn drain_counter(&self) {
        while self.shared.reenter_count.fetch_sub(1, Ordering::AcqRel) - 1 >= REENTER_IDLE + 1 {}
    }

    fn silent_period(&self, rt: &mut RtState, half: usize) {
        // Under an offset policy the first silent period only touches the
        // designated-silent subset (its steady-state contract); from the
        // second period on, and always without such a subset, the whole
        // output goes quiet.
        let first = self.shared.silent_periods.fetch_add(1, Ordering::Relaxed) == 0;
        let scope = if first && rt.zero_slots.iter().any(|slot| slot.silent) {
            ZeroScope::SilentSubset
        } else {
            ZeroScope::All
        };
        zero_slots(rt, half, scope);

        if rt.post_output {
            rt.device.output_ready();
        }

        if self.shared.stop_processing.load(Ordering::Acquire) {
            let played = self.shared.stop_playout_count.load(Ordering::Relaxed);
            if played < 2 {
                self.shared
                    .stop_playout_count
                    .store(played + 1, Ordering::Relaxed);
                if played + 1 == 2 {
                    self.shared.active.store(false, Ordering::Release);
                    if !self.shared.finished_called.swap(true, Ordering::AcqRel) {
                        rt.processor.finished();
                    }
                    self.completion.set();
                }
            }
        }
    }

    fn process_period(&self, rt: &mut RtState, half: usize, timestamp: Option<f64>) {
        if let Some(convert) = rt.input_convert {
            for &ptr in &rt.input_ptrs[half] {
                let buf = unsafe { std::slice::from_raw_parts_mut(ptr, rt.input_native_bytes) };
                convert(buf, rt.input_shift, rt.frames);
            }
        }

        // Dummy slots stay silent no matter what the driver left in them.
        zero_slots(rt, half, ZeroScope::SilentSubset);

        let raw = self.shared.callback_flags.swap(0, Ordering::AcqRel);
        let flags = StatusFlags {
            input_overflow: raw & FLAG_INPUT_OVERFLOW != 0,
            output_underflow: raw & FLAG_OUTPUT_UNDERFLOW != 0,
        };
        let mut io = ProcessIo {
            frames: rt.frames,
            time: rt.stream_time(timestamp),
            flags,
            input_format: rt.input_format,
            output_format: rt.output_format,
            inputs: &rt.input_ptrs[half],
            outputs: &rt.output_ptrs[half],
        };

        if self.shared.stop_processing.load(Ordering::Acquire) {
            let empty = rt.processor.drain(&mut io);
            convert_outputs(rt, half);
            if rt.post_output {
                rt.device.output_ready();
            }
            if empty {
                self.request_silence();
            }
            return;
        }

        let result = rt.processor.process(&mut io);
        convert_outputs(rt, half);
        if rt.post_output {
            rt.device.output_ready();
        }

        match result {
            ProcessResult::Continue => {}
            ProcessResult::Complete => {
                self.shared.stop_processing.store(true, Ordering::Release);
                if rt.processor.output_drained() {
                    self.request_silence();
                }
            }
            ProcessResult::Abort => {
                self.shared.active.store(false, Ordering::Release);
                if !self.shared.finished_called.swap(true, Ordering::AcqRel) {
                    rt.processor.finished();
                }
                self.completion.set();
                self.request_silence();
            }
        }
    }
}

fn convert_outputs(rt: &RtState, half: usize) {
    if let Some(convert) = rt.output_convert {
        for &ptr in &rt.output_ptrs[half] {
            let buf = unsafe { std::slice::from_raw_parts_mut(ptr, rt.output_native_bytes) };
            convert(buf, rt.output_shift, rt.frames);
        }
    }
}

fn zero_slots(rt: &RtState, half: usize, scope: ZeroScope) {
    for slot in &rt.zero_slots {
        if scope == ZeroScope::SilentSubset && !slot.silent {
            continue;
        }
        let ptr = slot.halves[half];
        if ptr.is_null() {
            continue;
        }
        unsafe { std::ptr::write_bytes(ptr, 0, rt.frames * slot.bytes_per_sample) };
    }
}
