//! Stream lifecycle: open, start, graceful stop, abort, close.
//!
//! Open is all-or-nothing; everything acquired along the way (the process
//! open guard, driver buffers) is rolled back in reverse order on failure.
//! Start/stop/abort always leave the stream in a deterministic state, so
//! callers can rely on `is_active`/`is_stopped` independently of the
//! returned result.

use crate::buffer_size;
use crate::channels::{self, ChannelRequest, NegotiatedPlan};
use crate::convert::{self, CanonicalFormat};
use crate::device::{
    Direction, GrantedSlot, HostDevice, SlotRequest, StreamLatency, status,
};
use crate::error::{Error, Result};
use crate::options::StreamOptions;
use crate::switch::{RtState, StreamProcessor, SwitchEngine, SwitchHandle, ZeroSlot};
use crate::sync::OpenGuard;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

/// Stream latencies in seconds, as reported to the application.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencySeconds {
    pub input: f64,
    pub output: f64,
}

/// Coarse lifecycle state derived from the shared flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Stopped,
    Active,
    /// Stop requested; queued output is still playing out.
    Draining,
    /// Going silent without a drain.
    Aborting,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("closed", &self.closed)
            .field("sample_rate", &self.sample_rate)
            .field("frames_per_buffer", &self.frames_per_buffer)
            .field("input_channels", &self.input_channels)
            .field("output_channels", &self.output_channels)
            .field("input_latency_secs", &self.input_latency_secs)
            .field("output_latency_secs", &self.output_latency_secs)
            .finish_non_exhaustive()
    }
}

pub struct Stream {
    device: Arc<dyn HostDevice>,
    engine: Arc<SwitchEngine>,
    guard: Option<OpenGuard>,
    closed: bool,

    sample_rate: f64,
    frames_per_buffer: usize,
    input_channels: usize,
    output_channels: usize,
    input_latency_secs: f64,
    output_latency_secs: f64,
}

impl Stream {
    /// Open a stream on `device`. At least one direction must be requested.
    pub fn open(
        device: Arc<dyn HostDevice>,
        input: Option<ChannelRequest>,
        output: Option<ChannelRequest>,
        sample_rate: f64,
        frames_per_buffer: Option<usize>,
        options: StreamOptions,
        processor: Box<dyn StreamProcessor>,
    ) -> Result<Stream> {
        let guard = OpenGuard::acquire()?;
        let caps = device.capabilities();

        if input.is_none() && output.is_none() {
            return Err(Error::InvalidChannelCount {
                direction: Direction::Output,
                requested: 0,
                available: caps.output_channels,
            });
        }

        let input_plan = input
            .as_ref()
            .map(|request| channels::negotiate(Direction::Input, request, caps.input_channels, 0))
            .transpose()?;
        let output_plan = output
            .as_ref()
            .map(|request| {
                channels::negotiate(
                    Direction::Output,
                    request,
                    caps.output_channels,
                    options.output_channel_offset,
                )
            })
            .transpose()?;

        device.can_sample_rate(sample_rate)?;
        if device.sample_rate()? != sample_rate {
            device.set_sample_rate(sample_rate)?;
        }

        let target_latency_frames = (options
            .suggested_input_latency
            .max(options.suggested_output_latency)
            * sample_rate)
            .round() as usize;
        let mut frames = buffer_size::select(
            target_latency_frames,
            frames_per_buffer,
            &caps.buffer_sizes,
            options.buffer_size_policy,
        )?;

        let mut requests = Vec::new();
        if let Some(plan) = &input_plan {
            requests.extend(plan.channels.iter().map(|&channel| SlotRequest {
                direction: Direction::Input,
                channel,
            }));
        }
        if let Some(plan) = &output_plan {
            requests.extend(plan.channels.iter().map(|&channel| SlotRequest {
                direction: Direction::Output,
                channel,
            }));
        }

        let engine = Arc::new(SwitchEngine::new());
        let handle = SwitchHandle::new(engine.clone());

        let slots = match device.create_buffers(&requests, frames, handle.clone()) {
            Ok(slots) => slots,
            Err(first) if frames != caps.buffer_sizes.preferred => {
                // Some drivers misreport their size range but still accept
                // their own preferred size.
                tracing::warn!(
                    "buffer creation failed at {frames} frames, retrying at preferred {}",
                    caps.buffer_sizes.preferred
                );
                match device.create_buffers(&requests, caps.buffer_sizes.preferred, handle) {
                    Ok(slots) => {
                        frames = caps.buffer_sizes.preferred;
                        slots
                    }
                    Err(_) => return Err(buffer_creation_error(first, frames)),
                }
            }
            Err(first) => return Err(buffer_creation_error(first, frames)),
        };
        if slots.len() != requests.len() {
            let _ = device.dispose_buffers();
            return Err(Error::host(status::INVALID_PARAMETER));
        }

        match Self::finish_open(
            device,
            engine,
            guard,
            &options,
            slots,
            input_plan,
            output_plan,
            sample_rate,
            frames,
            processor,
        ) {
            Ok(stream) => Ok(stream),
            Err((device, err)) => {
                let _ = device.dispose_buffers();
                Err(err)
            }
        }
    }

    /// Everything after the grant; on error the caller disposes buffers.
    #[allow(clippy::too_many_arguments)]
    fn finish_open(
        device: Arc<dyn HostDevice>,
        engine: Arc<SwitchEngine>,
        guard: OpenGuard,
        options: &StreamOptions,
        slots: Vec<GrantedSlot>,
        input_plan: Option<NegotiatedPlan>,
        output_plan: Option<NegotiatedPlan>,
        sample_rate: f64,
        frames: usize,
        processor: Box<dyn StreamProcessor>,
    ) -> std::result::Result<Stream, (Arc<dyn HostDevice>, Error)> {
        let caps = device.capabilities();
        let result: Result<Stream> = (|| {
            let input_map = input_plan
                .as_ref()
                .map(|plan| {
                    channels::build_channel_map(
                        Direction::Input,
                        &plan.channels,
                        &slots,
                        options.positional_fallback,
                    )
                })
                .transpose()?;
            let (output_map, silent_map) = match &output_plan {
                Some(plan) => {
                    let audible = channels::build_channel_map(
                        Direction::Output,
                        plan.audible(),
                        &slots,
                        options.positional_fallback,
                    )?;
                    let silent = channels::build_channel_map(
                        Direction::Output,
                        &plan.channels[..plan.silent],
                        &slots,
                        options.positional_fallback,
                    )?;
                    (Some(audible), silent)
                }
                None => (None, Vec::new()),
            };

            // All channels of a direction are assumed to share one encoding;
            // devices mixing encodings per channel are not supported.
            let input_spec = match (&input_map, &input_plan) {
                (Some(map), Some(_)) => {
                    Some((convert::device_to_host(slots[map[0]].encoding)?, slots[map[0]].encoding))
                }
                _ => None,
            };
            let output_spec = match (&output_map, &output_plan) {
                (Some(map), Some(_)) => {
                    Some((convert::host_to_device(slots[map[0]].encoding)?, slots[map[0]].encoding))
                }
                _ => None,
            };

            // Latencies already include the double-buffer contribution; a
            // driver that cannot answer is treated as reporting zero.
            let latency = device.latencies().unwrap_or_else(|err| {
                tracing::warn!("driver latency query failed: {err}");
                StreamLatency::default()
            });
            let input_latency_secs = latency.input_frames as f64 / sample_rate;
            let output_latency_secs = latency.output_frames as f64 / sample_rate;

            let half_ptrs = |map: &[usize], half: usize| -> Vec<*mut u8> {
                map.iter().map(|&slot| slots[slot].buffers.half(half)).collect()
            };
            let input_ptrs = match &input_map {
                Some(map) => [half_ptrs(map, 0), half_ptrs(map, 1)],
                None => [Vec::new(), Vec::new()],
            };
            let output_ptrs = match &output_map {
                Some(map) => [half_ptrs(map, 0), half_ptrs(map, 1)],
                None => [Vec::new(), Vec::new()],
            };

            let zero_slots = slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.direction == Direction::Output)
                .map(|(index, slot)| ZeroSlot {
                    halves: slot.buffers.halves,
                    bytes_per_sample: slot.encoding.bytes_per_sample(),
                    silent: silent_map.contains(&index),
                })
                .collect();

            let input_channels = input_map.as_ref().map_or(0, Vec::len);
            let output_channels = output_map.as_ref().map_or(0, Vec::len);

            let input_format: Option<CanonicalFormat> =
                input_spec.as_ref().map(|(spec, _)| spec.format);
            let output_format: Option<CanonicalFormat> =
                output_spec.as_ref().map(|(spec, _)| spec.format);
            tracing::debug!(
                "stream open: {input_channels} in / {output_channels} out, {frames} frames @ {sample_rate} Hz, \
                 buffer policy {:?}, offset {}, formats in {:?} out {:?}",
                options.buffer_size_policy,
                options.output_channel_offset,
                input_format,
                output_format,
            );

            engine.install(RtState {
                device: device.clone(),
                processor,
                frames,
                post_output: caps.post_output,
                input_convert: input_spec.as_ref().and_then(|(s, _)| s.convert),
                input_shift: input_spec.as_ref().map_or(0, |(s, _)| s.shift),
                input_format,
                input_native_bytes: input_spec
                    .as_ref()
                    .map_or(0, |(_, enc)| frames * enc.bytes_per_sample()),
                output_convert: output_spec.as_ref().and_then(|(s, _)| s.convert),
                output_shift: output_spec.as_ref().map_or(0, |(s, _)| s.shift),
                output_format,
                output_native_bytes: output_spec
                    .as_ref()
                    .map_or(0, |(_, enc)| frames * enc.bytes_per_sample()),
                input_ptrs,
                output_ptrs,
                zero_slots,
                input_latency_secs,
                output_latency_secs,
                epoch: Instant::now(),
            });

            Ok(Stream {
                device: device.clone(),
                engine,
                guard: Some(guard),
                closed: false,
                sample_rate,
                frames_per_buffer: frames,
                input_channels,
                output_channels,
                input_latency_secs,
                output_latency_secs,
            })
        })();
        result.map_err(|err| (device, err))
    }

    /// Begin generating switch callbacks.
    pub fn start(&mut self) -> Result<()> {
        if self.closed || !self.engine.shared.stopped.load(Ordering::Acquire) {
            return Err(Error::StreamNotStopped);
        }

        self.engine.prepare_start();
        self.engine.shared.stopped.store(false, Ordering::Release);
        self.engine.shared.active.store(true, Ordering::Release);

        if let Err(err) = self.device.start() {
            self.engine.shared.stopped.store(true, Ordering::Release);
            self.engine.shared.active.store(false, Ordering::Release);
            return Err(err);
        }
        tracing::debug!("stream started");
        Ok(())
    }

    /// Graceful stop: drain already-buffered output, then cease callbacks.
    ///
    /// A drain that outlives its timeout is reported as `DrainTimeout`, but
    /// the stream is forced to Stopped regardless so it can always be
    /// closed afterwards.
    pub fn stop(&mut self) -> Result<()> {
        let mut result = Ok(());

        if self.engine.shared.active.load(Ordering::Acquire) {
            self.engine
                .shared
                .stop_processing
                .store(true, Ordering::Release);

            // Four times the output latency, floored so output-light
            // streams still get their playout window.
            let period = self.frames_per_buffer as f64 / self.sample_rate;
            let timeout = Duration::from_secs_f64(
                (self.output_latency_secs * 4.0).max(period * 8.0).max(0.1),
            );
            if !self.engine.completion.wait(timeout) {
                tracing::warn!("drain did not complete within {timeout:?}; forcing stop");
                result = Err(Error::DrainTimeout);
            }
        }

        if let Err(err) = self.device.stop()
            && result.is_ok()
        {
            result = Err(err);
        }
        self.finish_stop();
        result
    }

    /// Immediate stop: silence on the next period, no drain.
    pub fn abort(&mut self) -> Result<()> {
        self.engine.request_silence();
        let result = self.device.stop();
        self.finish_stop();
        result
    }

    fn finish_stop(&mut self) {
        // The driver may still be inside a switch callback after stop()
        // returns; wait it out (bounded) before declaring the stream
        // stopped.
        if !self.engine.wait_idle(Duration::from_secs(2)) {
            tracing::warn!("switch callback still in flight 2s after device stop");
        }
        self.engine.shared.stopped.store(true, Ordering::Release);
        self.engine.shared.active.store(false, Ordering::Release);
        self.engine.deliver_finished();

        let missed = self.engine.shared.reenter_error.load(Ordering::Relaxed);
        if missed > 0 {
            tracing::warn!("{missed} buffer period(s) were missed while the stream was active");
        }
    }

    /// Release driver buffers and the process-wide open guard. Only valid
    /// when stopped; idempotent afterwards.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if !self.engine.shared.stopped.load(Ordering::Acquire) {
            return Err(Error::StreamNotStopped);
        }
        self.engine.disarm();
        let result = self.device.dispose_buffers();
        self.guard.take();
        self.closed = true;
        tracing::debug!("stream closed");
        result
    }

    pub fn is_active(&self) -> bool {
        self.engine.shared.active.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.engine.shared.stopped.load(Ordering::Acquire)
    }

    pub fn state(&self) -> StreamState {
        if self.is_stopped() {
            StreamState::Stopped
        } else if self.engine.shared.stop_processing.load(Ordering::Acquire) {
            StreamState::Draining
        } else if self.engine.shared.zero_output.load(Ordering::Acquire) {
            StreamState::Aborting
        } else {
            StreamState::Active
        }
    }

    pub fn latencies(&self) -> LatencySeconds {
        LatencySeconds {
            input: self.input_latency_secs,
            output: self.output_latency_secs,
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn frames_per_buffer(&self) -> usize {
        self.frames_per_buffer
    }

    pub fn input_channels(&self) -> usize {
        self.input_channels
    }

    pub fn output_channels(&self) -> usize {
        self.output_channels
    }

    /// Launch the driver's configuration dialog. Only while stopped.
    pub fn control_panel(&self) -> Result<()> {
        if !self.is_stopped() {
            return Err(Error::StreamNotStopped);
        }
        self.device.control_panel()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if !self.is_stopped() {
            let _ = self.abort();
        }
        let _ = self.close();
    }
}

fn buffer_creation_error(err: Error, frames: usize) -> Error {
    match err {
        Error::Host { code, text } => Error::BufferCreation { frames, code, text },
        other => other,
    }
}
