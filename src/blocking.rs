//! Synchronous read/write convenience wrapper over the callback engine.
//!
//! A [`BlockingStream`] owns a regular [`Stream`] whose processor shuttles
//! interleaved f32 frames through a pair of lock-free rings. The
//! application side blocks on a period signal the callback bumps once per
//! buffer, so `read`/`write` wake exactly when new space or data can exist.
//! This wrapper is layered strictly on public core behavior; the core never
//! knows it is being driven synchronously.

use crate::channels::ChannelRequest;
use crate::convert::CanonicalFormat;
use crate::device::HostDevice;
use crate::error::{Error, Result};
use crate::options::StreamOptions;
use crate::stream::{LatencySeconds, Stream};
use crate::switch::{ProcessIo, ProcessResult, StreamProcessor};
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Ring capacity in periods. Generous enough that a briefly descheduled
/// application thread does not immediately xrun.
const QUEUE_PERIODS: usize = 8;

/// How long a read/write waits without seeing a single callback before
/// giving up.
const IO_TIMEOUT: Duration = Duration::from_secs(2);

/// Monotonic period counter the callback bumps and the app side sleeps on.
struct PeriodSignal {
    seq: Mutex<u64>,
    condvar: Condvar,
}

impl PeriodSignal {
    fn new() -> Self {
        Self {
            seq: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    fn notify(&self) {
        *self.seq.lock().expect("period signal poisoned") += 1;
        self.condvar.notify_all();
    }

    fn current(&self) -> u64 {
        *self.seq.lock().expect("period signal poisoned")
    }

    /// Wait until the counter moves past `seen`; false on timeout.
    fn wait_past(&self, seen: u64, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut seq = self.seq.lock().expect("period signal poisoned");
        while *seq <= seen {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self
                .condvar
                .wait_timeout(seq, deadline - now)
                .expect("period signal poisoned");
            seq = guard;
            if result.timed_out() && *seq <= seen {
                return false;
            }
        }
        true
    }
}

struct BlockingProcessor {
    capture_tx: HeapProducer<f32>,
    playback_rx: HeapConsumer<f32>,
    signal: Arc<PeriodSignal>,
    overflows: Arc<AtomicU32>,
    underflows: Arc<AtomicU32>,
}

impl BlockingProcessor {
    fn sample_in(io: &ProcessIo<'_>, channel: usize, frame: usize) -> f32 {
        match io.input_format() {
            Some(CanonicalFormat::F32) => io.input_f32(channel).map_or(0.0, |s| s[frame]),
            Some(CanonicalFormat::I32) => io
                .input_i32(channel)
                .map_or(0.0, |s| s[frame] as f32 / i32::MAX as f32),
            Some(CanonicalFormat::I16) => io
                .input_i16(channel)
                .map_or(0.0, |s| s[frame] as f32 / i16::MAX as f32),
            _ => 0.0,
        }
    }

    fn write_out(io: &mut ProcessIo<'_>, channel: usize, frame: usize, sample: f32) {
        let clamped = sample.clamp(-1.0, 1.0);
        match io.output_format() {
            Some(CanonicalFormat::F32) => {
                if let Some(out) = io.output_f32_mut(channel) {
                    out[frame] = clamped;
                }
            }
            Some(CanonicalFormat::I32) => {
                if let Some(out) = io.output_i32_mut(channel) {
                    out[frame] = (clamped as f64 * i32::MAX as f64) as i32;
                }
            }
            Some(CanonicalFormat::I16) => {
                if let Some(out) = io.output_i16_mut(channel) {
                    out[frame] = (clamped * i16::MAX as f32) as i16;
                }
            }
            _ => {}
        }
    }

    fn capture(&mut self, io: &ProcessIo<'_>) {
        let channels = io.input_channels();
        if channels == 0 {
            return;
        }
        let mut overflowed = false;
        for frame in 0..io.frames() {
            for channel in 0..channels {
                let sample = Self::sample_in(io, channel, frame);
                if self.capture_tx.push(sample).is_err() {
                    overflowed = true;
                }
            }
        }
        if overflowed {
            self.overflows.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns true when the playback backlog ran dry mid-period.
    fn playback(&mut self, io: &mut ProcessIo<'_>) -> bool {
        let channels = io.output_channels();
        if channels == 0 {
            return true;
        }
        let mut starved = false;
        for frame in 0..io.frames() {
            for channel in 0..channels {
                match self.playback_rx.pop() {
                    Some(sample) => Self::write_out(io, channel, frame, sample),
                    None => {
                        Self::write_out(io, channel, frame, 0.0);
                        starved = true;
                    }
                }
            }
        }
        starved
    }
}

impl StreamProcessor for BlockingProcessor {
    fn process(&mut self, io: &mut ProcessIo<'_>) -> ProcessResult {
        self.capture(io);
        if self.playback(io) && io.output_channels() > 0 {
            self.underflows.fetch_add(1, Ordering::Relaxed);
        }
        self.signal.notify();
        ProcessResult::Continue
    }

    fn drain(&mut self, io: &mut ProcessIo<'_>) -> bool {
        // Keep playing the backlog; starving here is expected, not an xrun.
        self.playback(io);
        self.signal.notify();
        self.playback_rx.is_empty()
    }

    fn output_drained(&self) -> bool {
        self.playback_rx.is_empty()
    }
}

pub struct BlockingStream {
    stream: Stream,
    capture_rx: HeapConsumer<f32>,
    playback_tx: HeapProducer<f32>,
    signal: Arc<PeriodSignal>,
    overflows: Arc<AtomicU32>,
    underflows: Arc<AtomicU32>,
    input_channels: usize,
    output_channels: usize,
}

impl BlockingStream {
    /// Open a stream driven through blocking reads and writes instead of a
    /// user processor. Channel requests carry no selectors; routing policy
    /// still applies through `options`.
    pub fn open(
        device: Arc<dyn HostDevice>,
        input_channels: usize,
        output_channels: usize,
        sample_rate: f64,
        frames_per_buffer: Option<usize>,
        options: StreamOptions,
    ) -> Result<BlockingStream> {
        let frames_hint = frames_per_buffer.unwrap_or(device.capabilities().buffer_sizes.preferred);
        let capacity = |channels: usize| (frames_hint * channels * QUEUE_PERIODS).max(1);

        let capture = HeapRb::<f32>::new(capacity(input_channels));
        let (capture_tx, capture_rx) = capture.split();
        let playback = HeapRb::<f32>::new(capacity(output_channels));
        let (playback_tx, playback_rx) = playback.split();

        let signal = Arc::new(PeriodSignal::new());
        let overflows = Arc::new(AtomicU32::new(0));
        let underflows = Arc::new(AtomicU32::new(0));

        let processor = BlockingProcessor {
            capture_tx,
            playback_rx,
            signal: signal.clone(),
            overflows: overflows.clone(),
            underflows: underflows.clone(),
        };

        let request = |channels: usize| (channels > 0).then(|| ChannelRequest::new(channels));
        let stream = Stream::open(
            device,
            request(input_channels),
            request(output_channels),
            sample_rate,
            frames_per_buffer,
            options,
            Box::new(processor),
        )?;

        Ok(BlockingStream {
            stream,
            capture_rx,
            playback_tx,
            signal,
            overflows,
            underflows,
            input_channels,
            output_channels,
        })
    }

    pub fn start(&mut self) -> Result<()> {
        // One period of silence up front so the first callback has data.
        let prefill = self.stream.frames_per_buffer() * self.output_channels;
        for _ in 0..prefill.min(self.playback_tx.free_len()) {
            let _ = self.playback_tx.push(0.0);
        }
        self.stream.start()
    }

    /// Pop `interleaved.len() / input_channels` frames of captured audio,
    /// blocking until the callback has produced them. If the stream stops
    /// while waiting, the remainder is zero-filled.
    pub fn read(&mut self, interleaved: &mut [f32]) -> Result<()> {
        let mut done = 0;
        while done < interleaved.len() {
            done += self.capture_rx.pop_slice(&mut interleaved[done..]);
            if done >= interleaved.len() {
                break;
            }
            if !self.stream.is_active() {
                interleaved[done..].fill(0.0);
                break;
            }
            let seen = self.signal.current();
            if done < interleaved.len()
                && self.capture_rx.is_empty()
                && !self.signal.wait_past(seen, IO_TIMEOUT)
                && self.capture_rx.is_empty()
            {
                return Err(Error::IoTimeout);
            }
        }
        Ok(())
    }

    /// Push interleaved frames for playback, blocking while the ring is
    /// full. Frames still queued when the stream stops are discarded.
    pub fn write(&mut self, interleaved: &[f32]) -> Result<()> {
        let mut done = 0;
        while done < interleaved.len() {
            done += self.playback_tx.push_slice(&interleaved[done..]);
            if done >= interleaved.len() {
                break;
            }
            if !self.stream.is_active() {
                break;
            }
            let seen = self.signal.current();
            if self.playback_tx.is_full() && !self.signal.wait_past(seen, IO_TIMEOUT) {
                return Err(Error::IoTimeout);
            }
        }
        Ok(())
    }

    /// Frames of captured audio ready to read without blocking.
    pub fn read_available(&self) -> usize {
        match self.input_channels {
            0 => 0,
            channels => self.capture_rx.len() / channels,
        }
    }

    /// Frames that can be written without blocking.
    pub fn write_available(&self) -> usize {
        match self.output_channels {
            0 => 0,
            channels => self.playback_tx.free_len() / channels,
        }
    }

    /// Wrapper-level xruns: (capture ring overflows, playback ring
    /// underflows) since open.
    pub fn xruns(&self) -> (u32, u32) {
        (
            self.overflows.load(Ordering::Relaxed),
            self.underflows.load(Ordering::Relaxed),
        )
    }

    pub fn stop(&mut self) -> Result<()> {
        self.stream.stop()
    }

    pub fn abort(&mut self) -> Result<()> {
        self.stream.abort()
    }

    pub fn close(&mut self) -> Result<()> {
        self.stream.close()
    }

    pub fn is_active(&self) -> bool {
        self.stream.is_active()
    }

    pub fn is_stopped(&self) -> bool {
        self.stream.is_stopped()
    }

    pub fn latencies(&self) -> LatencySeconds {
        self.stream.latencies()
    }

    pub fn frames_per_buffer(&self) -> usize {
        self.stream.frames_per_buffer()
    }
}
