//! Shared helpers for the integration tests.
//!
//! The device enforces a process-wide single-open policy, so every test
//! that opens a stream serializes through `device_lock`.

#![allow(dead_code)]

use hwstream::{ProcessIo, ProcessResult, StreamProcessor};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

pub fn device_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn f32_bytes(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_ne_bytes()).collect()
}

pub fn bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_ne_bytes(chunk.try_into().unwrap()))
        .collect()
}

#[derive(Default)]
pub struct Recorder {
    pub calls: AtomicU32,
    pub drains: AtomicU32,
    pub finished: AtomicU32,
    pub flags: Mutex<Vec<(bool, bool)>>,
    pub first_inputs: Mutex<Vec<Vec<f32>>>,
}

impl Recorder {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> u32 {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn flags_seen(&self) -> Vec<(bool, bool)> {
        self.flags.lock().unwrap().clone()
    }
}

/// Scriptable processor: fills each logical output channel with
/// `fill_base + channel`, records what it sees, and can return a non
/// -Continue result from a given call index or block its first call on a
/// rendezvous gate.
pub struct TestProcessor {
    pub recorder: Arc<Recorder>,
    pub fill_base: f32,
    /// From this zero-based call index on, return the given result.
    pub result_from: Option<(u32, ProcessResult)>,
    /// First call signals entry, then waits for release.
    pub gate: Option<(Sender<()>, Receiver<()>)>,
}

impl TestProcessor {
    pub fn new(recorder: Arc<Recorder>) -> Self {
        Self {
            recorder,
            fill_base: 10.0,
            result_from: None,
            gate: None,
        }
    }
}

impl StreamProcessor for TestProcessor {
    fn process(&mut self, io: &mut ProcessIo<'_>) -> ProcessResult {
        let call = self.recorder.calls.fetch_add(1, Ordering::SeqCst);

        let flags = io.flags();
        self.recorder
            .flags
            .lock()
            .unwrap()
            .push((flags.input_overflow, flags.output_underflow));

        if call == 0 {
            if let Some((entered, release)) = &self.gate {
                entered.send(()).unwrap();
                release.recv().unwrap();
            }
            let mut inputs = self.recorder.first_inputs.lock().unwrap();
            for ch in 0..io.input_channels() {
                if let Some(data) = io.input_f32(ch) {
                    inputs.push(data.to_vec());
                } else if let Some(data) = io.input_i32(ch) {
                    inputs.push(data.iter().map(|&s| s as f32).collect());
                }
            }
        }

        for ch in 0..io.output_channels() {
            if let Some(out) = io.output_f32_mut(ch) {
                out.fill(self.fill_base + ch as f32);
            } else if let Some(out) = io.output_i32_mut(ch) {
                out.fill((self.fill_base as i32 + ch as i32) << 16);
            }
        }

        match self.result_from {
            Some((from, result)) if call >= from => result,
            _ => ProcessResult::Continue,
        }
    }

    fn drain(&mut self, io: &mut ProcessIo<'_>) -> bool {
        self.recorder.drains.fetch_add(1, Ordering::SeqCst);
        for ch in 0..io.output_channels() {
            if let Some(out) = io.output_f32_mut(ch) {
                out.fill(0.0);
            }
        }
        true
    }

    fn finished(&mut self) {
        self.recorder.finished.fetch_add(1, Ordering::SeqCst);
    }
}
