//! Stream lifecycle: start/stop/abort state machines, drain semantics,
//! reentrancy accounting, and open-time failure rollback.

mod common;

use common::{Recorder, TestProcessor, bytes_to_f32, device_lock};
use hwstream::dummy::{ManualDevice, ManualDeviceConfig};
use hwstream::{
    ChannelRequest, Direction, Error, ProcessResult, SampleEncoding, Stream, StreamOptions,
    StreamState,
};
use std::sync::Arc;
use std::sync::mpsc::channel;
use std::time::Duration;

fn open_duplex(
    device: &Arc<ManualDevice>,
    inputs: usize,
    outputs: usize,
    options: StreamOptions,
    processor: TestProcessor,
) -> hwstream::Result<Stream> {
    let request = |n: usize| (n > 0).then(|| ChannelRequest::new(n));
    Stream::open(
        device.clone(),
        request(inputs),
        request(outputs),
        48_000.0,
        None,
        options,
        Box::new(processor),
    )
}

#[test]
fn graceful_stop_drains_and_finishes_once() {
    let _guard = device_lock();
    let device = ManualDevice::new(ManualDeviceConfig {
        clock_period: Some(Duration::from_millis(1)),
        ..Default::default()
    });
    let recorder = Arc::new(Recorder::default());
    let mut stream = open_duplex(
        &device,
        2,
        2,
        StreamOptions::default(),
        TestProcessor::new(recorder.clone()),
    )
    .unwrap();

    stream.start().unwrap();
    assert!(stream.is_active());
    assert!(!stream.is_stopped());
    std::thread::sleep(Duration::from_millis(20));

    stream.stop().unwrap();
    assert!(stream.is_stopped());
    assert!(!stream.is_active());
    assert!(recorder.calls() > 0);
    assert_eq!(recorder.finished(), 1);
    assert_eq!(device.stop_calls(), 1);

    stream.close().unwrap();
}

#[test]
fn stop_without_callbacks_times_out_but_still_stops() {
    let _guard = device_lock();
    let device = ManualDevice::new(ManualDeviceConfig::default());
    let recorder = Arc::new(Recorder::default());
    let mut stream = open_duplex(
        &device,
        0,
        2,
        StreamOptions::default(),
        TestProcessor::new(recorder.clone()),
    )
    .unwrap();

    stream.start().unwrap();
    // Nobody pumps, so the drain completion can never arrive. The timeout
    // is reported but the stream must still end up stopped and closable.
    assert!(matches!(stream.stop(), Err(Error::DrainTimeout)));
    assert!(stream.is_stopped());
    stream.close().unwrap();
}

#[test]
fn complete_result_drains_subset_first_then_everything() {
    let _guard = device_lock();
    let device = ManualDevice::new(ManualDeviceConfig {
        input_channels: 0,
        output_channels: 4,
        ..Default::default()
    });
    let recorder = Arc::new(Recorder::default());
    let mut processor = TestProcessor::new(recorder.clone());
    processor.result_from = Some((0, ProcessResult::Complete));
    let options = StreamOptions {
        output_channel_offset: 2,
        ..Default::default()
    };
    let mut stream = open_duplex(&device, 0, 2, options, processor).unwrap();
    let frames = stream.frames_per_buffer();
    let junk = vec![0xAAu8; frames * 4];
    assert_eq!(stream.state(), StreamState::Stopped);

    stream.start().unwrap();
    assert_eq!(stream.state(), StreamState::Active);

    // First period: processor runs, returns Complete with an empty backlog,
    // so the stream flips straight into the silence state.
    device.pump(0);
    assert_eq!(stream.state(), StreamState::Draining);
    let phys2 = bytes_to_f32(&device.slot_snapshot(Direction::Output, 2, 0).unwrap());
    assert!(phys2.iter().all(|&s| s == 10.0));

    // First silent period touches only the designated-silent subset.
    device.fill_output(0, 1, &junk);
    device.fill_output(2, 1, &junk);
    device.pump(1);
    let phys0 = device.slot_snapshot(Direction::Output, 0, 1).unwrap();
    let phys2_half1 = device.slot_snapshot(Direction::Output, 2, 1).unwrap();
    assert!(phys0.iter().all(|&b| b == 0), "dummy slot must be zeroed");
    assert!(
        phys2_half1.iter().all(|&b| b == 0xAA),
        "audible slot untouched on the first silent period"
    );
    assert!(stream.is_active(), "still playing out");

    // Second silent period zeroes everything and completes the drain.
    device.fill_output(2, 0, &junk);
    device.pump(0);
    let phys2_half0 = device.slot_snapshot(Direction::Output, 2, 0).unwrap();
    assert!(phys2_half0.iter().all(|&b| b == 0));
    assert!(!stream.is_active());
    assert_eq!(recorder.finished(), 1);

    // Further periods must not re-deliver the finished notification.
    device.pump(1);
    device.pump(0);
    assert_eq!(recorder.finished(), 1);

    // The completion signal is already set; stop returns without waiting.
    stream.stop().unwrap();
    assert_eq!(recorder.finished(), 1);
    stream.close().unwrap();
}

#[test]
fn abort_goes_silent_without_drain() {
    let _guard = device_lock();
    let device = ManualDevice::new(ManualDeviceConfig {
        input_channels: 0,
        output_channels: 2,
        ..Default::default()
    });
    let recorder = Arc::new(Recorder::default());
    let mut stream = open_duplex(
        &device,
        0,
        2,
        StreamOptions::default(),
        TestProcessor::new(recorder.clone()),
    )
    .unwrap();

    stream.start().unwrap();
    device.pump(0);
    assert_eq!(recorder.calls(), 1);

    stream.abort().unwrap();
    assert!(stream.is_stopped());
    assert_eq!(recorder.finished(), 1);
    assert_eq!(device.stop_calls(), 1);

    // A period arriving between abort and driver teardown only zeroes.
    device.pump(1);
    assert_eq!(recorder.calls(), 1);

    stream.close().unwrap();
}

#[test]
fn reentrant_switch_is_dropped_and_reported() {
    let _guard = device_lock();
    let device = ManualDevice::new(ManualDeviceConfig {
        input_channels: 0,
        output_channels: 2,
        ..Default::default()
    });
    let recorder = Arc::new(Recorder::default());
    let mut processor = TestProcessor::new(recorder.clone());
    let (entered_tx, entered_rx) = channel();
    let (release_tx, release_rx) = channel();
    processor.gate = Some((entered_tx, release_rx));

    let mut stream = open_duplex(&device, 0, 2, StreamOptions::default(), processor).unwrap();
    stream.start().unwrap();

    // First period blocks inside the processor...
    let blocked_device = device.clone();
    let first = std::thread::spawn(move || blocked_device.pump(0));
    entered_rx.recv().unwrap();

    // ...while a second period arrives. It must return promptly without
    // processing anything.
    device.pump(1);
    assert_eq!(recorder.calls(), 1, "overlapped period must not process");

    release_tx.send(()).unwrap();
    first.join().unwrap();

    // The owning invocation drained the queued period as a miss; the next
    // real period sees the accumulated underflow flag.
    device.pump(0);
    let flags = recorder.flags_seen();
    assert_eq!(flags.len(), 2);
    assert_eq!(flags[0], (false, false));
    assert_eq!(flags[1], (false, true), "output underflow must be reported");

    stream.abort().unwrap();
    stream.close().unwrap();
}

#[test]
fn start_failure_reverts_to_stopped() {
    let _guard = device_lock();
    let device = ManualDevice::new(ManualDeviceConfig {
        fail_start: true,
        ..Default::default()
    });
    let recorder = Arc::new(Recorder::default());
    let mut stream = open_duplex(
        &device,
        2,
        2,
        StreamOptions::default(),
        TestProcessor::new(recorder.clone()),
    )
    .unwrap();

    let err = stream.start().unwrap_err();
    assert!(matches!(err, Error::Host { code: -1000, .. }));
    assert!(stream.is_stopped());
    assert!(!stream.is_active());
    stream.close().unwrap();
}

#[test]
fn second_open_is_rejected_until_close() {
    let _guard = device_lock();
    let first_device = ManualDevice::new(ManualDeviceConfig::default());
    let recorder = Arc::new(Recorder::default());
    let mut first = open_duplex(
        &first_device,
        2,
        2,
        StreamOptions::default(),
        TestProcessor::new(recorder.clone()),
    )
    .unwrap();

    let second_device = ManualDevice::new(ManualDeviceConfig::default());
    let err = open_duplex(
        &second_device,
        2,
        2,
        StreamOptions::default(),
        TestProcessor::new(recorder.clone()),
    )
    .unwrap_err();
    assert!(matches!(err, Error::DeviceUnavailable));

    first.close().unwrap();
    let mut second = open_duplex(
        &second_device,
        2,
        2,
        StreamOptions::default(),
        TestProcessor::new(recorder.clone()),
    )
    .unwrap();
    second.close().unwrap();
}

#[test]
fn rejected_buffer_size_retries_at_preferred() {
    let _guard = device_lock();
    let device = ManualDevice::new(ManualDeviceConfig {
        fail_create_except_preferred: true,
        ..Default::default()
    });
    let recorder = Arc::new(Recorder::default());
    let stream = Stream::open(
        device.clone(),
        None,
        Some(ChannelRequest::new(2)),
        48_000.0,
        Some(128),
        StreamOptions::default(),
        Box::new(TestProcessor::new(recorder.clone())),
    )
    .unwrap();

    assert_eq!(stream.frames_per_buffer(), 64, "fell back to preferred");
    assert_eq!(device.granted_frames(), 64);
    drop(stream);
}

#[test]
fn unsupported_encoding_fails_open_and_rolls_back() {
    let _guard = device_lock();
    let device = ManualDevice::new(ManualDeviceConfig {
        encoding: SampleEncoding::DsdInt8Ner8,
        ..Default::default()
    });
    let recorder = Arc::new(Recorder::default());
    let err = open_duplex(
        &device,
        2,
        2,
        StreamOptions::default(),
        TestProcessor::new(recorder.clone()),
    )
    .unwrap_err();
    assert!(matches!(err, Error::UnsupportedSampleEncoding(_)));

    // Rollback must release the process-wide guard.
    let healthy = ManualDevice::new(ManualDeviceConfig::default());
    let mut stream = open_duplex(
        &healthy,
        2,
        2,
        StreamOptions::default(),
        TestProcessor::new(recorder.clone()),
    )
    .unwrap();
    stream.close().unwrap();
}

#[test]
fn rejected_sample_rate_is_a_host_error() {
    let _guard = device_lock();
    let device = ManualDevice::new(ManualDeviceConfig {
        supported_rates: Some(vec![44_100.0]),
        ..Default::default()
    });
    let recorder = Arc::new(Recorder::default());
    let err = open_duplex(
        &device,
        2,
        2,
        StreamOptions::default(),
        TestProcessor::new(recorder.clone()),
    )
    .unwrap_err();
    assert!(matches!(err, Error::Host { code: -995, .. }));
}

#[test]
fn shifted_int_encoding_converts_both_directions() {
    if cfg!(target_endian = "big") {
        return;
    }
    let _guard = device_lock();
    let device = ManualDevice::new(ManualDeviceConfig {
        encoding: SampleEncoding::Int32Lsb16,
        ..Default::default()
    });
    let recorder = Arc::new(Recorder::default());
    let mut stream = open_duplex(
        &device,
        2,
        2,
        StreamOptions::default(),
        TestProcessor::new(recorder.clone()),
    )
    .unwrap();
    let frames = stream.frames_per_buffer();

    // The device delivers 16 significant bits right-aligned in 32-bit words.
    let raw: Vec<u8> = std::iter::repeat(7u32.to_le_bytes())
        .take(frames)
        .flatten()
        .collect();
    device.fill_input(0, 0, &raw);

    stream.start().unwrap();
    device.pump(0);

    // Input arrives left-aligned at the processor...
    let inputs = recorder.first_inputs.lock().unwrap().clone();
    assert!(inputs[0].iter().all(|&s| s == (7i32 << 16) as f32));

    // ...and processor output is shifted back down for the device.
    let snap = device.slot_snapshot(Direction::Output, 0, 0).unwrap();
    let device_words: Vec<u32> = snap
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    assert!(device_words.iter().all(|&w| w == 10));

    stream.abort().unwrap();
    stream.close().unwrap();
}

#[test]
fn post_output_hook_fires_when_supported() {
    let _guard = device_lock();
    let device = ManualDevice::new(ManualDeviceConfig {
        post_output: true,
        ..Default::default()
    });
    let recorder = Arc::new(Recorder::default());
    let mut stream = open_duplex(
        &device,
        0,
        2,
        StreamOptions::default(),
        TestProcessor::new(recorder.clone()),
    )
    .unwrap();

    stream.start().unwrap();
    device.pump(0);
    assert_eq!(device.output_ready_calls(), 1);

    stream.abort().unwrap();
    stream.close().unwrap();
}

#[test]
fn latencies_derive_from_driver_frames() {
    let _guard = device_lock();
    let device = ManualDevice::new(ManualDeviceConfig::default());
    let recorder = Arc::new(Recorder::default());
    let stream = open_duplex(
        &device,
        2,
        2,
        StreamOptions::default(),
        TestProcessor::new(recorder.clone()),
    )
    .unwrap();

    let frames = stream.frames_per_buffer() as f64;
    let latencies = stream.latencies();
    assert_eq!(latencies.input, frames / 48_000.0);
    assert_eq!(latencies.output, frames * 2.0 / 48_000.0);
    drop(stream);
}

#[test]
fn control_panel_only_while_stopped() {
    let _guard = device_lock();
    let device = ManualDevice::new(ManualDeviceConfig::default());
    let recorder = Arc::new(Recorder::default());
    let mut stream = open_duplex(
        &device,
        0,
        2,
        StreamOptions::default(),
        TestProcessor::new(recorder.clone()),
    )
    .unwrap();

    stream.control_panel().unwrap();
    assert_eq!(device.control_panel_calls(), 1);

    stream.start().unwrap();
    assert!(matches!(stream.control_panel(), Err(Error::StreamNotStopped)));

    stream.abort().unwrap();
    stream.close().unwrap();
}
