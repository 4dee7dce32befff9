//! Session behavior against the mock cameras.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use camera_session::mock::{DeviceCall, MockCamera, MockPushCamera, TestPattern};
use camera_session::validation::{validate_fifo_order, validate_frame_len};
use camera_session::{
    Command, ControlId, ControlValue, FrameMetadata, FrameSize, Response, Roi, Session,
    SessionConfig, SessionError,
};
use crossbeam_channel::{unbounded, Receiver};

const SENSOR: FrameSize = FrameSize::new(16, 8);
const WAIT: Duration = Duration::from_secs(5);

fn synthetic() -> MockCamera {
    MockCamera::new()
        .with_max_size(SENSOR)
        .with_frame_interval(Duration::from_millis(2))
}

fn config(buffers: usize) -> SessionConfig {
    SessionConfig::default().with_buffer_count(buffers)
}

/// Start streaming with a callback that forwards metadata to a channel.
fn stream_metadata(session: &Session) -> Receiver<(FrameMetadata, Vec<u8>)> {
    let (tx, rx) = unbounded();
    session
        .start_streaming(move |data, metadata| {
            let _ = tx.send((metadata.clone(), data.to_vec()));
        })
        .expect("streaming should start");
    rx
}

fn recv_frames(rx: &Receiver<(FrameMetadata, Vec<u8>)>, count: usize) -> Vec<FrameMetadata> {
    (0..count)
        .map(|_| rx.recv_timeout(WAIT).expect("frame should arrive").0)
        .collect()
}

fn wait_until<F: FnMut() -> bool>(mut condition: F) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_pool_hands_out_exactly_n_buffers() {
    let session = Session::with_device(synthetic(), &config(3)).expect("session should open");
    let pool = session.pool();

    let handles: Vec<_> = (0..3).map(|_| pool.claim_next().expect("claim")).collect();
    assert_eq!(
        handles.iter().map(|h| h.index()).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert!(pool.claim_next().is_none(), "claim N+1 must fail");

    for handle in handles {
        pool.release(handle).expect("release should succeed");
    }
    assert_eq!(pool.available(), 3);
}

#[test]
fn test_sync_submit_sees_processed_result() {
    let camera = synthetic();
    let log = camera.call_log();
    let session = Session::with_device(camera, &config(2)).expect("session should open");

    session
        .set_control(ControlId::GAIN, ControlValue::Int32(80))
        .expect("gain write");
    assert_eq!(
        session.read_control(ControlId::GAIN).expect("gain read"),
        ControlValue::Int32(80)
    );
    assert_eq!(
        log.commands(),
        vec![
            DeviceCall::ApplyControl(ControlId::GAIN, ControlValue::Int32(80)),
            DeviceCall::ReadControl(ControlId::GAIN),
        ]
    );
}

#[test]
fn test_commands_processed_in_submission_order() {
    let camera = synthetic().with_control_delay(Duration::from_millis(20));
    let log = camera.call_log();
    let session = Session::with_device(camera, &config(2)).expect("session should open");
    let (done_tx, done_rx) = unbounded();

    for (tag, id, value) in [
        (1, ControlId::GAIN, ControlValue::Int32(10)),
        (2, ControlId::BRIGHTNESS, ControlValue::Int32(5)),
    ] {
        let done_tx = done_tx.clone();
        session
            .submit_async(Command::SetControl { id, value }, move |result| {
                let _ = done_tx.send((tag, result.is_ok()));
            })
            .expect("submit");
    }

    let result = session.submit(Command::GetControl(ControlId::GAIN));
    assert!(matches!(
        result,
        Ok(Response::Value(ControlValue::Int32(10)))
    ));

    assert_eq!(done_rx.try_iter().collect::<Vec<_>>(), vec![(1, true), (2, true)]);
    assert_eq!(
        log.commands(),
        vec![
            DeviceCall::ApplyControl(ControlId::GAIN, ControlValue::Int32(10)),
            DeviceCall::ApplyControl(ControlId::BRIGHTNESS, ControlValue::Int32(5)),
            DeviceCall::ReadControl(ControlId::GAIN),
        ]
    );
}

#[test]
fn test_async_completions_delivered_exactly_once_across_close() {
    let camera = synthetic().with_control_delay(Duration::from_millis(10));
    let session = Session::with_device(camera, &config(2)).expect("session should open");
    let completions = Arc::new(AtomicUsize::new(0));

    for _ in 0..5 {
        let completions = Arc::clone(&completions);
        session
            .submit_async(Command::GetControl(ControlId::GAIN), move |_| {
                completions.fetch_add(1, Ordering::SeqCst);
            })
            .expect("submit");
    }
    session.close().expect("close");

    assert_eq!(completions.load(Ordering::SeqCst), 5);
}

#[test]
fn test_stop_streaming_when_stopped_is_rejected() {
    let camera = synthetic();
    let log = camera.call_log();
    let session = Session::with_device(camera, &config(2)).expect("session should open");

    assert!(matches!(
        session.stop_streaming(),
        Err(SessionError::InvalidCommand(_))
    ));
    assert_eq!(log.count(&DeviceCall::StopCapture), 0);
    assert!(!session.is_streaming());
}

#[test]
fn test_start_streaming_twice_is_rejected() {
    let session = Session::with_device(synthetic(), &config(2)).expect("session should open");

    session.start_streaming(|_, _| {}).expect("first start");
    assert!(session.is_streaming());
    assert!(matches!(
        session.start_streaming(|_, _| {}),
        Err(SessionError::InvalidCommand(_))
    ));

    session.stop_streaming().expect("stop");
    assert!(!session.is_streaming());
}

#[test]
fn test_synthetic_frames_delivered_in_order() {
    let camera = synthetic().with_pattern(TestPattern::Counter);
    let session = Session::with_device(camera, &config(4)).expect("session should open");

    let rx = stream_metadata(&session);
    let frames: Vec<_> = (0..10)
        .map(|_| rx.recv_timeout(WAIT).expect("frame should arrive"))
        .collect();
    session.stop_streaming().expect("stop");

    let metadata: Vec<_> = frames.iter().map(|(meta, _)| meta.clone()).collect();
    validate_fifo_order(&metadata).expect("frames in FIFO order");
    for (meta, data) in &frames {
        validate_frame_len(data, meta, 1).expect("full frame delivered");
        assert_eq!(meta.size, SENSOR);
    }

    wait_until(|| session.stats().frames_delivered >= 10);
    assert_eq!(session.stats().buffer_count, 4);
}

#[test]
fn test_reconfigure_while_streaming_restarts_once() {
    let camera = synthetic();
    let log = camera.call_log();
    let session = Session::with_device(camera, &config(4)).expect("session should open");
    let small = FrameSize::new(8, 4);

    let rx = stream_metadata(&session);
    recv_frames(&rx, 3);

    session.set_resolution(small).expect("resolution change");
    assert!(session.is_streaming());

    // Frames queued before the change may still arrive; after the first
    // frame at the new size, every frame must use it.
    let mut seen_small = false;
    for meta in recv_frames(&rx, 10) {
        if meta.size == small {
            seen_small = true;
        } else {
            assert!(!seen_small, "old geometry delivered after new geometry");
            assert_eq!(meta.size, SENSOR);
        }
    }
    assert!(seen_small);
    session.close().expect("close");

    let calls = log.calls();
    let stop = calls
        .iter()
        .position(|call| *call == DeviceCall::StopCapture)
        .expect("capture stopped for reconfiguration");
    assert_eq!(
        calls.get(stop..stop + 3),
        Some(
            &[
                DeviceCall::StopCapture,
                DeviceCall::ApplyResolution(small),
                DeviceCall::StartCapture,
            ][..]
        )
    );
    assert!(calls
        .iter()
        .skip(stop)
        .all(|call| !matches!(call, DeviceCall::Frame(size) if *size != small)));
    // One restart for the change plus the initial start; the final stop
    // comes from close.
    assert_eq!(log.count(&DeviceCall::StartCapture), 2);
    assert_eq!(log.count(&DeviceCall::StopCapture), 2);
}

#[test]
fn test_frame_interval_change_while_streaming_restarts_once() {
    let camera = synthetic();
    let log = camera.call_log();
    let session = Session::with_device(camera, &config(4)).expect("session should open");
    let rx = stream_metadata(&session);
    recv_frames(&rx, 2);

    let interval = Duration::from_millis(5);
    session.set_frame_interval(interval).expect("interval change");
    assert!(session.is_streaming());
    recv_frames(&rx, 2);

    assert!(matches!(
        session.set_frame_interval(Duration::ZERO),
        Err(SessionError::InvalidCommand(_))
    ));
    session.close().expect("close");

    let calls = log.commands();
    let stop = calls
        .iter()
        .position(|call| *call == DeviceCall::StopCapture)
        .expect("capture stopped for reconfiguration");
    assert_eq!(
        calls.get(stop..stop + 3),
        Some(
            &[
                DeviceCall::StopCapture,
                DeviceCall::ApplyFrameInterval(interval),
                DeviceCall::StartCapture,
            ][..]
        )
    );
    assert_eq!(
        log.count(&DeviceCall::ApplyFrameInterval(Duration::ZERO)),
        0,
        "zero interval never reaches the device"
    );
}

#[test]
fn test_menu_item_labels() {
    let camera = synthetic();
    let log = camera.call_log();
    let session = Session::with_device(camera, &config(2)).expect("session should open");

    assert_eq!(
        session
            .menu_item(ControlId::POWER_LINE_FREQUENCY, 2)
            .expect("menu entry"),
        "60 Hz"
    );
    assert!(matches!(
        session.menu_item(ControlId::POWER_LINE_FREQUENCY, 5),
        Err(SessionError::OutOfRange { value: 5, .. })
    ));
    assert!(matches!(
        session.menu_item(ControlId::GAIN, 0),
        Err(SessionError::InvalidControlType { .. })
    ));
    assert_eq!(
        log.commands(),
        vec![DeviceCall::ReadMenuItem(ControlId::POWER_LINE_FREQUENCY, 2)],
        "rejected queries never reach the device"
    );
}

#[test]
fn test_long_frame_interval_capped_by_max_wait() {
    let camera = MockCamera::new()
        .with_max_size(SENSOR)
        .with_frame_interval(Duration::from_secs(10));
    let config = config(4).with_max_frame_wait(Duration::from_millis(20));
    let session = Session::with_device(camera, &config).expect("session should open");

    let rx = stream_metadata(&session);
    recv_frames(&rx, 1);
    let started = Instant::now();
    recv_frames(&rx, 4);
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(60),
        "frames paced faster than the cap: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(2),
        "frames waited for the full interval: {elapsed:?}"
    );

    let started = Instant::now();
    session
        .set_control(ControlId::GAIN, ControlValue::Int32(20))
        .expect("gain write");
    assert!(started.elapsed() < Duration::from_secs(1));

    let started = Instant::now();
    session.close().expect("close");
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_roi_change_while_stopped_does_not_start_capture() {
    let camera = synthetic();
    let log = camera.call_log();
    let session = Session::with_device(camera, &config(2)).expect("session should open");

    session.set_roi(Roi::new(4, 2, 8, 4)).expect("roi change");
    assert_eq!(session.producer().frame_size(), FrameSize::new(8, 4));
    assert_eq!(log.commands(), vec![DeviceCall::ApplyRoi(Roi::new(4, 2, 8, 4))]);
}

#[test]
fn test_geometry_larger_than_buffers_rejected() {
    let camera = synthetic();
    let log = camera.call_log();
    let session = Session::with_device(camera, &config(2)).expect("session should open");

    assert!(matches!(
        session.set_resolution(FrameSize::new(32, 8)),
        Err(SessionError::OutOfRange {
            control: ControlId::FRAME_FORMAT,
            ..
        })
    ));
    assert!(log.commands().is_empty(), "device never reconfigured");
}

#[test]
fn test_backpressure_drops_without_descriptors() {
    let camera = MockPushCamera::new().with_max_size(FrameSize::new(4, 4));
    let trigger = camera.trigger();
    let session = Session::with_device(camera, &config(2)).expect("session should open");

    let (entered_tx, entered_rx) = unbounded();
    let (gate_tx, gate_rx) = unbounded::<()>();
    session
        .start_streaming(move |_, metadata| {
            let _ = entered_tx.send(metadata.sequence);
            let _ = gate_rx.recv();
        })
        .expect("streaming should start");

    assert!(trigger.push(&[1; 16]));
    assert_eq!(entered_rx.recv_timeout(WAIT), Ok(0));

    // The callback holds buffer 0 and buffer 1 sits in the queue.
    assert!(trigger.push(&[2; 16]));
    assert!(!trigger.push(&[3; 16]));
    assert!(!trigger.push(&[4; 16]));

    let stats = session.stats();
    assert_eq!(stats.frames_produced, 2);
    assert_eq!(stats.frames_dropped, 2);
    assert_eq!(stats.buffers_available, 0);
    assert_eq!(
        session.read_control(ControlId::DROPPED).expect("dropped readable"),
        ControlValue::ReadOnly(2)
    );

    gate_tx.send(()).expect("gate");
    assert_eq!(entered_rx.recv_timeout(WAIT), Ok(1), "sequence 2 and 3 were dropped");
    gate_tx.send(()).expect("gate");
    wait_until(|| session.stats().frames_delivered == 2);
    wait_until(|| session.pool().available() == 2);

    session
        .set_control(ControlId::DROPPED_RESET, ControlValue::Boolean(true))
        .expect("reset");
    assert_eq!(session.stats().frames_dropped, 0);
}

#[test]
fn test_panicking_callback_does_not_shrink_pool() {
    let camera = MockPushCamera::new().with_max_size(FrameSize::new(4, 4));
    let trigger = camera.trigger();
    let session = Session::with_device(camera, &config(2)).expect("session should open");

    #[allow(clippy::panic)]
    session
        .start_streaming(|_, _| panic!("application bug"))
        .expect("streaming should start");

    assert!(trigger.push(&[0; 16]));
    wait_until(|| session.pool().available() == 2);
    assert!(trigger.push(&[0; 16]));
    wait_until(|| session.pool().available() == 2);
    assert_eq!(session.stats().frames_delivered, 0);
}

#[test]
fn test_control_validation_before_enqueue() {
    let camera = synthetic();
    let log = camera.call_log();
    let session = Session::with_device(camera, &config(2)).expect("session should open");

    assert!(matches!(
        session.test_control(ControlId::GAMMA, &ControlValue::Int32(1)),
        Err(SessionError::InvalidControl(ControlId::GAMMA))
    ));
    assert!(matches!(
        session.test_control(ControlId::GAIN, &ControlValue::Boolean(true)),
        Err(SessionError::InvalidControlType { .. })
    ));
    assert!(matches!(
        session.set_control(ControlId::GAIN, ControlValue::Int32(101)),
        Err(SessionError::OutOfRange { value: 101, .. })
    ));
    assert!(matches!(
        session.set_control(ControlId::BINNING, ControlValue::Discrete(3)),
        Err(SessionError::OutOfRange { value: 3, .. })
    ));
    assert!(matches!(
        session.set_control(ControlId::TEMPERATURE, ControlValue::ReadOnly(0)),
        Err(SessionError::InvalidControlType { .. })
    ));
    assert!(matches!(
        session.set_control(ControlId::DROPPED, ControlValue::ReadOnly(0)),
        Err(SessionError::InvalidControlType { .. })
    ));
    assert!(log.commands().is_empty(), "rejected values never reach the device");

    session
        .set_control(ControlId::BINNING, ControlValue::Discrete(2))
        .expect("binning 2 allowed");
    session
        .test_control(ControlId::HFLIP, &ControlValue::Boolean(true))
        .expect("booleans always accepted");
    assert_eq!(
        session.control_range(ControlId::GAIN).expect("gain range"),
        (0, 100, 1, 50)
    );
    assert_eq!(
        session
            .read_control(ControlId::TEMPERATURE)
            .expect("temperature readable"),
        ControlValue::ReadOnly(-10)
    );
}

#[test]
fn test_device_errors_surface_unchanged() {
    let camera = synthetic().with_failing_control(ControlId::BRIGHTNESS);
    let session = Session::with_device(camera, &config(2)).expect("session should open");

    assert!(matches!(
        session.set_control(ControlId::BRIGHTNESS, ControlValue::Int32(3)),
        Err(SessionError::DeviceIo(_))
    ));
}

#[test]
fn test_failed_stop_keeps_streaming() {
    let camera = synthetic().with_failing_stop();
    let session = Session::with_device(camera, &config(2)).expect("session should open");

    session.start_streaming(|_, _| {}).expect("start");
    assert!(matches!(
        session.stop_streaming(),
        Err(SessionError::DeviceIo(_))
    ));
    assert!(session.is_streaming());
    assert!(session.producer().is_active(), "producer still accepts frames");
}

#[test]
fn test_invalid_config_builds_nothing() {
    let camera = synthetic();
    let log = camera.call_log();

    let result = Session::with_device(camera, &config(0));
    assert!(matches!(result, Err(SessionError::MemAlloc(_))));
    assert_eq!(log.calls(), vec![DeviceCall::Close]);
}

#[test]
fn test_teardown_races_with_hardware_callbacks() {
    for _ in 0..20 {
        let camera = MockPushCamera::new().with_max_size(FrameSize::new(8, 8));
        let session = Session::with_device(camera, &config(4)).expect("session should open");
        session
            .start_streaming(|_, _| thread::sleep(Duration::from_micros(200)))
            .expect("streaming should start");

        let producer = session.producer().clone();
        let pool = session.pool().clone();
        let running = Arc::new(AtomicBool::new(true));
        let pushers: Vec<_> = (0..4)
            .map(|_| {
                let producer = producer.clone();
                let running = Arc::clone(&running);
                thread::spawn(move || {
                    let payload = [7u8; 64];
                    while running.load(Ordering::Relaxed) {
                        producer.on_frame(&payload);
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(2));
        session.close().expect("close while producers run");

        assert!(pool.is_closed());
        let claims_at_close = pool.total_claims();
        assert!(!producer.on_frame(&[1; 64]), "producer refuses frames after close");

        thread::sleep(Duration::from_millis(1));
        running.store(false, Ordering::Relaxed);
        for pusher in pushers {
            pusher.join().expect("pusher should not panic");
        }

        assert_eq!(pool.total_claims(), claims_at_close, "no claim after close");
        assert_eq!(pool.available(), 0);
    }
}

#[test]
fn test_auto_push_camera_streams_until_stopped() {
    let camera = MockPushCamera::new()
        .with_max_size(FrameSize::new(8, 4))
        .with_auto_push(Duration::from_millis(1));
    let log = camera.call_log();
    let session = Session::with_device(camera, &config(4)).expect("session should open");

    let rx = stream_metadata(&session);
    let frames = recv_frames(&rx, 5);
    validate_fifo_order(&frames).expect("frames in FIFO order");

    session.stop_streaming().expect("stop");
    let pushed = log.frames();
    thread::sleep(Duration::from_millis(10));
    assert_eq!(log.frames(), pushed, "no frame pushed after stop");
}

#[test]
fn test_manual_push_after_stop_is_refused() {
    let camera = MockPushCamera::new().with_max_size(FrameSize::new(8, 4));
    let trigger = camera.trigger();
    let session = Session::with_device(camera, &config(8)).expect("session should open");
    session.start_streaming(|_, _| {}).expect("start");

    let running = Arc::new(AtomicBool::new(true));
    let pusher = {
        let trigger = trigger.clone();
        let running = Arc::clone(&running);
        thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                trigger.push(&[3u8; 32]);
            }
        })
    };

    thread::sleep(Duration::from_millis(2));
    session.stop_streaming().expect("stop");
    let produced = session.stats().frames_produced;
    thread::sleep(Duration::from_millis(5));
    running.store(false, Ordering::Relaxed);
    pusher.join().expect("pusher should not panic");

    assert!(!trigger.is_capturing());
    assert!(!trigger.push(&[3u8; 32]));
    assert_eq!(session.stats().frames_produced, produced, "no frame queued after stop");
}
