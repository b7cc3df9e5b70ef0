use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use uvcflow::{
    prelude::*,
    stages::{CaptureStage, Stage, capture::CaptureOutcome},
};

fn fast_config() -> PipelineConfig {
    PipelineConfig::default()
        .poll_interval(Duration::from_millis(10))
        .idle_interval(Duration::from_millis(10))
        .monitor_interval(Duration::from_millis(50))
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    done()
}

struct Rig {
    pipeline: Pipeline,
    transport: RecordingTransport,
    ledger: Arc<SlotLedger>,
}

fn rig(camera: VirtualCameraConfig, encoder: VirtualEncoder) -> Rig {
    let camera = VirtualCamera::new(camera);
    let ledger = camera.ledger();
    let transport = RecordingTransport::new();
    let pipeline = PipelineBuilder::new(fast_config())
        .capture_device(camera)
        .encoder_device(encoder)
        .transport(transport.clone())
        .start()
        .unwrap();
    assert!(pipeline.wait_ready(Duration::from_secs(2)));
    Rig {
        pipeline,
        transport,
        ledger,
    }
}

#[test]
fn burst_into_full_channel_drops_overflow_and_keeps_order() {
    let camera = VirtualCamera::new(VirtualCameraConfig {
        slot_count: 8,
        frame_limit: Some(5),
        ..VirtualCameraConfig::default()
    });
    let ledger = camera.ledger();
    let (tx, rx) = bounded(3);
    let counters = Arc::new(FrameCounters::new());
    let mut stage = CaptureStage::new(
        uvcflow::device::CaptureHandle::new(camera),
        tx,
        Arc::new(ReadinessFlags::new()),
        counters.clone(),
        StageTiming::default(),
        StreamFormat::default(),
    );
    stage.init().unwrap();

    let outcomes: Vec<_> = (0..5).map(|_| stage.capture_once()).collect();
    let dropped = outcomes
        .iter()
        .filter(|o| matches!(o, CaptureOutcome::Dropped { .. }))
        .count();
    assert_eq!(dropped, 2);
    assert_eq!(ledger.returns(), 2);

    let sequences: Vec<u64> = rx
        .drain()
        .into_iter()
        .map(|frame| {
            let sequence = frame.meta().sequence;
            assert_eq!(frame_id(frame.data()), Some(sequence));
            frame.discard();
            sequence
        })
        .collect();
    assert_eq!(sequences, vec![0, 1, 2]);
    assert_eq!(ledger.returns(), ledger.checkouts());
    assert_eq!(ledger.double_returns(), 0);

    let snap = counters.snapshot();
    assert_eq!((snap.captured, snap.dropped), (5, 2));
}

#[test]
fn nothing_is_counted_before_streaming_starts() {
    let rig = rig(VirtualCameraConfig::default(), VirtualEncoder::new(FourCc::MJPG));
    thread::sleep(Duration::from_millis(60));
    let snap = rig.pipeline.counters();
    assert_eq!(
        (snap.captured, snap.encoded, snap.delivered, snap.dropped),
        (0, 0, 0, 0)
    );
    assert_eq!(rig.ledger.checkouts(), 0);
    assert!(rig.transport.is_empty());
    rig.pipeline.shutdown();
}

#[test]
fn frames_flow_in_order_and_stop_counting_after_stop() {
    let rig = rig(VirtualCameraConfig::default(), VirtualEncoder::new(FourCc::MJPG));
    let control = rig.pipeline.control();
    control.request_start(Some(StreamFormat::default())).unwrap();
    assert!(wait_until(Duration::from_secs(5), || rig.transport.len() >= 10));

    control.request_stop().unwrap();
    assert!(wait_until(Duration::from_secs(2), || !rig.pipeline.flags().is_streaming()));
    let stopped = rig.pipeline.counters();
    thread::sleep(Duration::from_millis(60));
    let later = rig.pipeline.counters();
    assert_eq!(
        (later.captured, later.encoded, later.delivered),
        (stopped.captured, stopped.encoded, stopped.delivered)
    );
    assert!(later.is_ordered());

    let ids: Vec<u64> = rig
        .transport
        .frames()
        .iter()
        .filter_map(|frame| frame.frame_id)
        .collect();
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));

    let report = rig.pipeline.shutdown();
    assert!(report.counters.is_ordered());
}

#[test]
fn counters_stay_ordered_across_resets() {
    let rig = rig(VirtualCameraConfig::default(), VirtualEncoder::new(FourCc::MJPG));
    let control = rig.pipeline.control();
    control.request_start(None).unwrap();
    assert!(wait_until(Duration::from_secs(5), || rig.transport.len() >= 3));

    let start_epoch = rig.pipeline.counters().epoch;
    for _ in 0..5 {
        control.post_control_event(ControlEvent::ResetCounters).unwrap();
        let deadline = Instant::now() + Duration::from_millis(30);
        while Instant::now() < deadline {
            let snap = control.get_counters();
            assert!(snap.is_ordered(), "out of order: {snap:?}");
        }
    }
    assert!(rig.pipeline.counters().epoch >= start_epoch + 5);
    rig.pipeline.shutdown();
}

#[test]
fn shutdown_returns_every_slot_promptly() {
    let rig = rig(
        VirtualCameraConfig::default(),
        VirtualEncoder::with_faults(
            FourCc::MJPG,
            EncoderFaults {
                latency: Some(Duration::from_millis(2)),
                ..EncoderFaults::default()
            },
        ),
    );
    rig.pipeline.control().request_start(None).unwrap();
    assert!(wait_until(Duration::from_secs(5), || rig.transport.len() >= 5));

    let report = rig.pipeline.shutdown();
    // Stages notice shutdown within a poll; allow three plus the encoder latency.
    let poll = Duration::from_millis(10);
    let bound = 3 * poll + Duration::from_millis(2);
    assert!(report.elapsed < bound, "took {:?}", report.elapsed);
    assert!(
        report
            .stages
            .iter()
            .all(|(_, status)| *status == StageStatus::Exited),
        "{:?}",
        report.stages
    );
    assert_eq!(rig.ledger.outstanding(), 0);
    assert_eq!(rig.ledger.double_returns(), 0);
    assert!(report.counters.is_ordered());
    assert_eq!(
        report.counters.delivered + report.counters.dropped,
        report.counters.captured
    );
}

#[test]
fn teardown_releases_frames_left_in_queues() {
    let camera = VirtualCamera::new(VirtualCameraConfig::default());
    let ledger = camera.ledger();
    let config = fast_config();
    let delivery_depth = config.delivery_queue_depth;
    let pipeline = PipelineBuilder::new(config)
        .capture_device(camera)
        .encoder_device(VirtualEncoder::new(FourCc::MJPG))
        .pull_delivery()
        .start()
        .unwrap();
    let pool = pipeline.frame_pool().clone();
    assert!(pipeline.wait_ready(Duration::from_secs(2)));
    let control = pipeline.control();
    control.request_start(None).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        control.get_queue_depths().encode_to_delivery == delivery_depth
    }));
    assert!(pool.stats().in_use > 0);

    let report = pipeline.shutdown();
    assert!(report.released_during_teardown >= delivery_depth);
    assert_eq!(report.counters.delivered, 0);
    assert_eq!(
        report.counters.delivered + report.counters.dropped,
        report.counters.captured
    );
    assert_eq!(ledger.outstanding(), 0);
    assert_eq!(ledger.double_returns(), 0);
    assert_eq!(pool.stats().in_use, 0);
}

#[test]
fn encoder_faults_drop_frames_without_leaking_slots() {
    let rig = rig(
        VirtualCameraConfig {
            frame_limit: Some(6),
            ..VirtualCameraConfig::default()
        },
        VirtualEncoder::with_faults(
            FourCc::MJPG,
            EncoderFaults {
                reject_input_every: Some(2),
                ..EncoderFaults::default()
            },
        ),
    );
    rig.pipeline.control().request_start(None).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        let snap = rig.pipeline.counters();
        snap.delivered + snap.dropped == 6
    }));

    let report = rig.pipeline.shutdown();
    assert_eq!(report.counters.captured, 6);
    assert!(report.counters.dropped >= 3);
    assert_eq!(rig.ledger.checkouts(), 6);
    assert_eq!(rig.ledger.outstanding(), 0);
    assert_eq!(rig.ledger.double_returns(), 0);
}

#[test]
fn unadvertised_start_leaves_streaming_off() {
    let rig = rig(VirtualCameraConfig::default(), VirtualEncoder::new(FourCc::MJPG));
    let control = rig.pipeline.control();
    let vga = StreamFormat::new(FourCc::YUYV, Resolution::new(640, 480).unwrap());

    assert_eq!(
        control.request_start(Some(vga)),
        Err(ControlError::ConfigurationUnsupported(vga))
    );
    control
        .post_control_event(ControlEvent::StartStream(Some(vga)))
        .unwrap();
    assert!(wait_until(Duration::from_secs(1), || control.get_queue_depths().control == 0));
    thread::sleep(Duration::from_millis(30));
    assert!(!rig.pipeline.flags().is_streaming());
    assert_eq!(rig.ledger.checkouts(), 0);
    rig.pipeline.shutdown();
}

#[test]
fn error_reports_land_in_history() {
    let rig = rig(VirtualCameraConfig::default(), VirtualEncoder::new(FourCc::MJPG));
    let control = rig.pipeline.control();
    control
        .post_raw_event(uvcflow::control::RAW_ERROR_REPORT, b"usb reset")
        .unwrap();
    control.post_raw_event(42, &[]).unwrap();
    assert!(wait_until(Duration::from_secs(1), || !control.recent_errors().is_empty()));
    assert_eq!(control.recent_errors()[0].message, "usb reset");
    assert!(!rig.pipeline.flags().is_streaming());
    rig.pipeline.shutdown();
}

#[test]
fn failed_capture_init_leaves_other_stages_running() {
    let transport = RecordingTransport::new();
    let pipeline = PipelineBuilder::new(fast_config())
        .capture_device(VirtualCamera::new(VirtualCameraConfig {
            fail_configure: true,
            ..VirtualCameraConfig::default()
        }))
        .encoder_device(VirtualEncoder::new(FourCc::MJPG))
        .transport(transport)
        .start()
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || matches!(
        pipeline.stage_status("capture"),
        Some(StageStatus::Failed(_))
    )));
    assert_eq!(pipeline.stage_status("encode"), Some(StageStatus::Running));
    assert!(!pipeline.flags().is_set(Flag::CaptureReady));

    pipeline.control().request_start(None).unwrap();
    assert!(wait_until(Duration::from_secs(2), || pipeline.flags().is_streaming()));

    let report = pipeline.shutdown();
    for (name, status) in &report.stages {
        if *name == "capture" {
            assert!(matches!(status, StageStatus::Failed(_)));
        } else {
            assert_eq!(*status, StageStatus::Exited, "{name}");
        }
    }
}

#[test]
fn pull_delivery_hands_frames_to_the_host() {
    let camera = VirtualCamera::new(VirtualCameraConfig::default());
    let ledger = camera.ledger();
    let mut pipeline = PipelineBuilder::new(fast_config())
        .capture_device(camera)
        .encoder_device(VirtualEncoder::new(FourCc::MJPG))
        .pull_delivery()
        .start()
        .unwrap();
    let mut pull = pipeline.take_pull_delivery().unwrap();
    assert!(matches!(
        pipeline.take_pull_delivery(),
        Err(PipelineError::DeliveryTaken)
    ));
    assert!(pipeline.wait_ready(Duration::from_secs(2)));
    pipeline.control().request_start(None).unwrap();

    let mut last = None;
    for _ in 0..4 {
        let frame = pull
            .request_next_frame(Duration::from_secs(2))
            .expect("encoded frame");
        assert_eq!(frame.codec_tag(), Some(FourCc::MJPG));
        assert_eq!(&frame.data()[..2], &[0xff, 0xd8]);
        let id = frame_id(frame.data());
        assert!(id > last);
        last = id;
        pull.return_frame(frame);
    }
    assert!(pipeline.counters().delivered >= 4);

    let report = pipeline.shutdown();
    assert!(report.counters.is_ordered());
    assert_eq!(ledger.outstanding(), 0);
    assert!(pull.request_next_frame(Duration::from_millis(1)).is_none());
}

#[test]
fn builder_rejects_incomplete_setups() {
    let missing = PipelineBuilder::new(fast_config())
        .capture_device(VirtualCamera::new(VirtualCameraConfig::default()))
        .encoder_device(VirtualEncoder::new(FourCc::MJPG))
        .start();
    assert!(matches!(missing, Err(PipelineError::MissingComponent("transport"))));

    let both = PipelineBuilder::new(fast_config())
        .capture_device(VirtualCamera::new(VirtualCameraConfig::default()))
        .encoder_device(VirtualEncoder::new(FourCc::MJPG))
        .transport(RecordingTransport::new())
        .pull_delivery()
        .start();
    assert!(matches!(both, Err(PipelineError::InvalidConfig(_))));

    let vga = StreamFormat::new(FourCc::MJPG, Resolution::new(640, 480).unwrap());
    let unsupported = PipelineBuilder::new(fast_config().stream(vga))
        .capture_device(VirtualCamera::new(VirtualCameraConfig::default()))
        .encoder_device(VirtualEncoder::new(FourCc::MJPG))
        .transport(RecordingTransport::new())
        .start();
    let err = unsupported.unwrap_err();
    assert_eq!(err.code(), "invalid_config");
    assert_eq!(err.class(), ErrorClass::ConfigurationUnsupported);
}

#[test]
fn monitor_publishes_reports() {
    let rig = rig(VirtualCameraConfig::default(), VirtualEncoder::new(FourCc::MJPG));
    rig.pipeline.control().request_start(None).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        rig.pipeline
            .latest_report()
            .is_some_and(|report| report.streaming && report.counters.delivered > 0)
    }));
    let report = rig.pipeline.latest_report().unwrap();
    assert_eq!(report.capacities.capture_to_encode, 3);
    assert_eq!(report.capacities.control, 10);
    assert!(report.encode.samples > 0);
    rig.pipeline.shutdown();
}
