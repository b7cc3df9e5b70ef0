use std::{env, thread, time::Duration};

use uvcflow::prelude::*;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match env::args().nth(1) {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default().monitor_interval(Duration::from_millis(500)),
    };
    let seconds = env::args()
        .nth(2)
        .and_then(|v| v.parse().ok())
        .unwrap_or(3u64);
    init_logging(config.log_format, config.log_level);

    let transport = RecordingTransport::new();
    let camera = VirtualCamera::new(VirtualCameraConfig {
        frame_interval: Some(Duration::from_millis(33)),
        ..VirtualCameraConfig::default()
    });
    let encoder = VirtualEncoder::with_faults(
        FourCc::MJPG,
        EncoderFaults {
            latency: Some(Duration::from_millis(5)),
            fail_output_every: Some(50),
            ..EncoderFaults::default()
        },
    );

    let pipeline = PipelineBuilder::new(config)
        .capture_device(camera)
        .encoder_device(encoder)
        .transport(transport.clone())
        .start()?;
    if !pipeline.wait_ready(Duration::from_secs(2)) {
        eprintln!("stages not ready: {:?}", pipeline.stage_statuses());
    }

    let control = pipeline.control();
    control.request_start(None)?;
    thread::sleep(Duration::from_secs(seconds));

    control.post_raw_event(uvcflow::control::RAW_ERROR_REPORT, b"demo error report")?;
    control.request_stop()?;
    thread::sleep(Duration::from_millis(200));
    println!("queue depths: {:?}", control.get_queue_depths());
    if let Some(report) = pipeline.latest_report() {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    let report = pipeline.shutdown();
    println!(
        "delivered {} frames ({} recorded), dropped {}, released at teardown {}, in {:?}",
        report.counters.delivered,
        transport.len(),
        report.counters.dropped,
        report.released_during_teardown,
        report.elapsed
    );
    for (stage, status) in report.stages {
        println!("{stage}: {status:?}");
    }
    Ok(())
}
