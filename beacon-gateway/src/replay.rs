//! Capture replay
//!
//! A capture is JSON lines, one decoded frame per line. Frames are fed to
//! the service at their recorded spacing divided by the speed factor.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use beacon_protocol::DecodedFrame;
use beacon_sim::{SimBroker, SimResolver};
use beacon_upstream::{UpstreamEvent, UpstreamService};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::settings::Settings;

pub fn load_capture(path: &Path) -> anyhow::Result<Vec<DecodedFrame>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read capture {}", path.display()))?;
    parse_capture(&text)
}

pub fn parse_capture(text: &str) -> anyhow::Result<Vec<DecodedFrame>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).with_context(|| format!("Bad frame on line {}", index + 1))
        })
        .collect()
}

/// Wait before each frame, relative to the one before it
pub fn frame_delays(frames: &[DecodedFrame], speed: f64) -> Vec<Duration> {
    let mut previous = frames.first().map(|f| f.captured_at_ms);
    frames
        .iter()
        .map(|frame| {
            let gap_ms = previous.map_or(0.0, |p| (frame.captured_at_ms - p).max(0.0));
            previous = Some(frame.captured_at_ms);
            Duration::from_secs_f64(gap_ms / speed / 1000.0)
        })
        .collect()
}

/// Replay `frames` and print every published message; returns the count
pub async fn run(settings: Settings, frames: Vec<DecodedFrame>, speed: f64) -> anyhow::Result<usize> {
    if !(speed.is_finite() && speed > 0.0) {
        bail!("speed must be a positive number, got {speed}");
    }

    let broker = SimBroker::new();
    let resolver = SimResolver::new().with_delay(Duration::from_millis(settings.resolve_delay_ms));
    let (events_tx, mut events_rx) = mpsc::channel(1024);
    let (frames_tx, frames_rx) = mpsc::channel(1024);

    let mut service =
        UpstreamService::new(settings.upstream.clone(), broker.transport(), resolver, events_tx)?;
    service.set_location(settings.location);
    service.prepare(settings.token.clone()).await?;
    service.start(frames_rx).await?;

    let printer_broker = broker.clone();
    let printer = tokio::spawn(async move {
        let mut printed = 0;
        while let Some(event) = events_rx.recv().await {
            match event {
                UpstreamEvent::MessagePublished { .. } => {
                    let published = printer_broker.published();
                    for message in published.iter().skip(printed) {
                        println!("{} {}", message.topic, message.message);
                    }
                    printed = published.len();
                }
                UpstreamEvent::Error { source, message } => warn!("{}: {}", source, message),
                other if other.is_connection() => info!("{:?}", other),
                other => debug!("{:?}", other),
            }
        }
        printed
    });

    info!("Replaying {} frames at {}x", frames.len(), speed);
    let delays = frame_delays(&frames, speed);
    for (frame, delay) in frames.into_iter().zip(delays) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if frames_tx.send(frame).await.is_err() {
            break;
        }
    }

    tokio::time::sleep(Duration::from_millis(settings.linger_ms)).await;
    service.shutdown().await;

    let printed = printer.await.context("Printer task failed")?;
    info!("Replay finished, {} messages published", printed);
    Ok(printed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPTURE: &str = r#"
{"sourceId":"00000000-0000-0000-0000-000000000001","rssi":-60,"payload":"0500000000","capturedAtMs":1000.0}
{"sourceId":"00000000-0000-0000-0000-000000000001","rssi":-61,"payload":"0500000001","capturedAtMs":1500.0,"isManufacturerFrame":true}

{"sourceId":"00000000-0000-0000-0000-000000000002","rssi":-62,"payload":"0500000002","capturedAtMs":1400.0}
"#;

    #[test]
    fn test_parse_capture_skips_blank_lines() {
        let frames = parse_capture(CAPTURE).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].payload, vec![0x05, 0x00, 0x00, 0x00, 0x01]);
        assert!(frames[1].is_manufacturer_frame);
        assert!(!frames[0].is_manufacturer_frame);
    }

    #[test]
    fn test_parse_capture_reports_line() {
        let err = parse_capture("{}\n").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_delays_scale_and_never_go_negative() {
        let frames = parse_capture(CAPTURE).unwrap();
        let delays = frame_delays(&frames, 2.0);
        assert_eq!(
            delays,
            vec![Duration::ZERO, Duration::from_millis(250), Duration::ZERO]
        );
    }

    #[tokio::test]
    async fn test_rejects_bad_speed() {
        let result = run(Settings::default(), Vec::new(), 0.0).await;
        assert!(result.is_err());
    }
}
