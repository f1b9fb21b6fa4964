//! Capture pipeline: paced frame pulls, image encode policy, outbound enqueue.
//!
//! One task per source. A source is never polled faster than its configured
//! interval, which bounds CPU and outbound bandwidth regardless of how fast
//! the device could produce data.

use crate::device::{self, DeviceError, FrameSource};
use crate::events::{MediaFrame, OutboundMessage};
use crate::queue::MediaQueue;
use crate::session::WorkerEvent;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageEncoder, RgbaImage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Bounds applied to image frames before they leave the machine.
#[derive(Debug, Clone, Copy)]
pub struct EncodePolicy {
    pub max_size: (u32, u32),
    pub quality: u8,
}

/// Poll `source` once per `period` while `enabled` holds true, apply the
/// encode policy, and push frames onto the outbound queue.
///
/// A device failure disables the source (reported via `events`) and parks
/// the loop until the flag is raised again; the pipeline itself only ends on
/// shutdown. The source handle is dropped when the task exits.
pub(crate) async fn run_capture(
    mut source: Box<dyn FrameSource>,
    period: Duration,
    policy: Option<EncodePolicy>,
    queue: Arc<MediaQueue>,
    mut enabled: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
    events: mpsc::Sender<WorkerEvent>,
) {
    let label = source.label();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        source = label,
        period_ms = period.as_millis() as u64,
        "capture task started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }
        if !*enabled.borrow() {
            tokio::select! {
                changed = enabled.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    ticker.reset();
                    continue;
                }
                _ = shutdown.changed() => break,
            }
        }
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if !*enabled.borrow() {
            continue;
        }

        match device::run_blocking(|| source.next_frame()) {
            Ok(frame) => enqueue_frame(frame, policy, &queue),
            Err(DeviceError::Unavailable(reason)) => {
                warn!(source = label, %reason, "source unavailable, disabling");
                if events.send(WorkerEvent::SourceFailed(label)).await.is_err() {
                    break;
                }
            }
        }
    }
    info!(source = label, "capture task stopped");
}

fn enqueue_frame(frame: MediaFrame, policy: Option<EncodePolicy>, queue: &MediaQueue) {
    match frame {
        MediaFrame::Audio {
            pcm, sample_rate, ..
        } => {
            queue.push_audio(OutboundMessage::AudioChunk { pcm, sample_rate });
        }
        MediaFrame::Image {
            rgba,
            width,
            height,
            ..
        } => {
            let Some(policy) = policy else {
                debug!("image frame from a source without an encode policy, dropped");
                return;
            };
            match encode_jpeg(rgba, width, height, policy) {
                Ok(jpeg) => {
                    if !queue.push_image(OutboundMessage::ImageChunk { jpeg }) {
                        debug!("outbound queue full, image frame dropped");
                    }
                }
                Err(e) => warn!("image encode failed: {e}"),
            }
        }
    }
}

/// Bound an RGBA frame to the policy's max resolution and JPEG-encode it at
/// the configured quality.
pub fn encode_jpeg(
    rgba: Vec<u8>,
    width: u32,
    height: u32,
    policy: EncodePolicy,
) -> anyhow::Result<Vec<u8>> {
    let image = RgbaImage::from_raw(width, height, rgba)
        .ok_or_else(|| anyhow::anyhow!("rgba buffer does not match {width}x{height}"))?;
    let mut image = DynamicImage::ImageRgba8(image);
    let (max_width, max_height) = policy.max_size;
    if image.width() > max_width || image.height() > max_height {
        image = image.thumbnail(max_width, max_height);
    }
    let rgb = image.to_rgb8();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, policy.quality).write_image(
        rgb.as_raw(),
        rgb.width(),
        rgb.height(),
        image::ExtendedColorType::Rgb8,
    )?;
    Ok(jpeg)
}
