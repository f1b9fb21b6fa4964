//! Screen frame source built on xcap's monitor recorder.

use crate::device::{DeviceError, FrameSource};
use crate::events::MediaFrame;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use tracing::info;
use xcap::{Frame, Monitor, VideoRecorder};

const FRAME_WAIT: Duration = Duration::from_millis(500);

/// Yields raw RGBA frames from the primary monitor. The recorder thread
/// only produces frames when screen content changes, so a blocking pull can
/// legitimately wait a long time on an idle desktop.
pub struct ScreenSource {
    /// Held so the recorder keeps feeding the frame channel.
    _recorder: VideoRecorder,
    frames: Receiver<Frame>,
}

impl ScreenSource {
    pub fn new() -> Result<Self, DeviceError> {
        let monitors = Monitor::all()
            .map_err(|e| DeviceError::Unavailable(format!("monitor enumeration: {e}")))?;
        let monitor = monitors
            .iter()
            .find(|m| m.is_primary().unwrap_or(false))
            .or_else(|| monitors.first())
            .ok_or_else(|| DeviceError::Unavailable("no monitors found".to_string()))?
            .clone();

        info!(
            monitor = %monitor.name().unwrap_or_else(|_| "unknown".to_string()),
            "screen capture ready"
        );

        let (recorder, frames) = monitor
            .video_recorder()
            .map_err(|e| DeviceError::Unavailable(format!("screen recorder: {e}")))?;
        recorder
            .start()
            .map_err(|e| DeviceError::Unavailable(format!("screen recorder start: {e}")))?;

        Ok(Self {
            _recorder: recorder,
            frames,
        })
    }
}

impl FrameSource for ScreenSource {
    fn label(&self) -> &'static str {
        "screen"
    }

    fn next_frame(&mut self) -> Result<MediaFrame, DeviceError> {
        loop {
            match self.frames.recv_timeout(FRAME_WAIT) {
                Ok(frame) => {
                    return Ok(MediaFrame::Image {
                        rgba: frame.raw,
                        width: frame.width,
                        height: frame.height,
                        captured_at: Instant::now(),
                    });
                }
                // no screen damage yet; keep waiting
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(DeviceError::Unavailable(
                        "screen recorder thread exited".to_string(),
                    ));
                }
            }
        }
    }
}
