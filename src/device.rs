//! Device capability traits consumed by the capture and playback pipelines.
//!
//! Implementations block on the underlying hardware; pipelines drive them
//! through [`run_blocking`] so device waits never stall the runtime.

use crate::events::MediaFrame;
use tokio::runtime::{Handle, RuntimeFlavor};

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Hardware missing, busy, or torn down underneath us.
    #[error("device unavailable: {0}")]
    Unavailable(String),
}

/// Uniform "produce one timestamped media frame" capability over microphone,
/// camera and screen capture. Each source is exclusively owned by the single
/// capture task that polls it.
pub trait FrameSource: Send + 'static {
    /// Short label for diagnostics and degradation routing.
    fn label(&self) -> &'static str;

    /// Block until the next frame is available.
    fn next_frame(&mut self) -> Result<MediaFrame, DeviceError>;
}

/// Speaker playback capability. The sink's own write blocking is what paces
/// the playback pipeline.
pub trait MediaSink: Send + 'static {
    /// Block until the chunk has been handed to the device.
    fn play(&mut self, pcm: &[u8]) -> Result<(), DeviceError>;
}

/// Sink that swallows audio; stands in when no playback device is available.
pub struct NullSink;

impl MediaSink for NullSink {
    fn play(&mut self, _pcm: &[u8]) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Run a blocking device call without stalling other tasks. On the
/// multi-threaded runtime this hands the thread over via `block_in_place`;
/// on a current-thread runtime (tests) the call runs inline.
pub(crate) fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if matches!(handle.runtime_flavor(), RuntimeFlavor::MultiThread) => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}
