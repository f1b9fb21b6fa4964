//! PulseAudio microphone source and speaker sink.
//!
//! 16-bit little-endian mono PCM: capture at the session's send rate,
//! playback at the receive rate, matching what the Live API consumes and
//! produces.

use crate::device::{DeviceError, FrameSource, MediaSink};
use crate::events::MediaFrame;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::time::Instant;
use tracing::info;

/// Captures audio from the default input device using PulseAudio's simple
/// API. One blocking read yields one fixed-size chunk.
pub struct MicSource {
    simple: Simple,
    sample_rate: u32,
    chunk_bytes: usize,
}

impl MicSource {
    pub fn new(
        app_name: &str,
        sample_rate: u32,
        chunk_samples: usize,
    ) -> Result<Self, DeviceError> {
        let spec = Spec {
            format: Format::S16le,
            channels: 1,
            rate: sample_rate,
        };
        let simple = Simple::new(
            None,     // default server
            app_name, // application name
            Direction::Record,
            None,      // default device
            "capture", // stream description
            &spec,
            None, // default channel map
            None, // default buffering
        )
        .map_err(|e| DeviceError::Unavailable(format!("pulseaudio record stream: {e}")))?;

        info!(sample_rate, chunk_samples, "microphone capture ready");
        Ok(Self {
            simple,
            sample_rate,
            chunk_bytes: chunk_samples * 2,
        })
    }
}

impl FrameSource for MicSource {
    fn label(&self) -> &'static str {
        "mic"
    }

    fn next_frame(&mut self) -> Result<MediaFrame, DeviceError> {
        let mut pcm = vec![0u8; self.chunk_bytes];
        self.simple
            .read(&mut pcm)
            .map_err(|e| DeviceError::Unavailable(format!("microphone read: {e}")))?;
        Ok(MediaFrame::Audio {
            pcm,
            sample_rate: self.sample_rate,
            captured_at: Instant::now(),
        })
    }
}

/// Plays PCM on the default output device. The blocking write paces the
/// playback pipeline.
pub struct SpeakerSink {
    simple: Simple,
}

impl SpeakerSink {
    pub fn new(app_name: &str, sample_rate: u32) -> Result<Self, DeviceError> {
        let spec = Spec {
            format: Format::S16le,
            channels: 1,
            rate: sample_rate,
        };
        let simple = Simple::new(
            None,
            app_name,
            Direction::Playback,
            None,
            "playback",
            &spec,
            None,
            None,
        )
        .map_err(|e| DeviceError::Unavailable(format!("pulseaudio playback stream: {e}")))?;

        info!(sample_rate, "speaker playback ready");
        Ok(Self { simple })
    }
}

impl MediaSink for SpeakerSink {
    fn play(&mut self, pcm: &[u8]) -> Result<(), DeviceError> {
        self.simple
            .write(pcm)
            .map_err(|e| DeviceError::Unavailable(format!("speaker write: {e}")))
    }
}
