//! Data model shared by the capture, uplink, downlink and playback tasks.
//!
//! Frames and messages are ephemeral: created by one task, carried by one
//! queue, consumed exactly once on the other side.

use std::time::Instant;

/// One discrete unit of captured media with its capture timestamp.
#[derive(Debug, Clone)]
pub enum MediaFrame {
    /// Raw PCM audio chunk (mono S16LE).
    Audio {
        pcm: Vec<u8>,
        sample_rate: u32,
        captured_at: Instant,
    },
    /// Raw RGBA image frame from a camera or screen source.
    Image {
        rgba: Vec<u8>,
        width: u32,
        height: u32,
        captured_at: Instant,
    },
}

impl MediaFrame {
    pub fn captured_at(&self) -> Instant {
        match self {
            MediaFrame::Audio { captured_at, .. } | MediaFrame::Image { captured_at, .. } => {
                *captured_at
            }
        }
    }
}

/// Who produced a conversational turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

/// One completed conversational turn held in the rolling window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextTurn {
    pub role: Role,
    pub text: String,
}

/// Control markers that ride the outbound stream alongside media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// The local audio stream has ended; sent on session teardown.
    AudioStreamEnd,
}

/// Messages queued for the uplink worker.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    AudioChunk { pcm: Vec<u8>, sample_rate: u32 },
    ImageChunk { jpeg: Vec<u8> },
    TextTurn { text: String },
    TurnComplete,
    Control(ControlSignal),
    /// Recent turns re-sent as grounding context after a reconnect.
    ContextReplay(Vec<TextTurn>),
}

/// Classified messages produced by the downlink worker from raw transport
/// input.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    AudioChunk(Vec<u8>),
    TextChunk(String),
    TurnComplete,
    /// The user started speaking over the assistant; buffered playback audio
    /// is stale and must not play.
    Interrupted,
    ToolCall(serde_json::Value),
    ErrorNotice {
        kind: crate::transport::ErrorKind,
        message: String,
    },
}
