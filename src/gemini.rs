//! Gemini Live API transport.
//!
//! Implements the `transport` traits over the Live API WebSocket protocol:
//! the session setup handshake, realtime input serialization, server message
//! classification, and the mapping of wire-level failures onto the error
//! taxonomy the orchestrator acts on.

use crate::config::Config;
use crate::events::{ControlSignal, InboundEvent, OutboundMessage, Role, TextTurn};
use crate::transport::{
    Connection, Connector, ErrorKind, TransportError, TransportRx, TransportTx,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

// Context compression keeps long sessions under the model's token window.
const COMPRESSION_TRIGGER_TOKENS: u32 = 25_600;
const COMPRESSION_TARGET_TOKENS: u32 = 12_800;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Generation options inside the setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<serde_json::Value>,
}

/// Session setup message body.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SessionSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realtime_input_config: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window_compression: Option<serde_json::Value>,
}

/// Server -> client messages, keyed by their single top-level field.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    SetupComplete {
        #[serde(rename = "setupComplete")]
        setup_complete: serde_json::Value,
    },
    ServerContent {
        #[serde(rename = "serverContent")]
        server_content: serde_json::Value,
    },
    ToolCall {
        #[serde(rename = "toolCall")]
        tool_call: serde_json::Value,
    },
    ToolCallCancellation {
        #[serde(rename = "toolCallCancellation")]
        tool_call_cancellation: serde_json::Value,
    },
    GoAway {
        #[serde(rename = "goAway")]
        go_away: serde_json::Value,
    },
}

/// Setup options captured once from configuration.
#[derive(Debug, Clone)]
struct SetupOptions {
    media_resolution: &'static str,
    voice_name: String,
    enable_search: bool,
    turn_coverage: &'static str,
}

/// Connects Live API sessions for a given API key.
pub struct GeminiConnector {
    url: String,
    options: SetupOptions,
}

impl GeminiConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            url: format!("{LIVE_API_URL}?key={}", config.api_key),
            options: SetupOptions {
                media_resolution: config.media_resolution.as_str(),
                voice_name: config.voice_name.clone(),
                enable_search: config.enable_search,
                turn_coverage: config.turn_coverage.as_str(),
            },
        }
    }
}

impl Connector for GeminiConnector {
    type Conn = GeminiConnection;

    async fn connect(&self, model: &str) -> Result<GeminiConnection, TransportError> {
        info!(%model, "connecting to Live API");
        let (ws, _response) = connect_async(&self.url)
            .await
            .map_err(classify_handshake_error)?;
        let (sink, stream) = ws.split();
        let mut tx = GeminiTx { sink };
        let mut rx = GeminiRx {
            stream,
            pending: VecDeque::new(),
        };

        tx.send_json(setup_message(model, &self.options)).await?;
        match timeout(SETUP_TIMEOUT, rx.wait_setup_complete()).await {
            Ok(Ok(())) => {
                info!(%model, "session setup complete");
                Ok(GeminiConnection { tx, rx })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Transient(
                "timed out waiting for setup acknowledgment".into(),
            )),
        }
    }
}

fn setup_message(model: &str, options: &SetupOptions) -> serde_json::Value {
    let setup = SessionSetup {
        model: model.to_string(),
        generation_config: Some(GenerationConfig {
            response_modalities: vec!["AUDIO".to_string()],
            media_resolution: Some(options.media_resolution.to_string()),
            speech_config: Some(json!({
                "voiceConfig": {"prebuiltVoiceConfig": {"voiceName": options.voice_name}}
            })),
        }),
        tools: options.enable_search.then(|| json!([{"googleSearch": {}}])),
        realtime_input_config: Some(json!({"turnCoverage": options.turn_coverage})),
        context_window_compression: Some(json!({
            "triggerTokens": COMPRESSION_TRIGGER_TOKENS,
            "slidingWindow": {"targetTokens": COMPRESSION_TARGET_TOKENS}
        })),
    };
    json!({ "setup": setup })
}

/// One established Live API session.
pub struct GeminiConnection {
    tx: GeminiTx,
    rx: GeminiRx,
}

impl Connection for GeminiConnection {
    type Tx = GeminiTx;
    type Rx = GeminiRx;

    fn split(self) -> (GeminiTx, GeminiRx) {
        (self.tx, self.rx)
    }
}

pub struct GeminiTx {
    sink: WsSink,
}

impl GeminiTx {
    async fn send_json(&mut self, value: serde_json::Value) -> Result<(), TransportError> {
        let text = value.to_string();
        debug!(bytes = text.len(), "ws send");
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(classify_ws_error)
    }
}

impl TransportTx for GeminiTx {
    async fn send(&mut self, msg: OutboundMessage) -> Result<(), TransportError> {
        self.send_json(encode_outbound(&msg)).await
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.send(Message::Close(None)).await {
            debug!("close frame not delivered: {e}");
        }
        let _ = self.sink.close().await;
    }
}

/// Map one outbound message onto its Live API wire form.
fn encode_outbound(msg: &OutboundMessage) -> serde_json::Value {
    match msg {
        OutboundMessage::AudioChunk { pcm, sample_rate } => json!({
            "realtimeInput": {
                "audio": {
                    "data": BASE64.encode(pcm),
                    "mimeType": format!("audio/pcm;rate={sample_rate}"),
                }
            }
        }),
        OutboundMessage::ImageChunk { jpeg } => json!({
            "realtimeInput": {
                "video": {
                    "data": BASE64.encode(jpeg),
                    "mimeType": "image/jpeg",
                }
            }
        }),
        OutboundMessage::TextTurn { text } => json!({
            "clientContent": {
                "turns": [{"role": "user", "parts": [{"text": text}]}],
                "turnComplete": true,
            }
        }),
        OutboundMessage::TurnComplete => json!({
            "clientContent": {"turnComplete": true}
        }),
        OutboundMessage::Control(ControlSignal::AudioStreamEnd) => json!({
            "realtimeInput": {"audioStreamEnd": true}
        }),
        OutboundMessage::ContextReplay(turns) => {
            let turns: Vec<serde_json::Value> = turns
                .iter()
                .map(|turn| {
                    json!({
                        "role": match turn.role { Role::User => "user", Role::Model => "model" },
                        "parts": [{"text": turn.text}],
                    })
                })
                .collect();
            json!({
                "clientContent": {"turns": turns, "turnComplete": false}
            })
        }
    }
}

pub struct GeminiRx {
    stream: WsStream,
    pending: VecDeque<InboundEvent>,
}

impl GeminiRx {
    async fn wait_setup_complete(&mut self) -> Result<(), TransportError> {
        loop {
            match self.next_server_message().await? {
                ServerMessage::SetupComplete { .. } => return Ok(()),
                _ => debug!("server message before setup acknowledgment, ignoring"),
            }
        }
    }

    async fn next_server_message(&mut self) -> Result<ServerMessage, TransportError> {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(classify_ws_error(e)),
                None => return Err(TransportError::Disconnected("stream ended".into())),
            };
            let text = match msg {
                Message::Text(text) => text.to_string(),
                // The API occasionally delivers JSON payloads as binary frames
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => {
                        debug!("ignoring non-utf8 binary frame ({} bytes)", bytes.len());
                        continue;
                    }
                },
                Message::Close(frame) => return Err(classify_close(frame)),
                _ => continue,
            };
            match serde_json::from_str::<ServerMessage>(&text) {
                Ok(message) => return Ok(message),
                Err(e) => {
                    warn!("unparseable server message: {e}");
                    continue;
                }
            }
        }
    }
}

impl TransportRx for GeminiRx {
    async fn receive(&mut self) -> Result<InboundEvent, TransportError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            let message = self.next_server_message().await?;
            self.pending.extend(classify_server_message(message));
        }
    }
}

/// Map one server message onto zero or more inbound events, in wire order.
fn classify_server_message(message: ServerMessage) -> SmallVec<[InboundEvent; 4]> {
    let mut events = SmallVec::new();
    match message {
        ServerMessage::SetupComplete { .. } => {}
        ServerMessage::ServerContent { server_content } => {
            if server_content
                .get("interrupted")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
            {
                events.push(InboundEvent::Interrupted);
            }
            if let Some(parts) = server_content
                .pointer("/modelTurn/parts")
                .and_then(|p| p.as_array())
            {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                        if !text.is_empty() {
                            events.push(InboundEvent::TextChunk(text.to_string()));
                        }
                    } else if let Some(data) =
                        part.pointer("/inlineData/data").and_then(|d| d.as_str())
                    {
                        match BASE64.decode(data) {
                            Ok(pcm) if !pcm.is_empty() => {
                                events.push(InboundEvent::AudioChunk(pcm));
                            }
                            Ok(_) => {}
                            Err(e) => warn!("undecodable inline audio: {e}"),
                        }
                    }
                }
            }
            if server_content
                .get("turnComplete")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
            {
                events.push(InboundEvent::TurnComplete);
            }
        }
        ServerMessage::ToolCall { tool_call } => events.push(InboundEvent::ToolCall(tool_call)),
        ServerMessage::ToolCallCancellation { .. } => debug!("tool call cancelled by server"),
        ServerMessage::GoAway { go_away } => events.push(InboundEvent::ErrorNotice {
            kind: ErrorKind::Transient,
            message: format!("server going away: {go_away}"),
        }),
    }
    events
}

fn classify_close(frame: Option<CloseFrame>) -> TransportError {
    match frame {
        Some(frame) => {
            let code = u16::from(frame.code);
            let reason = frame.reason.to_string();
            let quota = code == 1011
                || reason.to_ascii_lowercase().contains("quota")
                || reason.contains("RESOURCE_EXHAUSTED");
            if quota {
                TransportError::Quota(format!("remote closed ({code}): {reason}"))
            } else {
                TransportError::Disconnected(format!("remote closed ({code}): {reason}"))
            }
        }
        None => TransportError::Disconnected("remote closed".into()),
    }
}

fn classify_ws_error(error: WsError) -> TransportError {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            TransportError::Disconnected(error.to_string())
        }
        WsError::Protocol(_) => TransportError::Disconnected(error.to_string()),
        WsError::Io(e) => TransportError::Transient(format!("socket error: {e}")),
        other => TransportError::Transient(other.to_string()),
    }
}

fn classify_handshake_error(error: WsError) -> TransportError {
    match &error {
        WsError::Http(response) => {
            let status = response.status();
            let body = response
                .body()
                .as_deref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            match status.as_u16() {
                401 | 403 => {
                    TransportError::Fatal(format!("handshake rejected ({status}): check API key"))
                }
                429 => TransportError::Quota(format!("handshake rejected ({status}): {body}")),
                code if code >= 500 => {
                    TransportError::Transient(format!("handshake failed ({status})"))
                }
                _ if body.contains("RESOURCE_EXHAUSTED")
                    || body.to_ascii_lowercase().contains("quota") =>
                {
                    TransportError::Quota(body)
                }
                _ => TransportError::Fatal(format!("handshake rejected ({status}): {body}")),
            }
        }
        _ => TransportError::Transient(error.to_string()),
    }
}
