//! Session orchestration: lifecycle state machine, reconnect-with-fallback,
//! the conversation window, and the runtime command surface.
//!
//! The orchestrator task exclusively owns all session state. Everything else
//! talks to it over channels: the front end through [`SessionHandle`], the
//! workers through [`WorkerEvent`]. Status queries hand out owned snapshots.

use crate::capture::{run_capture, EncodePolicy};
use crate::config::{Config, VideoMode};
use crate::device::{FrameSource, MediaSink, NullSink};
use crate::downlink::run_downlink;
use crate::events::{OutboundMessage, Role, TextTurn};
use crate::playback::{self, PlaybackHandle};
use crate::queue::{BlockingQueue, MediaQueue};
use crate::transport::{Connection, Connector, ErrorKind, TransportError};
use crate::uplink::run_uplink;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

const COMMAND_CHANNEL_CAPACITY: usize = 32;
const EVENT_CHANNEL_CAPACITY: usize = 256;
const WORKER_CHANNEL_CAPACITY: usize = 64;
const TEXT_QUEUE_CAPACITY: usize = 16;

/// Connection lifecycle, as visible in status snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Active,
    Reconnecting,
    Closed,
}

/// Read-only view of the orchestrator's state.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub connection: ConnectionState,
    pub active_model: String,
    pub video_mode: VideoMode,
    pub camera_enabled: bool,
    pub screen_enabled: bool,
    pub window: Vec<TextTurn>,
}

/// Commands accepted from the front end. Applied immediately while Active,
/// buffered while Connecting/Reconnecting, rejected once Closed.
#[derive(Debug)]
pub enum Command {
    SetVideoMode(VideoMode),
    EnableCamera(bool),
    EnableScreen(bool),
    InjectText(String),
    ClearConversation,
    GetStatus(oneshot::Sender<StatusSnapshot>),
    Shutdown,
}

/// Notifications published to the front end.
#[derive(Debug)]
pub enum SessionEvent {
    Connected { model: String },
    Reconnecting { reason: String },
    AssistantText(String),
    TurnComplete,
    Interrupted,
    ToolCall(serde_json::Value),
    SourceDisabled { source: &'static str },
    Closed { reason: Option<String> },
}

/// Terminal session failures.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("all models exhausted (last failure: {0})")]
    ModelsExhausted(String),
    #[error(transparent)]
    Fatal(TransportError),
}

/// Events flowing from worker tasks back to the orchestrator.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    /// Send or receive on the current connection failed.
    TransportDown(TransportError),
    /// In-band service notice; classified by the orchestrator.
    Notice(TransportError),
    TextDelta(String),
    ModelTurn(String),
    Interrupted,
    ToolCall(serde_json::Value),
    SourceFailed(&'static str),
}

/// Devices handed to the session. A missing entry disables that path.
pub struct Devices {
    pub mic: Option<Box<dyn FrameSource>>,
    pub camera: Option<Box<dyn FrameSource>>,
    pub screen: Option<Box<dyn FrameSource>>,
    pub speaker: Option<Box<dyn MediaSink>>,
}

impl Devices {
    pub fn none() -> Self {
        Self {
            mic: None,
            camera: None,
            screen: None,
            speaker: None,
        }
    }
}

/// Front-end handle to a running session. All methods return false (or
/// None) once the session is closed.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
}

impl SessionHandle {
    pub async fn set_video_mode(&self, mode: VideoMode) -> bool {
        self.commands.send(Command::SetVideoMode(mode)).await.is_ok()
    }

    pub async fn enable_camera(&self, enabled: bool) -> bool {
        self.commands
            .send(Command::EnableCamera(enabled))
            .await
            .is_ok()
    }

    pub async fn enable_screen(&self, enabled: bool) -> bool {
        self.commands
            .send(Command::EnableScreen(enabled))
            .await
            .is_ok()
    }

    pub async fn inject_text(&self, text: String) -> bool {
        self.commands.send(Command::InjectText(text)).await.is_ok()
    }

    pub async fn clear_conversation(&self) -> bool {
        self.commands.send(Command::ClearConversation).await.is_ok()
    }

    pub async fn status(&self) -> Option<StatusSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::GetStatus(reply_tx))
            .await
            .ok()?;
        reply_rx.await.ok()
    }

    pub async fn shutdown(&self) -> bool {
        self.commands.send(Command::Shutdown).await.is_ok()
    }
}

/// Spawn a session. Returns the command handle, the event stream, and the
/// orchestrator task whose result is the session's terminal outcome.
pub fn start<C: Connector>(
    config: Config,
    connector: C,
    devices: Devices,
) -> (
    SessionHandle,
    mpsc::Receiver<SessionEvent>,
    JoinHandle<Result<(), SessionError>>,
) {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let orchestrator = Orchestrator::new(config, connector, devices, command_rx, event_tx);
    let task = tokio::spawn(orchestrator.run());
    (
        SessionHandle {
            commands: command_tx,
        },
        event_rx,
        task,
    )
}

/// Rolling window of completed turns; the oldest is evicted at capacity.
pub(crate) struct ConversationWindow {
    turns: VecDeque<TextTurn>,
    capacity: usize,
}

impl ConversationWindow {
    fn new(capacity: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, turn: TextTurn) {
        if self.capacity == 0 {
            return;
        }
        if self.turns.len() == self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
    }

    fn recent(&self, count: usize) -> Vec<TextTurn> {
        let skip = self.turns.len().saturating_sub(count);
        self.turns.iter().skip(skip).cloned().collect()
    }

    fn clear(&mut self) {
        self.turns.clear();
    }

    fn snapshot(&self) -> Vec<TextTurn> {
        self.turns.iter().cloned().collect()
    }
}

struct RetryPolicy {
    attempts: u32,
    base_delay: Duration,
    timeout: Duration,
}

enum ActiveExit {
    Shutdown,
    Reconnect(TransportError),
    Fatal(TransportError),
}

struct Orchestrator<C: Connector> {
    config: Config,
    connector: C,
    commands: mpsc::Receiver<Command>,
    session_events: mpsc::Sender<SessionEvent>,

    state: ConnectionState,
    models: Vec<String>,
    active_index: usize,
    window: ConversationWindow,
    video_mode: VideoMode,
    camera_enabled: bool,
    screen_enabled: bool,
    pending: Vec<Command>,
    connected_once: bool,
    capture_started: bool,

    devices: Option<Devices>,
    media: Arc<MediaQueue>,
    text: Arc<BlockingQueue<OutboundMessage>>,
    playback: PlaybackHandle,
    playback_buffer: Arc<BlockingQueue<Vec<u8>>>,

    worker_tx: mpsc::Sender<WorkerEvent>,
    worker_rx: mpsc::Receiver<WorkerEvent>,
    shutdown_tx: watch::Sender<bool>,
    audio_flag: watch::Sender<bool>,
    camera_flag: watch::Sender<bool>,
    screen_flag: watch::Sender<bool>,
    conn_stop: Option<watch::Sender<bool>>,
    uplink_task: Option<JoinHandle<()>>,
    downlink_task: Option<JoinHandle<()>>,
}

impl<C: Connector> Orchestrator<C> {
    fn new(
        config: Config,
        connector: C,
        devices: Devices,
        commands: mpsc::Receiver<Command>,
        session_events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let models = std::iter::once(config.model.clone())
            .chain(config.fallback_models.iter().cloned())
            .collect();
        let (playback, playback_buffer) =
            playback::new_pipeline(config.playback_buffer_chunks, config.playback_push_timeout);
        let (worker_tx, worker_rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);
        let video_mode = config.video_mode;
        let (audio_flag, _) = watch::channel(true);
        let (camera_flag, _) = watch::channel(video_mode.camera());
        let (screen_flag, _) = watch::channel(video_mode.screen());

        Self {
            media: Arc::new(MediaQueue::new(config.media_queue_capacity)),
            text: Arc::new(BlockingQueue::new(TEXT_QUEUE_CAPACITY, None)),
            window: ConversationWindow::new(config.memory_turns),
            camera_enabled: video_mode.camera(),
            screen_enabled: video_mode.screen(),
            video_mode,
            state: ConnectionState::Disconnected,
            models,
            active_index: 0,
            pending: Vec::new(),
            connected_once: false,
            capture_started: false,
            devices: Some(devices),
            playback,
            playback_buffer,
            worker_tx,
            worker_rx,
            shutdown_tx,
            audio_flag,
            camera_flag,
            screen_flag,
            conn_stop: None,
            uplink_task: None,
            downlink_task: None,
            config,
            connector,
            commands,
            session_events,
        }
    }

    async fn run(mut self) -> Result<(), SessionError> {
        info!(model = %self.models[0], "session starting");
        self.state = ConnectionState::Connecting;

        let outcome = loop {
            let conn = match self.connect_phase().await {
                Ok(Some(conn)) => conn,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            self.enter_active(conn).await;
            match self.active_loop().await {
                ActiveExit::Shutdown => break Ok(()),
                ActiveExit::Reconnect(error) => {
                    self.begin_reconnect(&error).await;
                }
                ActiveExit::Fatal(error) => break Err(SessionError::Fatal(error)),
            }
        };

        self.close(&outcome).await;
        outcome
    }

    /// Drive connection establishment while buffering runtime commands.
    /// Returns None when the user shut the session down mid-connect.
    async fn connect_phase(&mut self) -> Result<Option<C::Conn>, SessionError> {
        let retry = RetryPolicy {
            attempts: self.config.connect_attempts,
            base_delay: self.config.reconnect_base_delay,
            timeout: self.config.connect_timeout,
        };
        let outcome = {
            let fut = establish(&self.connector, &self.models, self.active_index, &retry);
            tokio::pin!(fut);
            loop {
                tokio::select! {
                    result = &mut fut => break Some(result),
                    cmd = self.commands.recv() => match cmd {
                        None | Some(Command::Shutdown) => break None,
                        Some(Command::GetStatus(reply)) => {
                            let snapshot = StatusSnapshot {
                                connection: self.state,
                                active_model: self.models
                                    [self.active_index.min(self.models.len() - 1)]
                                .clone(),
                                video_mode: self.video_mode,
                                camera_enabled: self.camera_enabled,
                                screen_enabled: self.screen_enabled,
                                window: self.window.snapshot(),
                            };
                            let _ = reply.send(snapshot);
                        }
                        Some(cmd) => self.pending.push(cmd),
                    },
                }
            }
        };
        match outcome {
            None => Ok(None),
            Some(Ok((conn, index))) => {
                self.active_index = index;
                Ok(Some(conn))
            }
            Some(Err(e)) => Err(e),
        }
    }

    async fn enter_active(&mut self, conn: C::Conn) {
        // workers from the previous connection are gone; anything they left
        // behind about that connection is stale
        self.drain_stale_worker_events();

        let dropped = self.media.drain();
        if dropped > 0 {
            debug!(frames = dropped, "discarded stale outbound media");
        }

        let (tx, rx) = conn.split();
        let (stop_tx, stop_rx) = watch::channel(false);

        if !self.connected_once {
            if let Some(prompt) = self.config.system_prompt.clone() {
                self.window.push(TextTurn {
                    role: Role::User,
                    text: prompt.clone(),
                });
                self.text.push(OutboundMessage::TextTurn { text: prompt }).await;
            }
        } else if self.config.context_replay_turns > 0 {
            let turns = self.window.recent(self.config.context_replay_turns);
            if !turns.is_empty() {
                info!(turns = turns.len(), "replaying conversational context");
                self.text.push(OutboundMessage::ContextReplay(turns)).await;
            }
        }
        self.connected_once = true;

        self.uplink_task = Some(tokio::spawn(run_uplink(
            tx,
            self.text.clone(),
            self.media.clone(),
            self.worker_tx.clone(),
            stop_rx.clone(),
        )));
        self.downlink_task = Some(tokio::spawn(run_downlink(
            rx,
            self.playback.clone(),
            self.worker_tx.clone(),
            stop_rx,
        )));
        self.conn_stop = Some(stop_tx);

        if !self.capture_started {
            self.spawn_media_tasks();
            self.capture_started = true;
        }

        self.state = ConnectionState::Active;
        let model = self.models[self.active_index].clone();
        info!(%model, "session active");
        self.publish(SessionEvent::Connected { model });

        for cmd in std::mem::take(&mut self.pending) {
            self.apply_command(cmd).await;
        }
    }

    /// Spawn capture and playback once, for the life of the session. Each
    /// task exclusively owns its device handle and drops it on shutdown.
    fn spawn_media_tasks(&mut self) {
        let Some(devices) = self.devices.take() else {
            return;
        };
        let shutdown = self.shutdown_tx.subscribe();

        if let Some(mic) = devices.mic {
            tokio::spawn(run_capture(
                mic,
                self.config.chunk_duration(),
                None,
                self.media.clone(),
                self.audio_flag.subscribe(),
                shutdown.clone(),
                self.worker_tx.clone(),
            ));
        } else {
            warn!("no microphone source available; audio capture disabled");
        }

        if let Some(camera) = devices.camera {
            tokio::spawn(run_capture(
                camera,
                self.config.camera_interval,
                Some(EncodePolicy {
                    max_size: self.config.max_image_size,
                    quality: self.config.image_quality,
                }),
                self.media.clone(),
                self.camera_flag.subscribe(),
                shutdown.clone(),
                self.worker_tx.clone(),
            ));
        } else if self.video_mode.camera() {
            warn!("camera requested but no camera source available");
            self.camera_enabled = false;
            let _ = self.camera_flag.send(false);
        }

        if let Some(screen) = devices.screen {
            tokio::spawn(run_capture(
                screen,
                self.config.screen_interval,
                Some(EncodePolicy {
                    max_size: self.config.max_screen_size,
                    quality: self.config.screen_quality,
                }),
                self.media.clone(),
                self.screen_flag.subscribe(),
                shutdown.clone(),
                self.worker_tx.clone(),
            ));
        } else if self.video_mode.screen() {
            warn!("screen capture requested but no screen source available");
            self.screen_enabled = false;
            let _ = self.screen_flag.send(false);
        }

        let sink = devices.speaker.unwrap_or_else(|| {
            warn!("no speaker sink available; inbound audio will be discarded");
            Box::new(NullSink)
        });
        tokio::spawn(playback::run_playback(
            sink,
            self.playback_buffer.clone(),
            shutdown,
        ));
    }

    async fn active_loop(&mut self) -> ActiveExit {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Shutdown) => return ActiveExit::Shutdown,
                    Some(cmd) => self.apply_command(cmd).await,
                },
                event = self.worker_rx.recv() => match event {
                    None => return ActiveExit::Shutdown,
                    Some(WorkerEvent::TransportDown(e)) => return ActiveExit::Reconnect(e),
                    Some(WorkerEvent::Notice(e)) => match e.kind() {
                        ErrorKind::Quota => {
                            warn!("service reported quota exhaustion: {e}");
                            return ActiveExit::Reconnect(e);
                        }
                        ErrorKind::Fatal => return ActiveExit::Fatal(e),
                        _ => debug!("transient service notice: {e}"),
                    },
                    Some(event) => self.handle_info_event(event),
                },
            }
        }
    }

    fn handle_info_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::TextDelta(delta) => self.publish(SessionEvent::AssistantText(delta)),
            WorkerEvent::ModelTurn(text) => {
                if !text.is_empty() {
                    self.window.push(TextTurn {
                        role: Role::Model,
                        text,
                    });
                }
                self.publish(SessionEvent::TurnComplete);
            }
            WorkerEvent::Interrupted => self.publish(SessionEvent::Interrupted),
            WorkerEvent::ToolCall(call) => self.publish(SessionEvent::ToolCall(call)),
            WorkerEvent::SourceFailed(source) => {
                match source {
                    "camera" => {
                        self.camera_enabled = false;
                        let _ = self.camera_flag.send(false);
                    }
                    "screen" => {
                        self.screen_enabled = false;
                        let _ = self.screen_flag.send(false);
                    }
                    _ => {
                        let _ = self.audio_flag.send(false);
                    }
                }
                self.publish(SessionEvent::SourceDisabled { source });
            }
            WorkerEvent::TransportDown(_) | WorkerEvent::Notice(_) => {}
        }
    }

    async fn apply_command(&mut self, cmd: Command) {
        match cmd {
            Command::SetVideoMode(mode) => {
                info!(mode = mode.as_str(), "video mode changed");
                self.video_mode = mode;
                self.camera_enabled = mode.camera();
                self.screen_enabled = mode.screen();
                let _ = self.camera_flag.send(self.camera_enabled);
                let _ = self.screen_flag.send(self.screen_enabled);
            }
            Command::EnableCamera(enabled) => {
                info!(enabled, "camera toggled");
                self.camera_enabled = enabled;
                let _ = self.camera_flag.send(enabled);
            }
            Command::EnableScreen(enabled) => {
                info!(enabled, "screen capture toggled");
                self.screen_enabled = enabled;
                let _ = self.screen_flag.send(enabled);
            }
            Command::InjectText(text) => {
                self.window.push(TextTurn {
                    role: Role::User,
                    text: text.clone(),
                });
                self.text.push(OutboundMessage::TextTurn { text }).await;
            }
            Command::ClearConversation => {
                self.window.clear();
                info!("conversation window cleared");
            }
            Command::GetStatus(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => {}
        }
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            connection: self.state,
            active_model: self.models[self.active_index.min(self.models.len() - 1)].clone(),
            video_mode: self.video_mode,
            camera_enabled: self.camera_enabled,
            screen_enabled: self.screen_enabled,
            window: self.window.snapshot(),
        }
    }

    async fn begin_reconnect(&mut self, error: &TransportError) {
        warn!("connection lost ({error}); reconnecting");
        self.state = ConnectionState::Reconnecting;
        self.publish(SessionEvent::Reconnecting {
            reason: error.to_string(),
        });
        self.stop_connection_workers().await;
        self.playback.flush();
        if error.kind() == ErrorKind::Quota {
            // this model is spent for the episode; resume from the next one
            self.active_index += 1;
        }
    }

    async fn stop_connection_workers(&mut self) {
        if let Some(stop) = self.conn_stop.take() {
            let _ = stop.send(true);
        }
        for task in [self.uplink_task.take(), self.downlink_task.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = task.await {
                warn!("connection worker ended abnormally: {e}");
            }
        }
    }

    fn drain_stale_worker_events(&mut self) {
        while let Ok(event) = self.worker_rx.try_recv() {
            match event {
                WorkerEvent::TransportDown(e) | WorkerEvent::Notice(e) => {
                    debug!("dropping stale transport event: {e}");
                }
                event => self.handle_info_event(event),
            }
        }
    }

    async fn close(&mut self, outcome: &Result<(), SessionError>) {
        info!("session closing");
        self.state = ConnectionState::Closed;
        self.commands.close();
        self.playback.flush();
        self.stop_connection_workers().await;
        let _ = self.shutdown_tx.send(true);
        let reason = match outcome {
            Ok(()) => None,
            Err(e) => Some(e.to_string()),
        };
        self.publish(SessionEvent::Closed { reason });
        // buffered commands die with the receiver; their reply channels
        // close, which is the rejection callers observe
    }

    fn publish(&self, event: SessionEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.session_events.try_send(event) {
            debug!("front end not draining events, dropped {event:?}");
        }
    }
}

/// Walk the candidate models from `start`: quota advances to the next model
/// immediately, transient failures retry the same model with exponential
/// backoff, fatal failures abort, and an exhausted list closes the session.
/// No model is retried after a quota failure within one episode.
async fn establish<C: Connector>(
    connector: &C,
    models: &[String],
    start: usize,
    retry: &RetryPolicy,
) -> Result<(C::Conn, usize), SessionError> {
    let mut last_failure = "no remaining fallback models".to_string();
    for (index, model) in models.iter().enumerate().skip(start) {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            debug!(%model, attempt, "connect attempt");
            let result = match timeout(retry.timeout, connector.connect(model)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Transient("connect timed out".into())),
            };
            match result {
                Ok(conn) => return Ok((conn, index)),
                Err(e @ TransportError::Fatal(_)) => {
                    error!(%model, "fatal connect failure: {e}");
                    return Err(SessionError::Fatal(e));
                }
                Err(TransportError::Quota(message)) => {
                    warn!(%model, "quota exhausted: {message}");
                    last_failure = format!("{model}: quota exhausted");
                    break;
                }
                Err(e) => {
                    last_failure = format!("{model}: {e}");
                    if attempt >= retry.attempts.max(1) {
                        warn!(%model, "giving up after {attempt} attempts: {e}");
                        break;
                    }
                    let delay = backoff_delay(retry.base_delay, attempt);
                    debug!(
                        %model,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after backoff"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
    error!(
        "all models exhausted ({last_failure}); check quota and billing at https://aistudio.google.com/"
    );
    Err(SessionError::ModelsExhausted(last_failure))
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << (attempt - 1).min(6));
    let jitter_ceiling = (exp.as_millis() as u64 / 4).max(1);
    exp + Duration::from_millis(rand::rng().random_range(0..jitter_ceiling))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InboundEvent;
    use crate::transport::fakes::{FakeConnector, FakeNet, Script};
    use tokio::sync::Notify;

    fn test_config() -> Config {
        Config {
            model: "model-a".to_string(),
            fallback_models: vec!["model-b".to_string(), "model-c".to_string()],
            system_prompt: None,
            connect_attempts: 3,
            connect_timeout: Duration::from_secs(1),
            reconnect_base_delay: Duration::from_millis(10),
            memory_turns: 4,
            context_replay_turns: 2,
            video_mode: VideoMode::None,
            ..Config::default()
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn wait_active(handle: &SessionHandle) -> StatusSnapshot {
        for _ in 0..1000 {
            if let Some(status) = handle.status().await {
                if status.connection == ConnectionState::Active {
                    return status;
                }
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("session never became active");
    }

    #[test]
    fn window_holds_most_recent_turns_in_order() {
        let mut window = ConversationWindow::new(3);
        for n in 1..=4 {
            window.push(TextTurn {
                role: Role::User,
                text: n.to_string(),
            });
        }
        let texts: Vec<_> = window.snapshot().into_iter().map(|t| t.text).collect();
        assert_eq!(texts, vec!["2", "3", "4"]);

        assert_eq!(
            window
                .recent(2)
                .into_iter()
                .map(|t| t.text)
                .collect::<Vec<_>>(),
            vec!["3", "4"]
        );
    }

    #[test]
    fn zero_capacity_window_stays_empty() {
        let mut window = ConversationWindow::new(0);
        window.push(TextTurn {
            role: Role::User,
            text: "x".to_string(),
        });
        assert!(window.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn quota_errors_walk_the_fallback_list_then_close() {
        let net = Arc::new(FakeNet::default());
        net.set_script(vec![
            Script::Fail(TransportError::Quota("limit".into())),
            Script::Fail(TransportError::Quota("limit".into())),
            Script::Fail(TransportError::Quota("limit".into())),
        ]);

        let (_handle, _events, task) =
            start(test_config(), FakeConnector(net.clone()), Devices::none());

        let result = task.await.unwrap();
        assert!(matches!(result, Err(SessionError::ModelsExhausted(_))));
        assert_eq!(net.attempts(), vec!["model-a", "model-b", "model-c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_the_same_model_with_backoff() {
        let net = Arc::new(FakeNet::default());
        net.set_script(vec![
            Script::Fail(TransportError::Transient("blip".into())),
            Script::Fail(TransportError::Transient("blip".into())),
            Script::Ok,
        ]);

        let (handle, _events, task) =
            start(test_config(), FakeConnector(net.clone()), Devices::none());

        let status = wait_active(&handle).await;
        assert_eq!(status.active_model, "model-a");
        assert_eq!(net.attempts(), vec!["model-a", "model-a", "model-a"]);

        handle.shutdown().await;
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_connect_failure_closes_without_fallback() {
        let net = Arc::new(FakeNet::default());
        net.set_script(vec![Script::Fail(TransportError::Fatal("bad key".into()))]);

        let (_handle, _events, task) =
            start(test_config(), FakeConnector(net.clone()), Devices::none());

        let result = task.await.unwrap();
        assert!(matches!(result, Err(SessionError::Fatal(_))));
        assert_eq!(net.attempts(), vec!["model-a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn text_injected_while_connecting_is_sent_after_initial_prompt() {
        let net = Arc::new(FakeNet::default());
        let gate = Arc::new(Notify::new());
        *net.gate.lock().unwrap() = Some(gate.clone());

        let config = Config {
            system_prompt: Some("be brief".to_string()),
            ..test_config()
        };
        let (handle, _events, task) = start(config, FakeConnector(net.clone()), Devices::none());

        // session is stuck in Connecting behind the gate
        sleep(Duration::from_millis(20)).await;
        assert_eq!(net.conn_count(), 0);
        let status = handle.status().await.unwrap();
        assert_eq!(status.connection, ConnectionState::Connecting);

        assert!(handle.inject_text("hello".to_string()).await);
        gate.notify_one();
        wait_active(&handle).await;

        let conn = net.conn(0);
        wait_until(|| conn.sent().len() >= 2).await;
        assert_eq!(
            conn.sent()[..2],
            [
                OutboundMessage::TextTurn {
                    text: "be brief".to_string()
                },
                OutboundMessage::TextTurn {
                    text: "hello".to_string()
                },
            ]
        );

        handle.shutdown().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_reconnects_same_model_and_preserves_window() {
        let net = Arc::new(FakeNet::default());
        let (handle, _events, task) =
            start(test_config(), FakeConnector(net.clone()), Devices::none());
        wait_active(&handle).await;

        let first = net.conn(0);
        first.push_event(Ok(InboundEvent::TextChunk("hi there".to_string())));
        first.push_event(Ok(InboundEvent::TurnComplete));
        {
            let handle = handle.clone();
            wait_until_async(move || {
                let handle = handle.clone();
                async move {
                    handle
                        .status()
                        .await
                        .map(|s| s.window.len() == 1)
                        .unwrap_or(false)
                }
            })
            .await;
        }

        first.drop_inbound();
        {
            let handle = handle.clone();
            let net = net.clone();
            wait_until_async(move || {
                let handle = handle.clone();
                let net = net.clone();
                async move {
                    handle
                        .status()
                        .await
                        .map(|s| s.connection == ConnectionState::Active)
                        .unwrap_or(false)
                        && net.conn_count() == 2
                }
            })
            .await;
        }

        let status = handle.status().await.unwrap();
        assert_eq!(status.active_model, "model-a");
        assert_eq!(status.window.len(), 1);
        assert_eq!(status.window[0].text, "hi there");
        assert_eq!(net.attempts(), vec!["model-a", "model-a"]);

        // recent context was replayed on the new connection, before any media
        let second = net.conn(1);
        wait_until(|| !second.sent().is_empty()).await;
        match &second.sent()[0] {
            OutboundMessage::ContextReplay(turns) => {
                assert_eq!(turns.len(), 1);
                assert_eq!(turns[0].text, "hi there");
            }
            other => panic!("expected context replay first, got {other:?}"),
        }

        handle.shutdown().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn quota_notice_while_active_advances_to_next_model() {
        let net = Arc::new(FakeNet::default());
        let (handle, _events, task) =
            start(test_config(), FakeConnector(net.clone()), Devices::none());
        wait_active(&handle).await;

        net.conn(0).push_event(Ok(InboundEvent::ErrorNotice {
            kind: ErrorKind::Quota,
            message: "limit reached".to_string(),
        }));

        {
            let net = net.clone();
            let handle = handle.clone();
            wait_until_async(move || {
                let handle = handle.clone();
                let net = net.clone();
                async move {
                    net.conn_count() == 2
                        && handle
                            .status()
                            .await
                            .map(|s| s.connection == ConnectionState::Active)
                            .unwrap_or(false)
                }
            })
            .await;
        }

        let status = handle.status().await.unwrap();
        assert_eq!(status.active_model, "model-b");
        assert_eq!(net.attempts(), vec!["model-a", "model-b"]);

        handle.shutdown().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn commands_are_rejected_once_closed() {
        let net = Arc::new(FakeNet::default());
        net.set_script(vec![Script::Fail(TransportError::Fatal("bad key".into()))]);

        let (handle, _events, task) = start(test_config(), FakeConnector(net), Devices::none());
        let _ = task.await.unwrap();

        assert!(!handle.inject_text("too late".to_string()).await);
        assert!(handle.status().await.is_none());
    }

    async fn wait_until_async<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..1000 {
            if condition().await {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }
}
