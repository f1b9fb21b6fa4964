//! Environment-driven configuration.
//!
//! Everything has a working default; `GEMINI_API_KEY` is the only variable a
//! session cannot start without.

use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("GEMINI_API_KEY environment variable is required (get a key at https://aistudio.google.com/app/apikey)")]
    MissingApiKey,
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Which video sources feed the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoMode {
    Camera,
    Screen,
    Both,
    None,
}

impl VideoMode {
    pub fn camera(self) -> bool {
        matches!(self, VideoMode::Camera | VideoMode::Both)
    }

    pub fn screen(self) -> bool {
        matches!(self, VideoMode::Screen | VideoMode::Both)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VideoMode::Camera => "camera",
            VideoMode::Screen => "screen",
            VideoMode::Both => "both",
            VideoMode::None => "none",
        }
    }
}

impl FromStr for VideoMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "camera" => Ok(VideoMode::Camera),
            "screen" => Ok(VideoMode::Screen),
            "both" => Ok(VideoMode::Both),
            "none" => Ok(VideoMode::None),
            _ => Err(ConfigError::Invalid {
                key: "video mode",
                value: s.to_string(),
            }),
        }
    }
}

/// Live API media resolution hint for inbound video understanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaResolution {
    Low,
    Medium,
    High,
}

impl MediaResolution {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaResolution::Low => "MEDIA_RESOLUTION_LOW",
            MediaResolution::Medium => "MEDIA_RESOLUTION_MEDIUM",
            MediaResolution::High => "MEDIA_RESOLUTION_HIGH",
        }
    }
}

/// How much of the realtime input stream counts toward a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnCoverage {
    OnlyActivity,
    AllInput,
}

impl TurnCoverage {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnCoverage::OnlyActivity => "TURN_INCLUDES_ONLY_ACTIVITY",
            TurnCoverage::AllInput => "TURN_INCLUDES_ALL_INPUT",
        }
    }
}

impl FromStr for TurnCoverage {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TURN_INCLUDES_ONLY_ACTIVITY" | "ONLY_ACTIVITY" => Ok(TurnCoverage::OnlyActivity),
            "TURN_INCLUDES_ALL_INPUT" | "ALL_INPUT" => Ok(TurnCoverage::AllInput),
            _ => Err(ConfigError::Invalid {
                key: "TURN_COVERAGE",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub model: String,
    /// Tried in order when the active model is quota-limited or unavailable.
    pub fallback_models: Vec<String>,
    /// Sent as the first text turn of the first connection when set.
    pub system_prompt: Option<String>,
    pub video_mode: VideoMode,

    pub send_sample_rate: u32,
    pub receive_sample_rate: u32,
    pub chunk_samples: usize,

    pub camera_interval: Duration,
    pub screen_interval: Duration,
    pub image_quality: u8,
    pub screen_quality: u8,
    pub max_image_size: (u32, u32),
    pub max_screen_size: (u32, u32),
    pub media_resolution: MediaResolution,

    pub voice_name: String,
    pub enable_search: bool,
    pub turn_coverage: TurnCoverage,

    /// Rolling conversation window capacity, in turns.
    pub memory_turns: usize,
    /// Turns re-sent as context after a reconnect; 0 disables replay.
    pub context_replay_turns: usize,

    pub connect_attempts: u32,
    pub connect_timeout: Duration,
    pub reconnect_base_delay: Duration,

    pub media_queue_capacity: usize,
    pub playback_buffer_chunks: usize,
    pub playback_push_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "models/gemini-2.5-flash-preview-native-audio-dialog".to_string(),
            fallback_models: vec![
                "models/gemini-2.5-flash-exp-native-audio-thinking-dialog".to_string(),
                "models/gemini-2.0-flash-live-001".to_string(),
            ],
            system_prompt: None,
            video_mode: VideoMode::Screen,
            send_sample_rate: 16_000,
            receive_sample_rate: 24_000,
            chunk_samples: 1024,
            camera_interval: Duration::from_secs(2),
            screen_interval: Duration::from_secs(3),
            image_quality: 85,
            screen_quality: 75,
            max_image_size: (1024, 1024),
            max_screen_size: (1920, 1080),
            media_resolution: MediaResolution::Medium,
            voice_name: "Zephyr".to_string(),
            enable_search: false,
            turn_coverage: TurnCoverage::OnlyActivity,
            memory_turns: 20,
            context_replay_turns: 4,
            connect_attempts: 3,
            connect_timeout: Duration::from_secs(20),
            reconnect_base_delay: Duration::from_secs(1),
            media_queue_capacity: 64,
            playback_buffer_chunks: 16,
            playback_push_timeout: Duration::from_millis(500),
        }
    }
}

impl Config {
    /// Build a configuration from the environment, falling back to defaults
    /// for everything except the API key.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        config.api_key = env_var("GEMINI_API_KEY").ok_or(ConfigError::MissingApiKey)?;

        if let Some(model) = env_var("MODEL_NAME") {
            config.model = model;
        }
        if let Some(list) = env_var("FALLBACK_MODELS") {
            config.fallback_models = list
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(mode) = env_var("DEFAULT_VIDEO_MODE") {
            config.video_mode = mode.parse()?;
        }
        if let Some(prompt) = env_var("SYSTEM_PROMPT") {
            config.system_prompt = Some(prompt);
        }
        if parse_env("ENABLE_INITIAL_PROMPT")? == Some(false) {
            config.system_prompt = None;
        }
        if let Some(enabled) = parse_env("ENABLE_GOOGLE_SEARCH")? {
            config.enable_search = enabled;
        }
        if let Some(coverage) = env_var("TURN_COVERAGE") {
            config.turn_coverage = coverage.parse()?;
        }
        if let Some(turns) = parse_env("MEMORY_TURNS")? {
            config.memory_turns = turns;
        }
        if let Some(turns) = parse_env("CONTEXT_REPLAY_TURNS")? {
            config.context_replay_turns = turns;
        }
        if let Some(ms) = parse_env::<u64>("CAMERA_CAPTURE_INTERVAL_MS")? {
            config.camera_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env::<u64>("SCREEN_CAPTURE_INTERVAL_MS")? {
            config.screen_interval = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_env("CONNECT_ATTEMPTS")? {
            config.connect_attempts = attempts;
        }

        Ok(config)
    }

    /// Duration of one captured audio chunk at the send sample rate.
    pub fn chunk_duration(&self) -> Duration {
        Duration::from_secs_f64(self.chunk_samples as f64 / self.send_sample_rate as f64)
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env_var(key) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(None),
    }
}
