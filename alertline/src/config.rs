//! Runtime configuration, read from `ALERTLINE_*` environment variables.

use crate::notification::Priority;
use std::path::PathBuf;
use tracing::warn;
use url::Url;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_PUSH_URL: &str = "ws://127.0.0.1:8000/ws/notifications";
pub const DEFAULT_STATE_PATH: &str = ".alertline/state.json";
pub const DEFAULT_AUDIO_PLAYER: &str = "ffplay";
pub const DEFAULT_LOCAL_VOICE: &str = "espeak-ng";
pub const DEFAULT_VOICE_MIN_PRIORITY: Priority = Priority::High;

#[derive(Debug, Clone, PartialEq)]
pub struct AlertlineConfig {
    /// Base URL of the REST backend
    pub api_base_url: Url,
    /// Notification push endpoint
    pub push_url: String,
    /// Local state file (dismissed notifications, layout)
    pub state_path: PathBuf,
    /// External player for synthesised clips
    pub audio_player: String,
    /// Local synthesiser program
    pub local_voice_program: String,
    /// Pushed notifications at or above this priority are spoken
    pub voice_min_priority: Priority,
}

impl AlertlineConfig {
    /// Configuration with every other field at its default
    pub fn new(api_base_url: Url) -> Self {
        Self {
            api_base_url,
            push_url: DEFAULT_PUSH_URL.to_string(),
            state_path: PathBuf::from(DEFAULT_STATE_PATH),
            audio_player: DEFAULT_AUDIO_PLAYER.to_string(),
            local_voice_program: DEFAULT_LOCAL_VOICE.to_string(),
            voice_min_priority: DEFAULT_VOICE_MIN_PRIORITY,
        }
    }

    pub fn from_env() -> Result<Self, url::ParseError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unset or empty variables take the default;
    /// invalid ones are logged and take the default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, url::ParseError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let api_base_url = match lookup("ALERTLINE_API_URL") {
            Some(value) => match Url::parse(value.trim()) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => url,
                _ => {
                    warn!(%value, "invalid ALERTLINE_API_URL, using {}", DEFAULT_API_URL);
                    Url::parse(DEFAULT_API_URL)?
                }
            },
            None => Url::parse(DEFAULT_API_URL)?,
        };

        let mut config = Self::new(api_base_url);

        if let Some(value) = lookup("ALERTLINE_WS_URL") {
            match Url::parse(value.trim()) {
                Ok(url) if matches!(url.scheme(), "ws" | "wss") => config.push_url = url.into(),
                _ => warn!(%value, "invalid ALERTLINE_WS_URL, using {}", DEFAULT_PUSH_URL),
            }
        }

        if let Some(value) = lookup("ALERTLINE_STATE_PATH") {
            config.state_path = PathBuf::from(value);
        }

        if let Some(value) = lookup("ALERTLINE_AUDIO_PLAYER") {
            config.audio_player = value;
        }

        if let Some(value) = lookup("ALERTLINE_LOCAL_VOICE") {
            config.local_voice_program = value;
        }

        if let Some(value) = lookup("ALERTLINE_VOICE_MIN_PRIORITY") {
            match Priority::parse(&value) {
                Some(priority) => config.voice_min_priority = priority,
                None => warn!(
                    %value,
                    "invalid ALERTLINE_VOICE_MIN_PRIORITY, using {}", DEFAULT_VOICE_MIN_PRIORITY
                ),
            }
        }

        Ok(config)
    }

    pub fn with_push_url(mut self, push_url: impl Into<String>) -> Self {
        self.push_url = push_url.into();
        self
    }

    pub fn with_state_path(mut self, state_path: impl Into<PathBuf>) -> Self {
        self.state_path = state_path.into();
        self
    }

    pub fn with_audio_player(mut self, audio_player: impl Into<String>) -> Self {
        self.audio_player = audio_player.into();
        self
    }

    pub fn with_local_voice_program(mut self, program: impl Into<String>) -> Self {
        self.local_voice_program = program.into();
        self
    }

    pub fn with_voice_min_priority(mut self, priority: Priority) -> Self {
        self.voice_min_priority = priority;
        self
    }

    /// Whether a pushed notification of `priority` should be spoken
    pub fn speaks(&self, priority: Priority) -> bool {
        priority >= self.voice_min_priority
    }
}
