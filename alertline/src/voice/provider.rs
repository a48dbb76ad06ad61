use super::VoiceEntry;
use crate::{notification::Priority, request::ApiError};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum SpeechError {
    #[error("synthesis request failed: {0}")]
    Synthesis(#[from] ApiError),

    #[error("could not decode synthesised audio: {0}")]
    Decode(String),

    #[error("playback failed: {0}")]
    Playback(String),

    #[error("speech provider unavailable: {0}")]
    Unavailable(String),

    #[error("all speech providers failed (primary: {primary}; fallback: {fallback})")]
    Exhausted { primary: String, fallback: String },
}

/// Something that can turn one queue entry into audible speech, returning once playback ends.
#[async_trait]
pub trait SpeechProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn speak(&self, entry: &VoiceEntry) -> Result<(), SpeechError>;
}

/// Local voice settings, more urgent for higher priorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceProfile {
    /// Words per minute
    pub rate: u32,
    /// 0-99
    pub pitch: u32,
    /// Amplitude, 0-200
    pub volume: u32,
}

impl VoiceProfile {
    pub fn for_priority(priority: Priority) -> Self {
        let (rate, pitch, volume) = match priority {
            Priority::Critical => (190, 70, 200),
            Priority::High => (175, 60, 170),
            Priority::Medium => (160, 50, 140),
            Priority::Low => (150, 45, 120),
            Priority::Info => (140, 40, 100),
        };
        Self {
            rate,
            pitch,
            volume,
        }
    }
}

/// Try `primary`; on any failure speak the same entry through `fallback`.
pub struct FallbackSpeech {
    primary: Arc<dyn SpeechProvider>,
    fallback: Arc<dyn SpeechProvider>,
}

impl FallbackSpeech {
    pub fn new(primary: Arc<dyn SpeechProvider>, fallback: Arc<dyn SpeechProvider>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl SpeechProvider for FallbackSpeech {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn speak(&self, entry: &VoiceEntry) -> Result<(), SpeechError> {
        let primary_error = match self.primary.speak(entry).await {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        warn!(
            primary = self.primary.name(),
            fallback = self.fallback.name(),
            error = %primary_error,
            "primary speech provider failed, falling back"
        );

        self.fallback
            .speak(entry)
            .await
            .map_err(|fallback_error| SpeechError::Exhausted {
                primary: primary_error.to_string(),
                fallback: fallback_error.to_string(),
            })
    }
}
