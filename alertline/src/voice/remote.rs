use super::{SpeechError, SpeechProvider, VoiceEntry};
use crate::{
    api::{SynthesisRequest, SynthesisResponse},
    request::ApiError,
};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use std::{process::Stdio, sync::Arc};
use tempfile::Builder;
use tokio::process::Command;
use tracing::debug;

/// Backend text-to-speech endpoint
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisResponse, ApiError>;
}

/// Plays a complete encoded clip, returning once playback ends
#[async_trait]
pub trait AudioPlayer: Send + Sync {
    async fn play(&self, audio: &[u8], format: &str) -> Result<(), SpeechError>;
}

/// Speaks through the backend's synthesis endpoint
pub struct RemoteSpeechProvider {
    backend: Arc<dyn SynthesisBackend>,
    player: Arc<dyn AudioPlayer>,
    voice_id: Option<String>,
    provider: Option<String>,
}

impl RemoteSpeechProvider {
    pub fn new(backend: Arc<dyn SynthesisBackend>, player: Arc<dyn AudioPlayer>) -> Self {
        Self {
            backend,
            player,
            voice_id: None,
            provider: None,
        }
    }

    pub fn with_voice_id(mut self, voice_id: impl Into<String>) -> Self {
        self.voice_id = Some(voice_id.into());
        self
    }

    /// Pin a named upstream provider instead of letting the backend choose
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }
}

#[async_trait]
impl SpeechProvider for RemoteSpeechProvider {
    fn name(&self) -> &str {
        "remote"
    }

    async fn speak(&self, entry: &VoiceEntry) -> Result<(), SpeechError> {
        let request = SynthesisRequest {
            text: entry.message.clone(),
            priority: entry.priority,
            voice_id: self.voice_id.clone(),
            provider: self.provider.clone(),
        };

        let response = self.backend.synthesize(&request).await?;
        let audio = STANDARD
            .decode(response.audio_base64.trim())
            .map_err(|error| SpeechError::Decode(error.to_string()))?;
        if audio.is_empty() {
            return Err(SpeechError::Decode("empty audio".to_string()));
        }

        debug!(
            provider = %response.provider_used,
            format = %response.format,
            bytes = audio.len(),
            "playing synthesised audio"
        );
        self.player.play(&audio, &response.format).await
    }
}

/// Plays clips with an external command-line player (`ffplay` by default).
///
/// The player process is killed if playback is cancelled.
#[derive(Debug, Clone)]
pub struct CommandAudioPlayer {
    program: String,
    args: Vec<String>,
}

impl CommandAudioPlayer {
    pub fn new(program: impl Into<String>) -> Self {
        let program = program.into();
        let args = match program.rsplit('/').next() {
            Some("ffplay") => vec!["-nodisp", "-autoexit", "-loglevel", "quiet"],
            Some("mpv") => vec!["--no-video", "--really-quiet"],
            _ => Vec::new(),
        }
        .into_iter()
        .map(str::to_string)
        .collect();

        Self { program, args }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl AudioPlayer for CommandAudioPlayer {
    async fn play(&self, audio: &[u8], format: &str) -> Result<(), SpeechError> {
        let extension = if format.is_empty() { "mp3" } else { format };
        // Removed on drop, so also when playback is cancelled
        let clip = Builder::new()
            .prefix("alertline-clip-")
            .suffix(&format!(".{extension}"))
            .tempfile()
            .map_err(|error| SpeechError::Playback(format!("create temp clip: {error}")))?;

        tokio::fs::write(clip.path(), audio)
            .await
            .map_err(|error| SpeechError::Playback(format!("write temp clip: {error}")))?;

        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(clip.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|error| match error.kind() {
                std::io::ErrorKind::NotFound => {
                    SpeechError::Unavailable(format!("audio player {} not found", self.program))
                }
                _ => SpeechError::Playback(error.to_string()),
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(SpeechError::Playback(format!(
                "{} exited with {status}",
                self.program
            )))
        }
    }
}
