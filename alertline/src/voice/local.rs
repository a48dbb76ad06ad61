use super::{SpeechError, SpeechProvider, VoiceEntry, VoiceProfile};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::debug;

/// On-device synthesiser driven through an `espeak-ng` compatible command line.
///
/// Text is written to stdin so messages are never parsed as flags. Rate, pitch and amplitude
/// come from the entry's [`VoiceProfile`].
#[derive(Debug, Clone)]
pub struct LocalSpeechProvider {
    program: String,
}

impl LocalSpeechProvider {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn args(profile: VoiceProfile) -> Vec<String> {
        vec![
            "-s".to_string(),
            profile.rate.to_string(),
            "-p".to_string(),
            profile.pitch.to_string(),
            "-a".to_string(),
            profile.volume.to_string(),
            "--stdin".to_string(),
        ]
    }
}

#[async_trait]
impl SpeechProvider for LocalSpeechProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn speak(&self, entry: &VoiceEntry) -> Result<(), SpeechError> {
        let profile = VoiceProfile::for_priority(entry.priority);
        debug!(program = %self.program, priority = %entry.priority, ?profile, "speaking locally");

        let mut child = Command::new(&self.program)
            .args(Self::args(profile))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| match error.kind() {
                std::io::ErrorKind::NotFound => {
                    SpeechError::Unavailable(format!("synthesiser {} not found", self.program))
                }
                _ => SpeechError::Playback(error.to_string()),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(entry.message.as_bytes()).await {
                Ok(()) => {}
                // Exited early, the exit status tells us why
                Err(error) if error.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!(program = %self.program, "synthesiser closed stdin early");
                }
                Err(error) => return Err(SpeechError::Playback(format!("write text: {error}"))),
            }
            // Closing stdin ends the utterance
            drop(stdin);
        }

        let status = child
            .wait()
            .await
            .map_err(|error| SpeechError::Playback(error.to_string()))?;

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
