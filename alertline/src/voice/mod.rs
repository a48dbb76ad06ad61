//! Voice alert queue
//!
//! Speaks one entry at a time through a [`SpeechProvider`], normally a [`FallbackSpeech`]
//! that tries the backend's synthesis endpoint before the local synthesiser. New entries are
//! placed ahead of lower-priority waiting entries but never interrupt the one being spoken.

mod local;
mod provider;
mod remote;

pub use local::LocalSpeechProvider;
pub use provider::{FallbackSpeech, SpeechError, SpeechProvider, VoiceProfile};
pub use remote::{AudioPlayer, CommandAudioPlayer, RemoteSpeechProvider, SynthesisBackend};

use crate::notification::Priority;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Silence between two consecutive utterances
pub const PLAYBACK_GAP: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq)]
pub struct VoiceEntry {
    pub message: String,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
}

/// Insert ahead of the first waiting entry with a strictly lower priority, so equal priorities
/// keep arrival order and a critical entry lands before the first non-critical one.
fn insert_by_priority(entries: &mut VecDeque<VoiceEntry>, entry: VoiceEntry) {
    match entries
        .iter()
        .position(|waiting| waiting.priority < entry.priority)
    {
        Some(index) => entries.insert(index, entry),
        None => entries.push_back(entry),
    }
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<VoiceEntry>,
    worker: Option<JoinHandle<()>>,
    /// Bumped by `stop` so an aborted worker can never touch the queue again
    epoch: u64,
    speaking: bool,
}

/// Serialised, priority-ordered speech output. Cheap to clone; clones share one queue.
#[derive(Clone)]
pub struct VoiceAlertQueue {
    speech: Arc<dyn SpeechProvider>,
    state: Arc<Mutex<QueueState>>,
}

impl VoiceAlertQueue {
    pub fn new(speech: Arc<dyn SpeechProvider>) -> Self {
        Self {
            speech,
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    /// Queue `message`, starting playback if idle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, message: impl Into<String>, priority: Priority) {
        let entry = VoiceEntry {
            message: message.into(),
            priority,
            enqueued_at: Utc::now(),
        };

        let mut state = self.state.lock();
        insert_by_priority(&mut state.entries, entry);
        debug!(%priority, waiting = state.entries.len(), "voice alert queued");

        if state.worker.is_none() {
            let worker = tokio::spawn(run_worker(
                Arc::clone(&self.speech),
                Arc::clone(&self.state),
                state.epoch,
            ));
            state.worker = Some(worker);
        }
    }

    /// Halt current playback and drop everything waiting. Safe to call in any state.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        let dropped = state.entries.len();
        state.entries.clear();
        state.epoch += 1;
        state.speaking = false;
        if let Some(worker) = state.worker.take() {
            worker.abort();
            info!(dropped, "voice playback stopped");
        }
    }

    /// Drop everything waiting; the current utterance finishes
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let dropped = state.entries.len();
        state.entries.clear();
        if dropped > 0 {
            debug!(dropped, "voice queue cleared");
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.state.lock().speaking
    }

    /// True when nothing is playing, waiting or pausing between entries
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.worker.is_none() && state.entries.is_empty()
    }

    /// Waiting entries in playback order
    pub fn pending(&self) -> Vec<VoiceEntry> {
        self.state.lock().entries.iter().cloned().collect()
    }
}

async fn run_worker(speech: Arc<dyn SpeechProvider>, state: Arc<Mutex<QueueState>>, epoch: u64) {
    loop {
        let entry = {
            let mut state = state.lock();
            if state.epoch != epoch {
                return;
            }
            match state.entries.pop_front() {
                Some(entry) => {
                    state.speaking = true;
                    entry
                }
                None => {
                    state.speaking = false;
                    state.worker = None;
                    return;
                }
            }
        };

        debug!(priority = %entry.priority, provider = speech.name(), "speaking voice alert");
        if let Err(error) = speech.speak(&entry).await {
            // Voice is best effort
            warn!(priority = %entry.priority, %error, "voice alert could not be spoken");
        }

        {
            let mut state = state.lock();
            if state.epoch != epoch {
                return;
            }
            state.speaking = false;
        }

        tokio::time::sleep(PLAYBACK_GAP).await;
    }
}
