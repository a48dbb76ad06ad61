//! Durable local key-value state.
//!
//! A single JSON file holding a string-keyed map, read once at startup and rewritten in full
//! on every change. When the file cannot be read or written the store degrades to in-memory
//! behaviour for the rest of the session; callers never see a storage failure.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{
    collections::{BTreeSet, HashSet},
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, warn};

/// Key holding the identities of notifications dismissed without reading.
pub const DISMISSED_NOTIFICATIONS_KEY: &str = "dismissed_notifications";

/// Key holding the UI layout preference.
pub const LAYOUT_PREFERENCE_KEY: &str = "layout_preference";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// UI layout flag persisted alongside the dismissed set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct LayoutPreference {
    pub compact: bool,
}

#[derive(Debug)]
struct StoreState {
    path: Option<PathBuf>,
    values: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct LocalStore {
    state: Arc<Mutex<StoreState>>,
}

impl LocalStore {
    /// Open the store backed by `path`. A missing file starts empty; an unreadable or corrupt
    /// file leaves the store in-memory only.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();

        let (path, values) = match load(&path) {
            Ok(values) => {
                debug!(path = %path.display(), keys = values.len(), "loaded local state");
                (Some(path), values)
            }
            Err(error) => {
                warn!(
                    path = %path.display(),
                    %error,
                    "local state unavailable, continuing in memory"
                );
                (None, serde_json::Map::new())
            }
        };

        Self {
            state: Arc::new(Mutex::new(StoreState { path, values })),
        }
    }

    /// Store with no backing file
    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                path: None,
                values: serde_json::Map::new(),
            })),
        }
    }

    /// True while changes are still being written to disk
    pub fn is_persistent(&self) -> bool {
        self.state.lock().path.is_some()
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let state = self.state.lock();
        let value = state.values.get(key)?.clone();
        match serde_json::from_value(value) {
            Ok(value) => Some(value),
            Err(error) => {
                warn!(key, %error, "ignoring malformed local state entry");
                None
            }
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(error) => {
                warn!(key, %error, "failed to serialise local state entry");
                return;
            }
        };

        let mut state = self.state.lock();
        state.values.insert(key.to_string(), value);
        state.flush();
    }

    pub fn dismissed_notifications(&self) -> HashSet<String> {
        self.get::<Vec<String>>(DISMISSED_NOTIFICATIONS_KEY)
            .unwrap_or_default()
            .into_iter()
            .collect()
    }

    pub fn set_dismissed_notifications(&self, ids: &HashSet<String>) {
        // Sorted so the file is stable between rewrites
        let sorted: BTreeSet<&String> = ids.iter().collect();
        self.set(DISMISSED_NOTIFICATIONS_KEY, &sorted);
    }

    pub fn layout_preference(&self) -> LayoutPreference {
        self.get(LAYOUT_PREFERENCE_KEY).unwrap_or_default()
    }

    pub fn set_layout_preference(&self, preference: LayoutPreference) {
        self.set(LAYOUT_PREFERENCE_KEY, &preference);
    }
}

impl StoreState {
    fn flush(&mut self) {
        let Some(path) = &self.path else {
            return;
        };

        if let Err(error) = persist(path, &self.values) {
            warn!(
                path = %path.display(),
                %error,
                "failed to write local state, continuing in memory"
            );
            self.path = None;
        }
    }
}

fn load(path: &Path) -> Result<serde_json::Map<String, serde_json::Value>, StorageError> {
    match fs::read(path) {
        Ok(bytes) if bytes.is_empty() => Ok(serde_json::Map::new()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(serde_json::Map::new()),
        Err(error) => Err(error.into()),
    }
}

fn persist(
    path: &Path,
    values: &serde_json::Map<String, serde_json::Value>,
) -> Result<(), StorageError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(values)?;
    fs::write(path, bytes)?;
    Ok(())
}
