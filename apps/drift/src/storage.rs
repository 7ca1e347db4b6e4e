//! Persisted client-side state.
//!
//! Two values survive a page reload / process restart: the server-issued
//! resumable session identifier, and (voice mode only) the last known room
//! identifier. Both are read once at startup and the room is cleared on
//! explicit leave.

use std::fs;
use std::io;
use std::path::PathBuf;

use directories::ProjectDirs;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
struct PersistedState {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    last_voice_room: Option<String>,
}

/// Storage seam for the resumable session id and last voice room.
pub trait SessionStore: Send + Sync {
    fn session_id(&self) -> Option<String>;
    fn set_session_id(&self, id: &str);
    fn last_voice_room(&self) -> Option<String>;
    fn set_last_voice_room(&self, room: Option<&str>);
}

/// JSON file in the platform data directory.
pub struct FileSessionStore {
    path: PathBuf,
    state: Mutex<PersistedState>,
}

impl FileSessionStore {
    /// Open (or initialize) the default store under the platform data dir.
    pub fn open_default() -> io::Result<Self> {
        let dirs = ProjectDirs::from("", "", "drift")
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no home directory"))?;
        let dir = dirs.data_dir().to_path_buf();
        fs::create_dir_all(&dir)?;
        Self::open(dir.join("session.json"))
    }

    /// Open a store at an explicit path. Missing or corrupt files start
    /// empty rather than failing: losing the resumable id only costs the
    /// server-side continuity, never the session itself.
    pub fn open(path: PathBuf) -> io::Result<Self> {
        let state = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => PersistedState::default(),
            Err(err) => return Err(err),
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn flush(&self, state: &PersistedState) {
        match serde_json::to_vec_pretty(state) {
            Ok(bytes) => {
                if let Err(err) = fs::write(&self.path, bytes) {
                    tracing::warn!(path = %self.path.display(), %err, "failed to persist session state");
                }
            }
            Err(err) => tracing::warn!(%err, "failed to serialize session state"),
        }
    }
}

impl SessionStore for FileSessionStore {
    fn session_id(&self) -> Option<String> {
        self.state.lock().session_id.clone()
    }

    fn set_session_id(&self, id: &str) {
        let mut state = self.state.lock();
        if state.session_id.as_deref() == Some(id) {
            return;
        }
        state.session_id = Some(id.to_string());
        self.flush(&state);
    }

    fn last_voice_room(&self) -> Option<String> {
        self.state.lock().last_voice_room.clone()
    }

    fn set_last_voice_room(&self, room: Option<&str>) {
        let mut state = self.state.lock();
        state.last_voice_room = room.map(str::to_string);
        self.flush(&state);
    }
}

/// Volatile store for tests and for callers that opt out of persistence.
#[derive(Default)]
pub struct MemorySessionStore {
    state: Mutex<PersistedState>,
}

impl SessionStore for MemorySessionStore {
    fn session_id(&self) -> Option<String> {
        self.state.lock().session_id.clone()
    }

    fn set_session_id(&self, id: &str) {
        self.state.lock().session_id = Some(id.to_string());
    }

    fn last_voice_room(&self) -> Option<String> {
        self.state.lock().last_voice_room.clone()
    }

    fn set_last_voice_room(&self, room: Option<&str>) {
        self.state.lock().last_voice_room = room.map(str::to_string);
    }
}
