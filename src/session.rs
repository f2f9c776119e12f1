//! Authenticated session storage.
//!
//! [`AuthSessionStore`] is the only owner of the credential. Every poller
//! reads it before issuing a request, and any of them may call
//! [`AuthSessionStore::clear`] when the service answers 401. Several pollers
//! can observe the same expiry in the same tick, so `clear` is idempotent and
//! reports `true` only to the first caller after a successful `save`: that
//! caller alone surfaces the "session expired" notification.
//!
//! The store also exposes a one-shot invalidation signal
//! ([`AuthSessionStore::expired`]) that resolves when the current session is
//! cleared. A fresh `save` arms a new signal.

use crate::error::TrackerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identity of the logged-in user as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: u64,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// A credential plus the identity it belongs to.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user: UserIdentity,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("user", &self.user)
            .finish()
    }
}

struct SessionState {
    current: Option<Session>,
    expired: CancellationToken,
}

/// Owns the current session; see the module docs for the clear contract.
pub struct AuthSessionStore {
    state: Mutex<SessionState>,
    file: Option<PathBuf>,
}

impl fmt::Debug for AuthSessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSessionStore")
            .field("valid", &self.is_valid())
            .field("file", &self.file)
            .finish()
    }
}

impl Default for AuthSessionStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl AuthSessionStore {
    /// A store that forgets the session when dropped.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(SessionState {
                current: None,
                expired: CancellationToken::new(),
            }),
            file: None,
        }
    }

    /// A store backed by a JSON file.
    ///
    /// A readable session file is loaded immediately; a missing or corrupt
    /// one starts the store logged out.
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = read_session_file(&path);
        if let Some(ref s) = current {
            debug!(user = %s.user.username, path = %path.display(), "Loaded saved session");
        }
        Self {
            state: Mutex::new(SessionState {
                current,
                expired: CancellationToken::new(),
            }),
            file: Some(path),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The current session, if any.
    pub fn load(&self) -> Option<Session> {
        self.lock().current.clone()
    }

    /// Install a new session and re-arm the invalidation signal.
    pub fn save(&self, token: impl Into<String>, user: UserIdentity) -> Result<(), TrackerError> {
        let session = Session {
            token: token.into(),
            user,
        };
        // The file is written and removed under the lock so it always matches
        // `current`.
        let mut state = self.lock();
        if let Some(ref path) = self.file {
            write_session_file(path, &session)?;
        }
        if state.expired.is_cancelled() {
            state.expired = CancellationToken::new();
        }
        info!(user = %session.user.username, "Session saved");
        state.current = Some(session);
        Ok(())
    }

    /// Discard the session.
    ///
    /// Returns `true` only for the first call after a valid session; every
    /// later call before the next [`save`](Self::save) is a silent no-op.
    pub fn clear(&self) -> bool {
        let mut state = self.lock();
        let Some(session) = state.current.take() else {
            return false;
        };
        state.expired.cancel();
        if let Some(ref path) = self.file {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "Failed to remove session file: {e}"),
            }
        }
        drop(state);
        info!(user = %session.user.username, "Session cleared");
        true
    }

    pub fn is_valid(&self) -> bool {
        self.lock().current.is_some()
    }

    /// Signal that fires when the current session is cleared.
    pub fn expired(&self) -> CancellationToken {
        self.lock().expired.clone()
    }

    /// Path of the backing file, if any.
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }
}

fn read_session_file(path: &Path) -> Option<Session> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), "Failed to read session file: {e}");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(path = %path.display(), "Ignoring corrupt session file: {e}");
            None
        }
    }
}

fn write_session_file(path: &Path, session: &Session) -> Result<(), TrackerError> {
    let to_err = |source| TrackerError::SessionStoreFailed {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(to_err)?;
    }
    let json = serde_json::to_string_pretty(session)
        .map_err(|e| TrackerError::Internal(format!("session serialisation: {e}")))?;
    std::fs::write(path, json).map_err(to_err)
}
