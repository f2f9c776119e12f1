//! Error types for the doc2img-client library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`TrackerError`] (**returned**): a public operation could not be carried
//!   out (nothing to submit, no session, the session just expired, a download
//!   failed). Returned as `Err(TrackerError)` from [`crate::Tracker`] methods.
//!
//! * [`ServiceError`] (**per request**): a single call to the conversion
//!   service or identity provider failed. The poll loop consumes these
//!   directly: [`ServiceError::Unauthorized`] tears the session down, every
//!   other variant is logged and retried on the next cycle.
//!
//! Keeping the per-request error separate lets the poller classify failures
//! without string matching, and lets callers of the one-shot operations see
//! the underlying cause through [`TrackerError::Service`].

use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by the public operations of this library.
#[derive(Debug, Error)]
pub enum TrackerError {
    // ── Submission errors ─────────────────────────────────────────────────
    /// A submission was attempted with no documents.
    #[error("No documents selected for conversion")]
    NoDocuments,

    /// The background colour is not a `#RGB` / `#RRGGBB` hex string.
    #[error("Invalid background colour '{value}': expected #RGB or #RRGGBB")]
    InvalidBackgroundColor { value: String },

    /// A local document could not be read.
    #[error("Document not found: '{path}'")]
    DocumentNotFound { path: PathBuf },

    /// A local document exists but could not be read.
    #[error("Failed to read document '{path}': {source}")]
    DocumentReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Session errors ────────────────────────────────────────────────────
    /// An authorized operation was requested without a valid session.
    #[error("Not logged in.\nRun `doc2img login` first.")]
    NotAuthenticated,

    /// The service rejected the credential; the session has been cleared and
    /// every active subscription stopped.
    #[error("Session expired, please log in again")]
    SessionExpired,

    /// The identity provider refused the login.
    #[error("Login failed: {message}")]
    LoginFailed { message: String },

    /// The persisted session file could not be written or removed.
    #[error("Failed to persist session to '{path}': {source}")]
    SessionStoreFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Download errors ───────────────────────────────────────────────────
    /// A download request failed. Job and batch state are unaffected.
    #[error("Download of {target} failed: {reason}")]
    DownloadFailed { target: String, reason: String },

    /// Could not write a downloaded archive to disk.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Service errors ────────────────────────────────────────────────────
    /// A one-shot request (submit, refresh) failed for a non-session reason.
    #[error(transparent)]
    Service(#[from] ServiceError),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A failure of one request to the conversion service or identity provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// HTTP 401: the credential is missing, expired, or revoked.
    #[error("Authorization rejected by the service")]
    Unauthorized,

    /// Any other non-success HTTP status.
    #[error("Service returned HTTP {status}: {detail}")]
    Status { status: u16, detail: String },

    /// Connection refused, DNS failure, reset…
    #[error("Network error: {0}")]
    Transport(String),

    /// The request did not complete in time.
    #[error("Request timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The response body did not have the expected shape.
    #[error("Malformed response: {0}")]
    Decode(String),
}

impl ServiceError {
    /// `true` when this failure invalidates the whole session.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ServiceError::Unauthorized)
    }

    pub(crate) fn from_reqwest(e: reqwest::Error, timeout_secs: u64) -> Self {
        if e.is_timeout() {
            ServiceError::Timeout { secs: timeout_secs }
        } else if e.is_decode() {
            ServiceError::Decode(e.to_string())
        } else {
            ServiceError::Transport(e.to_string())
        }
    }
}
