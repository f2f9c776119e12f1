//! Job data model: the wire snapshot returned by the service and the locally
//! projected [`Job`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a conversion job.
///
/// `Queued → Processing → {Completed | Failed}`. The two terminal states have
/// no outgoing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Accepted by the service, waiting for a worker. Sent as `pending`.
    #[serde(rename = "pending", alias = "queued")]
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    /// `true` for `Completed` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            JobState::Queued => 0,
            JobState::Processing => 1,
            JobState::Completed | JobState::Failed => 2,
        }
    }

    /// Whether a job in `self` may be updated by a snapshot in `next`.
    ///
    /// Staying in the same non-terminal state is allowed (detail text may
    /// change); moving backwards or leaving a terminal state is not.
    pub fn accepts(self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One job record as returned by submit and poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    #[serde(rename = "task_id", alias = "job_id")]
    pub job_id: String,
    #[serde(default)]
    pub source_name: Option<String>,
    pub state: JobState,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub batch_download_url: Option<String>,
    /// When the service deletes the job's results (RFC 3339).
    #[serde(default)]
    pub expires_at: Option<String>,
    #[serde(default)]
    pub original_snapshot_url: Option<String>,
}

impl JobSnapshot {
    /// Minimal snapshot, mostly useful in tests and for callers that build
    /// snapshots from another source.
    pub fn new(job_id: impl Into<String>, state: JobState) -> Self {
        Self {
            job_id: job_id.into(),
            source_name: None,
            state,
            detail: None,
            download_url: None,
            batch_id: None,
            batch_download_url: None,
            expires_at: None,
            original_snapshot_url: None,
        }
    }

    pub fn in_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// The client-side view of a job, updated only by
/// [`crate::projector::JobStateProjector::apply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub id: String,
    pub batch_id: Option<String>,
    pub source_name: Option<String>,
    pub state: JobState,
    pub detail: Option<String>,
    /// Download reference; present once the service reports a result.
    pub download_url: Option<String>,
    /// Archive of the whole batch, once the service offers it.
    pub batch_download_url: Option<String>,
    /// When the service deletes the results.
    pub expires_at: Option<String>,
    /// Preview of the first page as rendered before any background was
    /// applied.
    pub original_snapshot_url: Option<String>,
    /// Number of snapshots applied to this job, including the first.
    pub revision: u64,
}

impl Job {
    pub(crate) fn from_snapshot(snapshot: JobSnapshot) -> Self {
        Self {
            id: snapshot.job_id,
            batch_id: snapshot.batch_id,
            source_name: snapshot.source_name,
            state: snapshot.state,
            detail: snapshot.detail,
            download_url: snapshot.download_url,
            batch_download_url: snapshot.batch_download_url,
            expires_at: snapshot.expires_at,
            original_snapshot_url: snapshot.original_snapshot_url,
            revision: 1,
        }
    }

    pub(crate) fn merge(&mut self, snapshot: JobSnapshot) {
        self.state = snapshot.state;
        self.detail = snapshot.detail;
        for (known, fresh) in [
            (&mut self.download_url, snapshot.download_url),
            (&mut self.batch_download_url, snapshot.batch_download_url),
            (&mut self.expires_at, snapshot.expires_at),
            (&mut self.original_snapshot_url, snapshot.original_snapshot_url),
        ] {
            if fresh.is_some() {
                *known = fresh;
            }
        }
        if self.batch_id.is_none() {
            self.batch_id = snapshot.batch_id;
        }
        if snapshot.source_name.is_some() {
            self.source_name = snapshot.source_name;
        }
        self.revision += 1;
    }

    /// Human-readable label: source file name when known, else the id.
    pub fn label(&self) -> &str {
        self.source_name.as_deref().unwrap_or(&self.id)
    }
}
