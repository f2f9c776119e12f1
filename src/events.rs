//! Observer trait for tracker events.
//!
//! Inject an [`Arc<dyn TrackerObserver>`] via [`crate::TrackerBuilder::observer`]
//! to receive job updates, batch completion and session expiry as they
//! happen. The tracker never references presentation code: a terminal UI, a
//! web socket bridge or a test recorder all plug in through this trait.
//!
//! Callbacks are invoked after the tracker has released its internal lock, so
//! an observer may call back into the tracker (e.g. start a download from
//! `on_aggregate_available`).
//!
//! # Example
//!
//! ```rust
//! use doc2img_client::{Job, TrackerObserver};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct CountingObserver {
//!     finished: AtomicUsize,
//! }
//!
//! impl TrackerObserver for CountingObserver {
//!     fn on_job_updated(&self, job: &Job) {
//!         if job.state.is_terminal() {
//!             self.finished.fetch_add(1, Ordering::SeqCst);
//!         }
//!     }
//! }
//! ```

use crate::job::Job;
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

/// Receives tracker events. All methods default to no-ops.
///
/// Pollers run as independent tasks, so methods may be called from different
/// threads; implementations must synchronise their own state.
pub trait TrackerObserver: Send + Sync {
    /// A snapshot was applied to a job (created or updated).
    fn on_job_updated(&self, job: &Job) {
        let _ = job;
    }

    /// Every job of `batch_id` completed; the batch archive can be
    /// downloaded. Fired at most once per batch.
    fn on_aggregate_available(&self, batch_id: &str) {
        let _ = batch_id;
    }

    /// The service rejected the credential. Fired once per session no matter
    /// how many requests observed the rejection.
    fn on_session_expired(&self) {}

    /// A status check failed for a non-session reason and will be retried.
    fn on_poll_error(&self, job_id: &str, error: &str) {
        let _ = (job_id, error);
    }
}

/// Observer that ignores every event. The default.
pub struct NoopObserver;

impl TrackerObserver for NoopObserver {}

/// Convenience alias for the stored observer type.
pub type Observer = Arc<dyn TrackerObserver>;

/// Owned form of every observer callback, for channels and JSON output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrackerEvent {
    JobUpdated { job: Job },
    AggregateAvailable { batch_id: String },
    SessionExpired,
    PollError { job_id: String, error: String },
}

impl TrackerEvent {
    /// Deliver this event to `observer`.
    pub fn dispatch(&self, observer: &dyn TrackerObserver) {
        match self {
            TrackerEvent::JobUpdated { job } => observer.on_job_updated(job),
            TrackerEvent::AggregateAvailable { batch_id } => {
                observer.on_aggregate_available(batch_id)
            }
            TrackerEvent::SessionExpired => observer.on_session_expired(),
            TrackerEvent::PollError { job_id, error } => observer.on_poll_error(job_id, error),
        }
    }
}

/// A boxed stream of tracker events.
pub type EventStream = Pin<Box<dyn Stream<Item = TrackerEvent> + Send>>;

/// Observer that fans events out over a Tokio broadcast channel.
///
/// Subscribers that fall more than `capacity` events behind skip the missed
/// events rather than blocking the pollers.
#[derive(Clone)]
pub struct ChannelObserver {
    tx: broadcast::Sender<TrackerEvent>,
}

impl ChannelObserver {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// A new stream receiving every event sent after this call.
    pub fn events(&self) -> EventStream {
        let s = BroadcastStream::new(self.tx.subscribe()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(e) => {
                debug!("Event subscriber lagged: {e}");
                None
            }
        });
        Box::pin(s)
    }

    fn send(&self, event: TrackerEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl TrackerObserver for ChannelObserver {
    fn on_job_updated(&self, job: &Job) {
        self.send(TrackerEvent::JobUpdated { job: job.clone() });
    }

    fn on_aggregate_available(&self, batch_id: &str) {
        self.send(TrackerEvent::AggregateAvailable {
            batch_id: batch_id.to_string(),
        });
    }

    fn on_session_expired(&self) {
        self.send(TrackerEvent::SessionExpired);
    }

    fn on_poll_error(&self, job_id: &str, error: &str) {
        self.send(TrackerEvent::PollError {
            job_id: job_id.to_string(),
            error: error.to_string(),
        });
    }
}
