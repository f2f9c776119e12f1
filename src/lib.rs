//! # doc2img-client
//!
//! Submit documents to a remote document-to-image conversion service and
//! track every job until it finishes.
//!
//! Conversion is asynchronous on the service side: a submission returns job
//! records immediately, and the client polls each job until it reaches
//! `completed` or `failed`. Multi-document submissions share a batch id; once
//! every job of the batch has completed, a single archive of the whole batch
//! can be downloaded.
//!
//! ## Components
//!
//! ```text
//! submit ──▶ Tracker ──┬─▶ JobPoller          one cancellable task per job
//!                      ├─▶ JobStateProjector  state machine, job table
//!                      ├─▶ BatchRegistry      join over member completion
//!                      └─▶ AuthSessionStore   token, one-shot expiry signal
//!                 │
//!                 └──▶ TrackerObserver  (job updates, batch ready, session expired)
//! ```
//!
//! A 401 from any request clears the session and stops every subscription at
//! once; the observer hears about it exactly once.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use doc2img_client::{ChannelObserver, SubmitRequest, Tracker, TrackerConfig, TrackerEvent};
//! use futures::StreamExt;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let events = ChannelObserver::new(64);
//!     let mut stream = events.events();
//!     let tracker = Tracker::builder(TrackerConfig::default())
//!         .observer(Arc::new(events))
//!         .build()?;
//!
//!     tracker.login("alice", "secret").await?;
//!     tracker
//!         .submit(SubmitRequest::from_paths(&["a.docx", "b.pdf"]).await?)
//!         .await?;
//!
//!     while let Some(event) = stream.next().await {
//!         if let TrackerEvent::AggregateAvailable { batch_id } = event {
//!             tracker.download_batch_to_file(&batch_id, "out").await?;
//!             break;
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `doc2img` binary (clap + anyhow + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod batch;
pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod poller;
pub mod projector;
pub mod service;
pub mod session;
pub mod submit;
pub mod tracker;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use batch::{Batch, BatchRegistry};
pub use config::{TrackerConfig, TrackerConfigBuilder, DEFAULT_POLL_INTERVAL};
pub use error::{ServiceError, TrackerError};
pub use events::{ChannelObserver, EventStream, NoopObserver, Observer, TrackerEvent, TrackerObserver};
pub use job::{Job, JobSnapshot, JobState};
pub use poller::JobPoller;
pub use projector::{ApplyOutcome, JobStateProjector};
pub use service::{ConversionService, HttpConversionService, HttpIdentityProvider, IdentityProvider};
pub use session::{AuthSessionStore, Session, UserIdentity};
pub use submit::{Background, Document, DownloadTarget, SubmitRequest};
pub use tracker::{Submission, Tracker, TrackerBuilder};
