//! The coordinating instance: owns the session store, the subscription
//! registry, the batch registry and the job table, and wires them to the
//! remote collaborators.
//!
//! ## Locking
//!
//! All mutable tracking state sits behind one mutex that is never held across
//! an `.await`. Every state change (applying a snapshot, registering a batch,
//! cancelling subscriptions) is therefore one uninterrupted step, even though
//! many poll tasks run concurrently. Network waits happen outside the lock and
//! their results are re-validated against the subscription's token once the
//! lock is taken again.
//!
//! Observer callbacks are always dispatched after the lock is released.

use crate::batch::{Batch, BatchRegistry};
use crate::config::TrackerConfig;
use crate::error::{ServiceError, TrackerError};
use crate::events::{NoopObserver, Observer, TrackerEvent};
use crate::job::{Job, JobSnapshot};
use crate::poller::{self, CycleOutcome, JobPoller};
use crate::projector::{ApplyOutcome, JobStateProjector};
use crate::service::{
    ConversionService, HttpConversionService, HttpIdentityProvider, IdentityProvider,
};
use crate::session::{AuthSessionStore, UserIdentity};
use crate::submit::{DownloadTarget, SubmitRequest};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct TrackerState {
    poller: JobPoller,
    batches: BatchRegistry,
    projector: JobStateProjector,
}

struct Inner {
    config: TrackerConfig,
    service: Arc<dyn ConversionService>,
    identity: Arc<dyn IdentityProvider>,
    session: AuthSessionStore,
    observer: Observer,
    state: Mutex<TrackerState>,
}

/// Jobs created by one [`Tracker::submit`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    /// Set when the service grouped the jobs into a batch.
    pub batch_id: Option<String>,
    /// In the order the service returned them.
    pub jobs: Vec<Job>,
}

/// Client-side job and batch tracker. Cheap to clone; clones share state.
///
/// # Example
/// ```rust,no_run
/// use doc2img_client::{SubmitRequest, Tracker, TrackerConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let tracker = Tracker::builder(TrackerConfig::default()).build()?;
/// tracker.login("alice", "secret").await?;
/// let request = SubmitRequest::from_paths(&["a.docx", "b.pdf"]).await?;
/// let submission = tracker.submit(request).await?;
/// tracker.wait_until_idle().await;
/// if let Some(batch_id) = submission.batch_id {
///     tracker.download_batch_to_file(&batch_id, "out").await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<Inner>,
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Tracker")
            .field("config", &self.inner.config)
            .field("session", &self.inner.session)
            .field("active_subscriptions", &state.poller.len())
            .field("batches", &state.batches.len())
            .field("jobs", &state.projector.len())
            .finish()
    }
}

/// Builder for [`Tracker`]. Collaborators left unset are created from the
/// configuration (HTTP service, HTTP identity provider, session store).
pub struct TrackerBuilder {
    config: TrackerConfig,
    service: Option<Arc<dyn ConversionService>>,
    identity: Option<Arc<dyn IdentityProvider>>,
    session: Option<AuthSessionStore>,
    observer: Option<Observer>,
}

impl TrackerBuilder {
    pub fn service(mut self, service: Arc<dyn ConversionService>) -> Self {
        self.service = Some(service);
        self
    }

    pub fn identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn session_store(mut self, store: AuthSessionStore) -> Self {
        self.session = Some(store);
        self
    }

    pub fn observer(mut self, observer: Observer) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Result<Tracker, TrackerError> {
        let service: Arc<dyn ConversionService> = match self.service {
            Some(s) => s,
            None => Arc::new(HttpConversionService::new(&self.config)?),
        };
        let identity: Arc<dyn IdentityProvider> = match self.identity {
            Some(i) => i,
            None => Arc::new(HttpIdentityProvider::new(&self.config)?),
        };
        let session = self.session.unwrap_or_else(|| match self.config.session_file {
            Some(ref path) => AuthSessionStore::persistent(path),
            None => AuthSessionStore::in_memory(),
        });
        Ok(Tracker {
            inner: Arc::new(Inner {
                config: self.config,
                service,
                identity,
                session,
                observer: self.observer.unwrap_or_else(|| Arc::new(NoopObserver)),
                state: Mutex::new(TrackerState::default()),
            }),
        })
    }
}

impl Tracker {
    pub fn builder(config: TrackerConfig) -> TrackerBuilder {
        TrackerBuilder {
            config,
            service: None,
            identity: None,
            session: None,
            observer: None,
        }
    }

    /// Tracker over explicit collaborators, with an in-memory session and no
    /// observer.
    pub fn new(
        config: TrackerConfig,
        service: Arc<dyn ConversionService>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Tracker {
            inner: Arc::new(Inner {
                config,
                service,
                identity,
                session: AuthSessionStore::in_memory(),
                observer: Arc::new(NoopObserver),
                state: Mutex::new(TrackerState::default()),
            }),
        }
    }

    /// Tracker talking HTTP to the endpoints in `config`.
    pub fn connect(config: TrackerConfig) -> Result<Self, TrackerError> {
        Self::builder(config).build()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, events: &[TrackerEvent]) {
        for event in events {
            event.dispatch(self.inner.observer.as_ref());
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }

    pub fn session(&self) -> &AuthSessionStore {
        &self.inner.session
    }

    // ── Session lifecycle ────────────────────────────────────────────────

    /// Authenticate against the identity provider and start a fresh session.
    ///
    /// Any state left from a previous session is torn down first.
    pub async fn login(&self, identifier: &str, password: &str) -> Result<UserIdentity, TrackerError> {
        let (token, user) = self
            .inner
            .identity
            .authenticate(identifier, password)
            .await
            .map_err(|e| match e {
                ServiceError::Status { detail, .. } => TrackerError::LoginFailed { message: detail },
                other => TrackerError::LoginFailed {
                    message: other.to_string(),
                },
            })?;
        self.teardown();
        self.inner.session.save(token, user.clone())?;
        Ok(user)
    }

    /// End the session on the user's request. Stops every subscription and
    /// discards batch state without a session-expired notification.
    pub fn logout(&self) {
        self.inner.session.clear();
        let stopped = self.teardown();
        info!(stopped, "Logged out");
    }

    /// Invalidate the session after an authorization failure.
    ///
    /// Stops every subscription and discards batch state. The observer's
    /// `on_session_expired` fires only for the first invalidation after a
    /// successful login, however many callers race here.
    pub fn invalidate_session(&self) {
        let first = self.inner.session.clear();
        let stopped = self.teardown();
        if first {
            warn!(stopped, "Session expired; all subscriptions stopped");
            self.emit(&[TrackerEvent::SessionExpired]);
        } else {
            debug!(stopped, "Session already invalidated");
        }
    }

    /// React to a 401 for a request issued with `used_token`.
    ///
    /// Returns `false` when the rejected credential was already replaced by a
    /// newer one; the current session is left alone in that case.
    fn handle_unauthorized(&self, used_token: &str) -> bool {
        if let Some(current) = self.inner.session.load() {
            if current.token != used_token {
                debug!("Ignoring rejection of a superseded credential");
                return false;
            }
        }
        self.invalidate_session();
        true
    }

    fn teardown(&self) -> usize {
        let mut state = self.lock();
        let stopped = state.poller.cancel_all();
        state.batches.clear();
        stopped
    }

    /// Stop every subscription, keeping the session and batch state.
    pub fn shutdown(&self) {
        let stopped = self.lock().poller.cancel_all();
        debug!(stopped, "Tracker shut down");
    }

    // ── Submission ───────────────────────────────────────────────────────

    /// Upload documents and start tracking the returned jobs.
    ///
    /// The batch (if any) is registered before any snapshot is applied, so no
    /// completion can be observed for an unregistered batch. Must be called
    /// from within a Tokio runtime.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Submission, TrackerError> {
        request.validate()?;
        let session = self
            .inner
            .session
            .load()
            .ok_or(TrackerError::NotAuthenticated)?;

        let snapshots = match self.inner.service.submit(&session.token, &request).await {
            Ok(s) => s,
            Err(e) if e.is_unauthorized() => {
                self.handle_unauthorized(&session.token);
                return Err(TrackerError::SessionExpired);
            }
            Err(e) => return Err(e.into()),
        };
        if snapshots.is_empty() {
            return Err(ServiceError::Decode("service accepted no documents".into()).into());
        }

        let batch_id = snapshots.iter().find_map(|s| s.batch_id.clone());
        let mut events = Vec::new();
        let mut jobs = Vec::with_capacity(snapshots.len());
        {
            let mut guard = self.lock();
            // Teardown always follows `clear`, so a session still holding this
            // token here means no teardown has run since the request left.
            let still_current = self
                .inner
                .session
                .load()
                .is_some_and(|current| current.token == session.token);
            if !still_current {
                warn!("Session ended while submitting; discarding the response");
                return Err(TrackerError::SessionExpired);
            }
            let state = &mut *guard;
            if let Some(ref batch_id) = batch_id {
                let members = snapshots
                    .iter()
                    .filter(|s| s.batch_id.as_deref() == Some(batch_id.as_str()))
                    .map(|s| s.job_id.clone());
                state.batches.register(batch_id, members);
            }
            for snapshot in snapshots {
                let job_id = snapshot.job_id.clone();
                let outcome = state.projector.apply(snapshot, &mut state.batches);
                if !outcome.is_terminal() {
                    if let Some(token) = state.poller.insert(&job_id) {
                        tokio::spawn(poller::run(self.clone(), job_id.clone(), token));
                    }
                }
                if let Some(job) = state.projector.get(&job_id) {
                    jobs.push(job.clone());
                }
                events.extend(outcome_events(outcome));
            }
        }
        info!(jobs = jobs.len(), batch_id = ?batch_id, "Submission accepted");
        self.emit(&events);
        Ok(Submission { batch_id, jobs })
    }

    // ── Subscriptions ────────────────────────────────────────────────────

    /// Start polling `job_id`. Returns `false` if it was already subscribed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(&self, job_id: &str) -> bool {
        let mut state = self.lock();
        match state.poller.insert(job_id) {
            Some(token) => {
                tokio::spawn(poller::run(self.clone(), job_id.to_string(), token));
                true
            }
            None => false,
        }
    }

    /// Stop polling `job_id`. A response already in flight is discarded.
    pub fn unsubscribe(&self, job_id: &str) -> bool {
        self.lock().poller.remove(job_id)
    }

    pub fn is_subscribed(&self, job_id: &str) -> bool {
        self.lock().poller.is_active(job_id)
    }

    /// Job ids currently being polled, sorted.
    pub fn active_subscriptions(&self) -> Vec<String> {
        self.lock().poller.active_ids()
    }

    /// Resolve once no subscription is active.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.lock().poller.watch();
        let _ = rx.wait_for(|active| *active == 0).await;
    }

    /// One poll cycle for `job_id`, owned by the subscription `token`.
    pub(crate) async fn poll_once(&self, job_id: &str, token: &CancellationToken) -> CycleOutcome {
        let Some(session) = self.inner.session.load() else {
            debug!(job_id, "No valid session, stopping poll");
            self.lock().poller.release(job_id, token);
            return CycleOutcome::Stop;
        };

        let timeout = self.inner.config.request_timeout();
        let result = tokio::time::timeout(timeout, self.inner.service.fetch_job(&session.token, job_id))
            .await
            .unwrap_or(Err(ServiceError::Timeout {
                secs: timeout.as_secs(),
            }));

        if token.is_cancelled() {
            debug!(job_id, "Discarding response for cancelled subscription");
            return CycleOutcome::Stop;
        }

        match result {
            Ok(snapshot) => self.apply_polled(job_id, token, snapshot),
            Err(e) if e.is_unauthorized() => {
                if !self.handle_unauthorized(&session.token) {
                    // Retry with the credential that replaced it.
                    return CycleOutcome::Continue;
                }
                self.lock().poller.release(job_id, token);
                CycleOutcome::Stop
            }
            Err(e) => {
                warn!(job_id, "Status check failed, retrying next cycle: {e}");
                self.emit(&[TrackerEvent::PollError {
                    job_id: job_id.to_string(),
                    error: e.to_string(),
                }]);
                CycleOutcome::Continue
            }
        }
    }

    fn apply_polled(&self, job_id: &str, token: &CancellationToken, snapshot: JobSnapshot) -> CycleOutcome {
        let (finished, events) = {
            let mut guard = self.lock();
            if token.is_cancelled() {
                debug!(job_id, "Discarding response for cancelled subscription");
                return CycleOutcome::Stop;
            }
            let state = &mut *guard;
            let outcome = state.projector.apply(snapshot, &mut state.batches);
            let finished = settles_job(&outcome);
            if finished {
                state.poller.remove(job_id);
            }
            (finished, outcome_events(outcome))
        };
        self.emit(&events);
        if finished {
            CycleOutcome::Stop
        } else {
            CycleOutcome::Continue
        }
    }

    // ── Projection ───────────────────────────────────────────────────────

    /// Apply a snapshot obtained outside the poll loop.
    ///
    /// Terminal snapshots end the job's subscription, exactly as a polled one
    /// would.
    pub fn apply(&self, snapshot: JobSnapshot) -> ApplyOutcome {
        let job_id = snapshot.job_id.clone();
        let outcome = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let outcome = state.projector.apply(snapshot, &mut state.batches);
            if settles_job(&outcome) {
                state.poller.remove(&job_id);
            }
            outcome
        };
        self.emit(&outcome_events(outcome.clone()));
        outcome
    }

    /// Fetch one job's status now and apply it.
    pub async fn refresh(&self, job_id: &str) -> Result<Job, TrackerError> {
        let session = self
            .inner
            .session
            .load()
            .ok_or(TrackerError::NotAuthenticated)?;
        match self.inner.service.fetch_job(&session.token, job_id).await {
            Ok(snapshot) => {
                self.apply(snapshot);
            }
            Err(e) if e.is_unauthorized() => {
                self.handle_unauthorized(&session.token);
                return Err(TrackerError::SessionExpired);
            }
            Err(e) => return Err(e.into()),
        }
        self.job(job_id)
            .ok_or_else(|| TrackerError::Internal(format!("job {job_id} missing after refresh")))
    }

    pub fn job(&self, job_id: &str) -> Option<Job> {
        self.lock().projector.get(job_id).cloned()
    }

    /// Every known job, sorted by id.
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.lock().projector.jobs().cloned().collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    pub fn batch(&self, batch_id: &str) -> Option<Batch> {
        self.lock().batches.get_batch(batch_id).cloned()
    }

    // ── Downloads ────────────────────────────────────────────────────────

    /// Download the archive of one job or batch.
    ///
    /// A failure other than an authorization failure is isolated: job and
    /// batch state are left untouched.
    pub async fn download(&self, target: &DownloadTarget) -> Result<Vec<u8>, TrackerError> {
        let session = self
            .inner
            .session
            .load()
            .ok_or(TrackerError::NotAuthenticated)?;
        match self.inner.service.download(&session.token, target).await {
            Ok(bytes) => {
                info!(bytes = bytes.len(), "Downloaded {}", target);
                Ok(bytes)
            }
            Err(e) if e.is_unauthorized() => {
                self.handle_unauthorized(&session.token);
                Err(TrackerError::SessionExpired)
            }
            Err(e) => {
                warn!("Download of {} failed: {}", target, e);
                Err(TrackerError::DownloadFailed {
                    target: target.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    pub async fn download_job(&self, job_id: &str) -> Result<Vec<u8>, TrackerError> {
        self.download(&DownloadTarget::Job(job_id.to_string())).await
    }

    pub async fn download_batch(&self, batch_id: &str) -> Result<Vec<u8>, TrackerError> {
        self.download(&DownloadTarget::Batch(batch_id.to_string()))
            .await
    }

    /// Download the pre-background preview of a job's first page (PNG).
    pub async fn download_original(&self, job_id: &str) -> Result<Vec<u8>, TrackerError> {
        self.download(&DownloadTarget::Original(job_id.to_string()))
            .await
    }

    /// Download a job archive into `dir` as `{job_id}.zip`.
    pub async fn download_job_to_file(
        &self,
        job_id: &str,
        dir: impl AsRef<Path>,
    ) -> Result<PathBuf, TrackerError> {
        self.download_to_file(&DownloadTarget::Job(job_id.to_string()), dir.as_ref())
            .await
    }

    /// Download a batch archive into `dir` as `batch-{batch_id}.zip`.
    pub async fn download_batch_to_file(
        &self,
        batch_id: &str,
        dir: impl AsRef<Path>,
    ) -> Result<PathBuf, TrackerError> {
        self.download_to_file(&DownloadTarget::Batch(batch_id.to_string()), dir.as_ref())
            .await
    }

    /// Save the pre-background preview into `dir` as `{job_id}-original.png`.
    pub async fn download_original_to_file(
        &self,
        job_id: &str,
        dir: impl AsRef<Path>,
    ) -> Result<PathBuf, TrackerError> {
        self.download_to_file(&DownloadTarget::Original(job_id.to_string()), dir.as_ref())
            .await
    }

    /// Uses atomic write (temp file + rename) to prevent partial archives.
    async fn download_to_file(
        &self,
        target: &DownloadTarget,
        dir: &Path,
    ) -> Result<PathBuf, TrackerError> {
        let bytes = self.download(target).await?;
        let path = target.default_path(dir);
        let write_err = |source| TrackerError::OutputWriteFailed {
            path: path.clone(),
            source,
        };

        tokio::fs::create_dir_all(dir).await.map_err(write_err)?;
        let tmp_path = dir.join(format!("{}.tmp", target.file_name()));
        tokio::fs::write(&tmp_path, &bytes).await.map_err(write_err)?;
        tokio::fs::rename(&tmp_path, &path).await.map_err(write_err)?;
        Ok(path)
    }
}

/// `true` when polling this job can stop: it just reached a terminal state,
/// or it was already terminal and the snapshot was rejected.
fn settles_job(outcome: &ApplyOutcome) -> bool {
    match outcome {
        ApplyOutcome::Applied { terminal, .. } => *terminal,
        ApplyOutcome::Rejected { current, .. } => current.is_terminal(),
    }
}

fn outcome_events(outcome: ApplyOutcome) -> Vec<TrackerEvent> {
    match outcome {
        ApplyOutcome::Rejected { .. } => Vec::new(),
        ApplyOutcome::Applied {
            job, batch_ready, ..
        } => {
            let mut events = vec![TrackerEvent::JobUpdated { job }];
            if let Some(batch_id) = batch_ready {
                events.push(TrackerEvent::AggregateAvailable { batch_id });
            }
            events
        }
    }
}
