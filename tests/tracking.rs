//! Integration tests for the tracker against an in-process fake service.
//!
//! Every test runs on a paused Tokio clock: `sleep` advances virtual time
//! instantly, so a 1 s poll interval makes cycle boundaries exact. Poll
//! cycles fire at t = 1 s, 2 s, 3 s, … after a job is subscribed.
//!
//! Run with:
//!   cargo test --test tracking

use async_trait::async_trait;
use doc2img_client::{
    ApplyOutcome, Background, ConversionService, Document, DownloadTarget, IdentityProvider, Job,
    JobSnapshot, JobState, ServiceError, SubmitRequest, Tracker, TrackerConfig, TrackerError,
    TrackerEvent, TrackerObserver, UserIdentity,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;
use tokio_test::{assert_err, assert_ok};
use tracing_subscriber::EnvFilter;

// ── Test doubles ─────────────────────────────────────────────────────────────

type Scripted<T> = Result<T, ServiceError>;

/// Conversion service replaying scripted responses.
///
/// Each job has a queue of status responses; the last one repeats once the
/// queue is down to a single entry. A job may carry a one-shot gate: its next
/// status call blocks until the gate is notified. Submissions can be gated the
/// same way.
#[derive(Default)]
struct FakeService {
    submit_response: Mutex<Option<Scripted<Vec<JobSnapshot>>>>,
    statuses: Mutex<HashMap<String, VecDeque<Scripted<JobSnapshot>>>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    submit_gate: Mutex<Option<Arc<Notify>>>,
    downloads: Mutex<HashMap<String, Scripted<Vec<u8>>>>,
    submit_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl FakeService {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn on_submit(&self, response: Scripted<Vec<JobSnapshot>>) {
        *self.submit_response.lock().unwrap() = Some(response);
    }

    fn script(&self, job_id: &str, responses: Vec<Scripted<JobSnapshot>>) {
        self.statuses
            .lock()
            .unwrap()
            .insert(job_id.to_string(), responses.into());
    }

    fn gate(&self, job_id: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(job_id.to_string(), gate.clone());
        gate
    }

    fn gate_submit(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.submit_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    fn on_download(&self, target: &DownloadTarget, response: Scripted<Vec<u8>>) {
        self.downloads
            .lock()
            .unwrap()
            .insert(target.to_string(), response);
    }

    fn fetches(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConversionService for FakeService {
    async fn submit(
        &self,
        _token: &str,
        _request: &SubmitRequest,
    ) -> Result<Vec<JobSnapshot>, ServiceError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.submit_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.submit_response
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Err(ServiceError::Transport("no submit scripted".into())))
    }

    async fn fetch_job(&self, _token: &str, job_id: &str) -> Result<JobSnapshot, ServiceError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gates.lock().unwrap().remove(job_id);
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let mut statuses = self.statuses.lock().unwrap();
        let queue = statuses
            .get_mut(job_id)
            .ok_or_else(|| ServiceError::Status {
                status: 404,
                detail: format!("unknown job {job_id}"),
            })?;
        let next = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        next.unwrap_or_else(|| Err(ServiceError::Transport("empty script".into())))
    }

    async fn download(
        &self,
        _token: &str,
        target: &DownloadTarget,
    ) -> Result<Vec<u8>, ServiceError> {
        self.downloads
            .lock()
            .unwrap()
            .get(&target.to_string())
            .cloned()
            .unwrap_or_else(|| Ok(b"PK\x03\x04".to_vec()))
    }
}

/// Identity provider issuing `token-1`, `token-2`, … per login.
#[derive(Default)]
struct FakeIdentity {
    logins: AtomicUsize,
}

#[async_trait]
impl IdentityProvider for FakeIdentity {
    async fn authenticate(
        &self,
        identifier: &str,
        password: &str,
    ) -> Result<(String, UserIdentity), ServiceError> {
        if password != "secret" {
            return Err(ServiceError::Status {
                status: 400,
                detail: "Invalid identifier or password".into(),
            });
        }
        let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        Ok((
            format!("token-{n}"),
            UserIdentity {
                id: 1,
                username: identifier.to_string(),
                email: None,
            },
        ))
    }
}

/// Observer recording every event in order.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<TrackerEvent>>,
}

impl Recorder {
    fn push(&self, event: TrackerEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn aggregates(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                TrackerEvent::AggregateAvailable { batch_id } => Some(batch_id.clone()),
                _ => None,
            })
            .collect()
    }

    fn expiries(&self) -> usize {
        self.count(|e| matches!(e, TrackerEvent::SessionExpired))
    }

    fn poll_errors(&self) -> usize {
        self.count(|e| matches!(e, TrackerEvent::PollError { .. }))
    }

    fn updates_for(&self, job_id: &str) -> Vec<JobState> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                TrackerEvent::JobUpdated { job } if job.id == job_id => Some(job.state),
                _ => None,
            })
            .collect()
    }

    fn count(&self, pred: impl Fn(&TrackerEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

impl TrackerObserver for Recorder {
    fn on_job_updated(&self, job: &Job) {
        self.push(TrackerEvent::JobUpdated { job: job.clone() });
    }
    fn on_aggregate_available(&self, batch_id: &str) {
        self.push(TrackerEvent::AggregateAvailable {
            batch_id: batch_id.to_string(),
        });
    }
    fn on_session_expired(&self) {
        self.push(TrackerEvent::SessionExpired);
    }
    fn on_poll_error(&self, job_id: &str, error: &str) {
        self.push(TrackerEvent::PollError {
            job_id: job_id.to_string(),
            error: error.to_string(),
        });
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

struct Harness {
    tracker: Tracker,
    service: Arc<FakeService>,
    events: Arc<Recorder>,
}

fn config(request_timeout_secs: u64) -> TrackerConfig {
    TrackerConfig::builder()
        .poll_interval(Duration::from_secs(1))
        .request_timeout_secs(request_timeout_secs)
        .build()
        .unwrap()
}

async fn harness() -> Harness {
    harness_with(config(30)).await
}

/// Route tracker logs to the test output; filter with `RUST_LOG`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn harness_with(config: TrackerConfig) -> Harness {
    init_tracing();
    let service = FakeService::new();
    let events = Arc::new(Recorder::default());
    let tracker = Tracker::builder(config)
        .service(service.clone())
        .identity(Arc::new(FakeIdentity::default()))
        .observer(events.clone())
        .build()
        .unwrap();
    assert_ok!(tracker.login("alice", "secret").await);
    Harness {
        tracker,
        service,
        events,
    }
}

fn pending(id: &str) -> JobSnapshot {
    JobSnapshot::new(id, JobState::Queued)
}

fn batch_of(batch_id: &str, ids: &[&str]) -> Vec<JobSnapshot> {
    ids.iter().map(|id| pending(id).in_batch(batch_id)).collect()
}

fn snap(id: &str, state: JobState) -> Scripted<JobSnapshot> {
    Ok(JobSnapshot::new(id, state))
}

fn batch_snap(id: &str, batch_id: &str, state: JobState) -> Scripted<JobSnapshot> {
    Ok(JobSnapshot::new(id, state).in_batch(batch_id))
}

fn request(n: usize) -> SubmitRequest {
    SubmitRequest::new(
        (0..n)
            .map(|i| Document::new(format!("doc{i}.docx"), b"bytes".to_vec()))
            .collect(),
    )
}

/// Advance virtual time to just past poll cycle `n`.
async fn after_cycles(n: u64) {
    sleep(Duration::from_millis(n * 1000 + 500)).await;
}

// ── Subscription lifecycle ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_subscribe_is_idempotent() {
    let h = harness().await;
    h.service.script("x", vec![snap("x", JobState::Processing)]);

    assert!(h.tracker.subscribe("x"));
    assert!(!h.tracker.subscribe("x"));
    assert_eq!(h.tracker.active_subscriptions(), vec!["x".to_string()]);

    after_cycles(3).await;
    assert_eq!(h.service.fetches(), 3, "one poll loop, one fetch per cycle");
    assert!(h.tracker.is_subscribed("x"));

    assert!(h.tracker.unsubscribe("x"));
    assert!(!h.tracker.unsubscribe("x"));
    after_cycles(3).await;
    assert_eq!(h.service.fetches(), 3, "no polling after unsubscribe");
}

#[tokio::test(start_paused = true)]
async fn test_terminal_job_stops_its_own_polling() {
    let h = harness().await;
    h.service.on_submit(Ok(vec![pending("a")]));
    h.service.script(
        "a",
        vec![snap("a", JobState::Processing), snap("a", JobState::Completed)],
    );

    let submission = assert_ok!(h.tracker.submit(request(1)).await);
    assert_eq!(submission.batch_id, None);
    assert!(h.tracker.is_subscribed("a"));

    after_cycles(2).await;
    assert!(!h.tracker.is_subscribed("a"));
    let job = h.tracker.job("a").unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(
        h.events.updates_for("a"),
        vec![JobState::Queued, JobState::Processing, JobState::Completed]
    );

    after_cycles(5).await;
    assert_eq!(h.service.fetches(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_already_terminal_job_is_not_subscribed() {
    let h = harness().await;
    h.service.on_submit(Ok(vec![
        JobSnapshot::new("a", JobState::Completed).in_batch("b1"),
        JobSnapshot::new("b", JobState::Completed).in_batch("b1"),
    ]));

    let submission = assert_ok!(h.tracker.submit(request(2)).await);
    assert_eq!(submission.batch_id.as_deref(), Some("b1"));
    assert!(h.tracker.active_subscriptions().is_empty());
    assert_eq!(h.events.aggregates(), vec!["b1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_wait_until_idle_resolves_when_all_jobs_settle() {
    let h = harness().await;
    h.service.on_submit(Ok(batch_of("b1", &["a", "b"])));
    h.service.script(
        "a",
        vec![batch_snap("a", "b1", JobState::Processing), batch_snap("a", "b1", JobState::Completed)],
    );
    h.service
        .script("b", vec![batch_snap("b", "b1", JobState::Failed)]);

    assert_ok!(h.tracker.submit(request(2)).await);
    assert_ok!(tokio::time::timeout(Duration::from_secs(10), h.tracker.wait_until_idle()).await);

    assert_eq!(h.tracker.job("a").unwrap().state, JobState::Completed);
    assert_eq!(h.tracker.job("b").unwrap().state, JobState::Failed);
    assert!(
        h.events.aggregates().is_empty(),
        "a failed member never completes its batch"
    );
}

// ── Batch completion ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_batch_aggregate_fires_once_on_last_completion() {
    let h = harness().await;
    h.service.on_submit(Ok(batch_of("b1", &["a", "b", "c"])));
    // Completion order: c (cycle 1), a (cycle 2), b (cycle 3).
    h.service
        .script("c", vec![batch_snap("c", "b1", JobState::Completed)]);
    h.service.script(
        "a",
        vec![
            batch_snap("a", "b1", JobState::Processing),
            batch_snap("a", "b1", JobState::Completed),
        ],
    );
    h.service.script(
        "b",
        vec![
            batch_snap("b", "b1", JobState::Processing),
            batch_snap("b", "b1", JobState::Processing),
            batch_snap("b", "b1", JobState::Completed),
        ],
    );

    assert_ok!(h.tracker.submit(request(3)).await);
    let batch = h.tracker.batch("b1").unwrap();
    assert_eq!(batch.members().len(), 3);

    after_cycles(2).await;
    assert!(h.events.aggregates().is_empty());
    assert_eq!(h.tracker.batch("b1").unwrap().completed().len(), 2);

    after_cycles(1).await;
    assert_eq!(h.events.aggregates(), vec!["b1".to_string()]);
    assert!(h.tracker.batch("b1").unwrap().aggregate_offered());
    assert!(h.tracker.active_subscriptions().is_empty());

    after_cycles(5).await;
    assert_eq!(h.events.aggregates().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_terminal_snapshot_is_ignored() {
    let h = harness().await;
    h.service.on_submit(Ok(batch_of("b1", &["a", "b"])));
    h.service
        .script("a", vec![batch_snap("a", "b1", JobState::Processing)]);
    h.service
        .script("b", vec![batch_snap("b", "b1", JobState::Processing)]);
    assert_ok!(h.tracker.submit(request(2)).await);

    let done_a = JobSnapshot::new("a", JobState::Completed).in_batch("b1");
    assert!(h.tracker.apply(done_a.clone()).is_terminal());
    assert!(!h.tracker.is_subscribed("a"));
    assert!(matches!(
        h.tracker.apply(done_a),
        ApplyOutcome::Rejected {
            current: JobState::Completed,
            ..
        }
    ));
    assert!(
        h.events.aggregates().is_empty(),
        "a repeated completion must not count twice"
    );

    let done_b = JobSnapshot::new("b", JobState::Completed).in_batch("b1");
    h.tracker.apply(done_b.clone());
    h.tracker.apply(done_b);
    assert_eq!(h.events.aggregates(), vec!["b1".to_string()]);

    // A late non-terminal snapshot cannot reopen a finished job.
    assert!(matches!(
        h.tracker.apply(JobSnapshot::new("b", JobState::Processing).in_batch("b1")),
        ApplyOutcome::Rejected { .. }
    ));
    assert_eq!(h.tracker.job("b").unwrap().state, JobState::Completed);
}

// ── Session invalidation ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_unauthorized_poll_stops_everything_once() {
    let h = harness().await;
    h.service.on_submit(Ok(batch_of("b1", &["a", "b", "c"])));
    for id in ["a", "b", "c"] {
        h.service.script(id, vec![Err(ServiceError::Unauthorized)]);
    }
    assert_ok!(h.tracker.submit(request(3)).await);
    assert_eq!(h.tracker.active_subscriptions().len(), 3);

    after_cycles(1).await;
    assert_eq!(h.events.expiries(), 1, "one notification for K rejections");
    assert!(h.tracker.active_subscriptions().is_empty());
    assert!(!h.tracker.session().is_valid());
    assert!(h.tracker.session().expired().is_cancelled());
    assert!(h.tracker.batch("b1").is_none());

    // Job records survive the teardown.
    for id in ["a", "b", "c"] {
        assert_eq!(h.tracker.job(id).unwrap().state, JobState::Queued);
    }

    let fetches = h.service.fetches();
    assert!(fetches <= 3);
    after_cycles(5).await;
    assert_eq!(h.service.fetches(), fetches, "no polling after invalidation");
    assert_eq!(h.events.expiries(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unauthorized_on_one_job_cancels_the_others() {
    let h = harness().await;
    h.service.on_submit(Ok(batch_of("b1", &["a", "b"])));
    h.service.script(
        "a",
        vec![
            batch_snap("a", "b1", JobState::Processing),
            Err(ServiceError::Unauthorized),
        ],
    );
    h.service
        .script("b", vec![batch_snap("b", "b1", JobState::Processing)]);
    assert_ok!(h.tracker.submit(request(2)).await);

    after_cycles(2).await;
    assert_eq!(h.events.expiries(), 1);
    assert!(!h.tracker.is_subscribed("b"));
    assert_eq!(h.tracker.job("a").unwrap().state, JobState::Processing);
    assert_eq!(h.tracker.job("b").unwrap().state, JobState::Processing);
}

#[tokio::test(start_paused = true)]
async fn test_relogin_rearms_expiry_notification() {
    let h = harness().await;
    h.service.script("a", vec![Err(ServiceError::Unauthorized)]);

    h.tracker.subscribe("a");
    after_cycles(1).await;
    assert_eq!(h.events.expiries(), 1);

    assert_ok!(h.tracker.login("alice", "secret").await);
    assert!(h.tracker.session().is_valid());
    assert!(!h.tracker.session().expired().is_cancelled());

    h.tracker.subscribe("a");
    after_cycles(1).await;
    assert_eq!(h.events.expiries(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_logout_stops_polling_without_notification() {
    let h = harness().await;
    h.service.script("a", vec![snap("a", JobState::Processing)]);
    h.tracker.subscribe("a");
    after_cycles(1).await;

    h.tracker.logout();
    assert!(h.tracker.active_subscriptions().is_empty());
    assert!(!h.tracker.session().is_valid());
    assert_eq!(h.events.expiries(), 0);

    let fetches = h.service.fetches();
    after_cycles(3).await;
    assert_eq!(h.service.fetches(), fetches);
}

#[tokio::test(start_paused = true)]
async fn test_submit_unauthorized_expires_session() {
    let h = harness().await;
    h.service.on_submit(Err(ServiceError::Unauthorized));

    let err = assert_err!(h.tracker.submit(request(1)).await);
    assert!(matches!(err, TrackerError::SessionExpired));
    assert_eq!(h.events.expiries(), 1);
    assert!(!h.tracker.session().is_valid());
}

// ── Cancellation races ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_in_flight_response_after_unsubscribe_is_discarded() {
    let h = harness().await;
    h.service.on_submit(Ok(vec![pending("a")]));
    h.service.script("a", vec![snap("a", JobState::Completed)]);
    let gate = h.service.gate("a");
    assert_ok!(h.tracker.submit(request(1)).await);

    after_cycles(1).await;
    assert_eq!(h.service.fetches(), 1, "status call is in flight");

    assert!(h.tracker.unsubscribe("a"));
    gate.notify_one();
    after_cycles(2).await;

    assert!(!h.tracker.is_subscribed("a"));
    assert_eq!(h.tracker.job("a").unwrap().state, JobState::Queued);
    assert_eq!(h.events.updates_for("a"), vec![JobState::Queued]);
    assert_eq!(h.service.fetches(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_response_after_invalidation_is_discarded() {
    let h = harness().await;
    h.service.on_submit(Ok(batch_of("b1", &["a", "b"])));
    h.service
        .script("a", vec![batch_snap("a", "b1", JobState::Completed)]);
    h.service.script("b", vec![Err(ServiceError::Unauthorized)]);
    let gate = h.service.gate("a");
    assert_ok!(h.tracker.submit(request(2)).await);

    after_cycles(1).await;
    assert_eq!(h.events.expiries(), 1);

    gate.notify_one();
    after_cycles(1).await;
    assert_eq!(h.tracker.job("a").unwrap().state, JobState::Queued);
    assert!(h.events.aggregates().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rejection_of_replaced_credential_keeps_polling() {
    let h = harness().await;
    h.service.script(
        "a",
        vec![Err(ServiceError::Unauthorized), snap("a", JobState::Completed)],
    );
    let gate = h.service.gate("a");
    assert!(h.tracker.subscribe("a"));

    after_cycles(1).await;
    assert_eq!(h.service.fetches(), 1, "status call is in flight");

    // The credential is replaced while the old one is being rejected.
    let user = h.tracker.session().load().unwrap().user;
    assert_ok!(h.tracker.session().save("token-fresh", user));
    gate.notify_one();

    assert_ok!(tokio::time::timeout(Duration::from_secs(10), h.tracker.wait_until_idle()).await);
    assert_eq!(h.events.expiries(), 0);
    assert!(h.tracker.session().is_valid());
    assert_eq!(h.tracker.job("a").unwrap().state, JobState::Completed);
    assert!(!h.tracker.is_subscribed("a"));
    assert_eq!(h.service.fetches(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_submit_response_after_invalidation_is_discarded() {
    let h = harness().await;
    h.service.on_submit(Ok(batch_of("b1", &["p", "q"])));
    let gate = h.service.gate_submit();

    let tracker = h.tracker.clone();
    let pending_submit = tokio::spawn(async move { tracker.submit(request(2)).await });
    sleep(Duration::from_millis(10)).await;
    assert_eq!(h.service.submit_calls.load(Ordering::SeqCst), 1);

    h.tracker.invalidate_session();
    gate.notify_one();

    let err = assert_err!(pending_submit.await.unwrap());
    assert!(matches!(err, TrackerError::SessionExpired));
    assert!(h.tracker.active_subscriptions().is_empty());
    assert!(h.tracker.batch("b1").is_none());
    assert!(h.tracker.job("p").is_none());
    assert_eq!(h.events.expiries(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_submit_response_after_relogin_is_discarded() {
    let h = harness().await;
    h.service.on_submit(Ok(vec![pending("p")]));
    let gate = h.service.gate_submit();

    let tracker = h.tracker.clone();
    let pending_submit = tokio::spawn(async move { tracker.submit(request(1)).await });
    sleep(Duration::from_millis(10)).await;

    assert_ok!(h.tracker.login("alice", "secret").await);
    gate.notify_one();

    let err = assert_err!(pending_submit.await.unwrap());
    assert!(matches!(err, TrackerError::SessionExpired));
    assert!(h.tracker.session().is_valid(), "the new session is untouched");
    assert!(h.tracker.active_subscriptions().is_empty());
}

// ── Transient failures ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_transient_errors_are_retried() {
    let h = harness().await;
    h.service.on_submit(Ok(vec![pending("a")]));
    h.service.script(
        "a",
        vec![
            Err(ServiceError::Status {
                status: 503,
                detail: "busy".into(),
            }),
            Err(ServiceError::Transport("connection reset".into())),
            snap("a", JobState::Completed),
        ],
    );
    assert_ok!(h.tracker.submit(request(1)).await);

    after_cycles(2).await;
    assert_eq!(h.events.poll_errors(), 2);
    assert!(h.tracker.is_subscribed("a"));
    assert!(h.tracker.session().is_valid());

    after_cycles(1).await;
    assert_eq!(h.tracker.job("a").unwrap().state, JobState::Completed);
    assert!(!h.tracker.is_subscribed("a"));
}

#[tokio::test(start_paused = true)]
async fn test_slow_status_check_times_out_and_retries() {
    let h = harness_with(config(2)).await;
    h.service.on_submit(Ok(vec![pending("a")]));
    h.service.script("a", vec![snap("a", JobState::Completed)]);
    let _gate = h.service.gate("a");
    assert_ok!(h.tracker.submit(request(1)).await);

    // Cycle 1 starts at t=1s and times out at t=3s; the missed tick at t=2s
    // fires as soon as the loop is free, so the retry also runs at t=3s.
    sleep(Duration::from_millis(2500)).await;
    assert_eq!(h.events.poll_errors(), 0);
    assert_eq!(h.tracker.job("a").unwrap().state, JobState::Queued);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(h.events.poll_errors(), 1);
    assert_eq!(h.tracker.job("a").unwrap().state, JobState::Completed);
    assert!(!h.tracker.is_subscribed("a"));
}

// ── Submission validation ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_invalid_submission_never_reaches_the_service() {
    let h = harness().await;

    let err = assert_err!(h.tracker.submit(SubmitRequest::new(Vec::new())).await);
    assert!(matches!(err, TrackerError::NoDocuments));

    let bad_color = request(1).background(Background::Color("red".into()));
    let err = assert_err!(h.tracker.submit(bad_color).await);
    assert!(matches!(err, TrackerError::InvalidBackgroundColor { .. }));

    assert_eq!(h.service.submit_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_submit_requires_login() {
    let service = FakeService::new();
    let tracker = Tracker::new(config(30), service.clone(), Arc::new(FakeIdentity::default()));

    let err = assert_err!(tracker.submit(request(1)).await);
    assert!(matches!(err, TrackerError::NotAuthenticated));
    assert_eq!(service.submit_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_login_failure_keeps_logged_out() {
    let tracker = Tracker::builder(config(30))
        .service(FakeService::new())
        .identity(Arc::new(FakeIdentity::default()))
        .build()
        .unwrap();

    let err = assert_err!(tracker.login("alice", "wrong").await);
    assert!(
        matches!(err, TrackerError::LoginFailed { ref message } if message.contains("Invalid identifier"))
    );
    assert!(!tracker.session().is_valid());
}

#[tokio::test(start_paused = true)]
async fn test_empty_submit_response_is_an_error() {
    let h = harness().await;
    h.service.on_submit(Ok(Vec::new()));
    let err = assert_err!(h.tracker.submit(request(1)).await);
    assert!(matches!(err, TrackerError::Service(ServiceError::Decode(_))));
}

// ── Downloads ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_download_failure_leaves_state_untouched() {
    let h = harness().await;
    h.service.on_submit(Ok(vec![
        JobSnapshot::new("a", JobState::Completed).in_batch("b1"),
        JobSnapshot::new("b", JobState::Completed).in_batch("b1"),
    ]));
    let target = DownloadTarget::Batch("b1".into());
    h.service.on_download(
        &target,
        Err(ServiceError::Status {
            status: 500,
            detail: "archive missing".into(),
        }),
    );
    assert_ok!(h.tracker.submit(request(2)).await);

    let err = assert_err!(h.tracker.download_batch("b1").await);
    assert!(matches!(err, TrackerError::DownloadFailed { ref reason, .. } if reason.contains("archive missing")));

    assert!(h.tracker.session().is_valid());
    assert!(h.tracker.batch("b1").unwrap().aggregate_offered());
    assert_eq!(h.tracker.job("a").unwrap().state, JobState::Completed);

    let bytes = assert_ok!(h.tracker.download_job("a").await);
    assert!(bytes.starts_with(b"PK"));
}

#[tokio::test(start_paused = true)]
async fn test_download_unauthorized_expires_session() {
    let h = harness().await;
    h.service
        .on_download(&DownloadTarget::Job("a".into()), Err(ServiceError::Unauthorized));

    let err = assert_err!(h.tracker.download_job("a").await);
    assert!(matches!(err, TrackerError::SessionExpired));
    assert_eq!(h.events.expiries(), 1);
}

#[tokio::test]
async fn test_download_to_file_writes_archive() {
    let h = harness().await;
    h.service.on_download(
        &DownloadTarget::Batch("b1".into()),
        Ok(b"PK batch".to_vec()),
    );
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("nested");

    let path = assert_ok!(h.tracker.download_batch_to_file("b1", &out).await);
    assert_eq!(path, out.join("batch-b1.zip"));
    assert_eq!(std::fs::read(&path).unwrap(), b"PK batch");
    assert!(!out.join("batch-b1.zip.tmp").exists());
}

// ── Refresh ──────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_refresh_applies_and_settles() {
    let h = harness().await;
    h.service.script("a", vec![snap("a", JobState::Completed)]);
    h.tracker.apply(pending("a"));
    h.tracker.subscribe("a");

    let job = assert_ok!(h.tracker.refresh("a").await);
    assert_eq!(job.state, JobState::Completed);
    assert!(!h.tracker.is_subscribed("a"));
}
