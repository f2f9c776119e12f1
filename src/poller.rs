//! Per-job polling subscriptions.
//!
//! [`JobPoller`] is the subscription registry: job id → cancellation token of
//! the task polling it. At most one entry exists per job id, and removing an
//! entry always cancels its token, so "token not cancelled" is equivalent to
//! "this task still owns the subscription".
//!
//! ## Cycle ordering
//!
//! Each subscription runs [`run`] on its own task. A job's cycles are
//! serialized: the loop awaits the status response (bounded by the request
//! timeout) before waiting for the next tick, and missed ticks are delayed
//! rather than bursted. Two responses for the same job can therefore never be
//! in flight at once, so they cannot be applied out of issue order.
//!
//! ## Cancellation
//!
//! Unsubscribing cancels the token, which wakes the loop immediately if it is
//! waiting for a tick. A response already in flight is not aborted; the
//! coordinator checks the token under its lock before applying anything and
//! discards the response if the subscription is gone.

use crate::tracker::Tracker;
use std::collections::HashMap;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What the loop does after a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CycleOutcome {
    Continue,
    Stop,
}

/// Registry of active poll subscriptions.
#[derive(Debug)]
pub struct JobPoller {
    active: HashMap<String, CancellationToken>,
    count: watch::Sender<usize>,
}

impl Default for JobPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl JobPoller {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            active: HashMap::new(),
            count,
        }
    }

    fn publish(&self) {
        self.count.send_replace(self.active.len());
    }

    /// Register `job_id`. Returns the new subscription's token, or `None` if
    /// the job is already subscribed.
    pub(crate) fn insert(&mut self, job_id: &str) -> Option<CancellationToken> {
        if self.active.contains_key(job_id) {
            debug!(job_id, "Already subscribed");
            return None;
        }
        let token = CancellationToken::new();
        self.active.insert(job_id.to_string(), token.clone());
        self.publish();
        debug!(job_id, active = self.active.len(), "Subscribed");
        Some(token)
    }

    /// Cancel and forget `job_id`'s subscription. Safe when not subscribed.
    pub(crate) fn remove(&mut self, job_id: &str) -> bool {
        let Some(token) = self.active.remove(job_id) else {
            return false;
        };
        token.cancel();
        self.publish();
        debug!(job_id, active = self.active.len(), "Unsubscribed");
        true
    }

    /// Remove `job_id` only if `token` still owns the subscription.
    pub(crate) fn release(&mut self, job_id: &str, token: &CancellationToken) -> bool {
        if token.is_cancelled() {
            return false;
        }
        self.remove(job_id)
    }

    /// Cancel every subscription. Returns how many were active.
    pub(crate) fn cancel_all(&mut self) -> usize {
        let n = self.active.len();
        for (_, token) in self.active.drain() {
            token.cancel();
        }
        self.publish();
        n
    }

    pub fn is_active(&self, job_id: &str) -> bool {
        self.active.contains_key(job_id)
    }

    /// Subscribed job ids, sorted.
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Receiver tracking the number of active subscriptions.
    pub(crate) fn watch(&self) -> watch::Receiver<usize> {
        self.count.subscribe()
    }
}

/// Poll `job_id` every `poll_interval` until the token is cancelled or a
/// cycle asks to stop. The first check fires one period after subscribing.
pub(crate) async fn run(tracker: Tracker, job_id: String, token: CancellationToken) {
    let period = tracker.config().poll_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut cycles: u64 = 0;
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        cycles += 1;
        if tracker.poll_once(&job_id, &token).await == CycleOutcome::Stop {
            break;
        }
    }
    info!(job_id = %job_id, cycles, "Polling stopped");
}
