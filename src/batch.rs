//! Batch bookkeeping: the join condition over a group of jobs submitted
//! together.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

/// A group of jobs sharing one batch identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch {
    pub id: String,
    members: BTreeSet<String>,
    completed: BTreeSet<String>,
    aggregate_offered: bool,
}

impl Batch {
    /// Member job ids, fixed at registration.
    pub fn members(&self) -> &BTreeSet<String> {
        &self.members
    }

    /// Members that reported `completed` so far. Always a subset of
    /// [`Batch::members`].
    pub fn completed(&self) -> &BTreeSet<String> {
        &self.completed
    }

    /// `true` once every member has completed.
    pub fn is_complete(&self) -> bool {
        self.completed.len() == self.members.len()
    }

    /// `true` once the aggregate download has been offered.
    pub fn aggregate_offered(&self) -> bool {
        self.aggregate_offered
    }
}

/// Tracks every registered batch for the lifetime of a session.
#[derive(Debug, Default)]
pub struct BatchRegistry {
    batches: HashMap<String, Batch>,
}

impl BatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a batch with its member jobs.
    ///
    /// The first registration wins; registering an existing id again is
    /// ignored and returns `false`.
    pub fn register<I, S>(&mut self, batch_id: &str, job_ids: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.batches.contains_key(batch_id) {
            debug!(batch_id, "Batch already registered, ignoring");
            return false;
        }
        let members: BTreeSet<String> = job_ids.into_iter().map(Into::into).collect();
        info!(batch_id, members = members.len(), "Registered batch");
        self.batches.insert(
            batch_id.to_string(),
            Batch {
                id: batch_id.to_string(),
                members,
                completed: BTreeSet::new(),
                aggregate_offered: false,
            },
        );
        true
    }

    /// Record that `job_id` completed.
    ///
    /// Returns `true` on exactly one call per batch: the one that makes the
    /// completed set equal to the member set. Unknown batches, non-members,
    /// repeats, and calls after completion all return `false`.
    pub fn mark_completed(&mut self, batch_id: &str, job_id: &str) -> bool {
        let Some(batch) = self.batches.get_mut(batch_id) else {
            debug!(batch_id, job_id, "Completion for unknown batch");
            return false;
        };
        if !batch.members.contains(job_id) {
            debug!(batch_id, job_id, "Completion for job outside batch");
            return false;
        }
        batch.completed.insert(job_id.to_string());
        if batch.aggregate_offered || !batch.is_complete() {
            return false;
        }
        batch.aggregate_offered = true;
        info!(batch_id, "Batch fully completed");
        true
    }

    pub fn get_batch(&self, batch_id: &str) -> Option<&Batch> {
        self.batches.get(batch_id)
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Discard every batch. Called on logout and session teardown.
    pub fn clear(&mut self) {
        self.batches.clear();
    }
}
