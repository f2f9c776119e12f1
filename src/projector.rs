//! Applies job snapshots to the local job table.
//!
//! The projector is the only writer of [`Job`] values. It enforces the job
//! state machine, forwards completions of batch members to the
//! [`BatchRegistry`], and reports when a batch's aggregate action becomes
//! available. It never talks to an observer directly: the coordinator turns
//! the returned [`ApplyOutcome`] into events after releasing its lock.

use crate::batch::BatchRegistry;
use crate::job::{Job, JobSnapshot, JobState};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Result of [`JobStateProjector::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The snapshot tried to move the job backwards or out of a terminal
    /// state. Nothing changed.
    Rejected { current: JobState, attempted: JobState },
    /// The job was created or updated.
    Applied {
        job: Job,
        /// The job reached `Completed` or `Failed`; polling must stop.
        terminal: bool,
        /// Set when this application completed the job's batch.
        batch_ready: Option<String>,
    },
}

impl ApplyOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { terminal: true, .. })
    }
}

#[derive(Debug, Default)]
pub struct JobStateProjector {
    jobs: HashMap<String, Job>,
}

impl JobStateProjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one snapshot.
    pub fn apply(&mut self, snapshot: JobSnapshot, batches: &mut BatchRegistry) -> ApplyOutcome {
        let job = match self.jobs.get_mut(&snapshot.job_id) {
            Some(existing) => {
                if !existing.state.accepts(snapshot.state) {
                    if existing.state.is_terminal() && existing.state == snapshot.state {
                        debug!(job_id = %existing.id, state = %existing.state, "Duplicate terminal snapshot ignored");
                    } else {
                        warn!(
                            job_id = %existing.id,
                            current = %existing.state,
                            attempted = %snapshot.state,
                            "Rejected stale job snapshot"
                        );
                    }
                    return ApplyOutcome::Rejected {
                        current: existing.state,
                        attempted: snapshot.state,
                    };
                }
                existing.merge(snapshot);
                existing.clone()
            }
            None => {
                let job = Job::from_snapshot(snapshot);
                self.jobs.insert(job.id.clone(), job.clone());
                job
            }
        };
        debug!(job_id = %job.id, state = %job.state, revision = job.revision, "Applied job snapshot");

        let batch_ready = match (&job.state, &job.batch_id) {
            (JobState::Completed, Some(batch_id)) if batches.mark_completed(batch_id, &job.id) => {
                Some(batch_id.clone())
            }
            _ => None,
        };

        ApplyOutcome::Applied {
            terminal: job.state.is_terminal(),
            job,
            batch_ready,
        }
    }

    pub fn get(&self, job_id: &str) -> Option<&Job> {
        self.jobs.get(job_id)
    }

    /// All known jobs, in no particular order.
    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
