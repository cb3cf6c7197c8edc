//! Job lifecycle tracking.
//!
//! `Queued → Running → {Completed | Failed | Cancelled}`, with `Queued → Cancelled`
//! allowed. Terminal states are final; nothing is retried automatically.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

use super::OperationClass;
use crate::{SDKError, SDKResult};

pub type JobId = Uuid;

/// Terminal jobs remembered for `state` lookups.
const FINISHED_RETAINED: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: JobId,
    pub class: OperationClass,
    pub state: JobState,
    pub queued_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Gauges for live jobs and totals for finished ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounters {
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rejected: u64,
}

#[derive(Default)]
struct TrackerState {
    jobs: HashMap<JobId, JobRecord>,
    finished: VecDeque<JobId>,
    counters: JobCounters,
}

#[derive(Default)]
pub struct JobTracker {
    state: Mutex<TrackerState>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, class: OperationClass) -> JobId {
        let id = Uuid::new_v4();
        let mut state = self.state.lock();
        state.jobs.insert(
            id,
            JobRecord {
                id,
                class,
                state: JobState::Queued,
                queued_at: Utc::now(),
                finished_at: None,
            },
        );
        state.counters.queued += 1;
        id
    }

    /// Count a submission turned away before it got an id.
    pub fn reject(&self) {
        self.state.lock().counters.rejected += 1;
    }

    pub fn transition(&self, id: JobId, next: JobState) -> SDKResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| SDKError::not_found("job", id.to_string()))?;

        if !job.state.can_transition_to(next) {
            return Err(SDKError::invalid_operation(format!(
                "job {} cannot move from {} to {}",
                id, job.state, next
            )));
        }

        let counters = &mut state.counters;
        match job.state {
            JobState::Queued => counters.queued -= 1,
            JobState::Running => counters.running -= 1,
            _ => {}
        }
        match next {
            JobState::Running => counters.running += 1,
            JobState::Completed => counters.completed += 1,
            JobState::Failed => counters.failed += 1,
            JobState::Cancelled => counters.cancelled += 1,
            JobState::Queued => {}
        }
        job.state = next;

        if next.is_terminal() {
            job.finished_at = Some(Utc::now());
            state.finished.push_back(id);
            while state.finished.len() > FINISHED_RETAINED {
                if let Some(old) = state.finished.pop_front() {
                    state.jobs.remove(&old);
                }
            }
        }
        Ok(())
    }

    pub fn state(&self, id: JobId) -> Option<JobState> {
        self.state.lock().jobs.get(&id).map(|job| job.state)
    }

    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        self.state.lock().jobs.get(&id).cloned()
    }

    pub fn counters(&self) -> JobCounters {
        self.state.lock().counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        assert!(JobState::Queued.can_transition_to(JobState::Running));
        assert!(JobState::Queued.can_transition_to(JobState::Cancelled));
        assert!(!JobState::Queued.can_transition_to(JobState::Completed));
        assert!(!JobState::Running.can_transition_to(JobState::Queued));
        for terminal in [JobState::Completed, JobState::Failed, JobState::Cancelled] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(JobState::Running));
        }
    }

    #[test]
    fn test_tracker_counts() {
        let tracker = JobTracker::new();
        let a = tracker.register(OperationClass::Write);
        let b = tracker.register(OperationClass::Search);
        assert_eq!(tracker.counters().queued, 2);

        tracker.transition(a, JobState::Running).unwrap();
        tracker.transition(a, JobState::Completed).unwrap();
        tracker.transition(b, JobState::Cancelled).unwrap();
        tracker.reject();

        let counters = tracker.counters();
        assert_eq!(counters.queued, 0);
        assert_eq!(counters.running, 0);
        assert_eq!(counters.completed, 1);
        assert_eq!(counters.cancelled, 1);
        assert_eq!(counters.rejected, 1);

        assert!(tracker.transition(a, JobState::Failed).is_err());
        assert_eq!(tracker.state(a), Some(JobState::Completed));
        assert!(tracker.get(b).unwrap().finished_at.is_some());
    }
}
