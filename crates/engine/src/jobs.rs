//! Job slots: sequence-numbered background jobs with cooperative cancellation
//!
//! Each slot (analysis, discovery, backtest) runs at most one current job.
//! Submitting a job bumps the slot's sequence number and cancels the previous
//! job; a job finishing with a stale sequence number cannot publish.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, PoisonError, RwLock,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::EngineError;

/// Cancellation flag and progress counters shared with a running job
#[derive(Debug, Default)]
pub struct JobControl {
    cancelled: AtomicBool,
    total: AtomicU32,
    completed: AtomicU32,
    #[cfg(test)]
    cancel_after: AtomicU32,
}

impl JobControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn set_total(&self, total: usize) {
        self.total.store(total as u32, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
    }

    pub fn advance(&self) {
        let completed = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        self.trip(completed);
    }

    /// Cancel as soon as `steps` units of work have completed
    #[cfg(test)]
    pub(crate) fn cancel_after(&self, steps: u32) {
        self.cancel_after.store(steps, Ordering::Relaxed);
    }

    #[cfg(test)]
    fn trip(&self, completed: u32) {
        if self.cancel_after.load(Ordering::Relaxed) == completed {
            self.cancel();
        }
    }

    #[cfg(not(test))]
    fn trip(&self, _completed: u32) {}

    pub fn progress(&self) -> JobProgress {
        let total = self.total.load(Ordering::Relaxed);
        let completed = self.completed.load(Ordering::Relaxed);
        let pct = if total == 0 {
            0.0
        } else {
            (completed as f32 / total as f32) * 100.0
        };
        JobProgress {
            completed,
            total,
            pct,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct JobProgress {
    pub completed: u32,
    pub total: u32,
    pub pct: f32,
}

/// Terminal result of a job that did not fail
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "result", rename_all = "snake_case")]
pub enum JobOutcome<T> {
    Completed(T),
    Cancelled,
}

impl<T> JobOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            JobOutcome::Completed(v) => Some(v),
            JobOutcome::Cancelled => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobOutcome::Cancelled)
    }
}

/// Handle given to the job that owns the slot's current sequence number
#[derive(Debug, Clone)]
pub struct JobTicket {
    pub sequence: u64,
    pub control: Arc<JobControl>,
}

/// Latest published state of a slot
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobState<T> {
    Idle,
    Running {
        sequence: u64,
        started_at: DateTime<Utc>,
    },
    Completed {
        sequence: u64,
        result: T,
    },
    Cancelled {
        sequence: u64,
    },
    Failed {
        sequence: u64,
        error: String,
    },
}

impl<T> JobState<T> {
    pub fn is_running(&self) -> bool {
        matches!(self, JobState::Running { .. })
    }
}

struct SlotInner<T> {
    sequence: u64,
    control: Option<Arc<JobControl>>,
    state: JobState<T>,
}

pub struct JobSlot<T> {
    name: &'static str,
    inner: RwLock<SlotInner<T>>,
}

impl<T: Clone> JobSlot<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: RwLock::new(SlotInner {
                sequence: 0,
                control: None,
                state: JobState::Idle,
            }),
        }
    }

    /// Claim the slot for a new job, cancelling whatever held it before
    pub fn begin(&self) -> JobTicket {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = inner.control.take() {
            previous.cancel();
        }
        inner.sequence += 1;
        let control = Arc::new(JobControl::new());
        inner.control = Some(control.clone());
        inner.state = JobState::Running {
            sequence: inner.sequence,
            started_at: Utc::now(),
        };
        debug!(slot = self.name, sequence = inner.sequence, "Job started");
        JobTicket {
            sequence: inner.sequence,
            control,
        }
    }

    /// Publish a finished job. Returns false when a newer job owns the slot.
    pub fn publish(&self, ticket: &JobTicket, result: &Result<JobOutcome<T>, EngineError>) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.sequence != ticket.sequence {
            warn!(
                slot = self.name,
                stale = ticket.sequence,
                current = inner.sequence,
                "Dropping stale job result"
            );
            return false;
        }
        inner.state = match result {
            Ok(JobOutcome::Completed(value)) => JobState::Completed {
                sequence: ticket.sequence,
                result: value.clone(),
            },
            Ok(JobOutcome::Cancelled) => JobState::Cancelled {
                sequence: ticket.sequence,
            },
            Err(e) => JobState::Failed {
                sequence: ticket.sequence,
                error: e.to_string(),
            },
        };
        inner.control = None;
        true
    }

    /// Request cancellation of the current job, if any
    pub fn cancel(&self) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        match &inner.control {
            Some(control) => {
                control.cancel();
                true
            }
            None => false,
        }
    }

    pub fn state(&self) -> JobState<T> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
            .clone()
    }

    pub fn progress(&self) -> Option<JobProgress> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.control.as_ref().map(|c| c.progress())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_cancels_previous() {
        let slot: JobSlot<u32> = JobSlot::new("test");
        let first = slot.begin();
        let second = slot.begin();
        assert!(first.control.is_cancelled());
        assert!(!second.control.is_cancelled());
        assert_eq!(second.sequence, first.sequence + 1);
    }

    #[test]
    fn test_stale_publication_is_dropped() {
        let slot: JobSlot<u32> = JobSlot::new("test");
        let first = slot.begin();
        let second = slot.begin();

        assert!(!slot.publish(&first, &Ok(JobOutcome::Completed(1))));
        assert!(slot.state().is_running());

        assert!(slot.publish(&second, &Ok(JobOutcome::Completed(2))));
        assert_eq!(
            slot.state(),
            JobState::Completed {
                sequence: second.sequence,
                result: 2
            }
        );
    }

    #[test]
    fn test_cancel_and_failure_states() {
        let slot: JobSlot<u32> = JobSlot::new("test");
        assert!(!slot.cancel());
        assert_eq!(slot.state(), JobState::Idle);

        let ticket = slot.begin();
        assert!(slot.cancel());
        assert!(ticket.control.is_cancelled());
        slot.publish(&ticket, &Ok(JobOutcome::Cancelled));
        assert_eq!(slot.state(), JobState::Cancelled { sequence: ticket.sequence });

        let ticket = slot.begin();
        slot.publish(&ticket, &Err(EngineError::UpstreamUnavailable("down".into())));
        assert!(matches!(slot.state(), JobState::Failed { .. }));
        assert!(slot.progress().is_none());
    }

    #[test]
    fn test_progress_counters() {
        let control = JobControl::new();
        assert_eq!(control.progress().pct, 0.0);
        control.set_total(4);
        control.advance();
        let p = control.progress();
        assert_eq!((p.completed, p.total), (1, 4));
        assert!((p.pct - 25.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_cancel_after_trips_on_the_nth_step() {
        let control = JobControl::new();
        control.set_total(10);
        control.cancel_after(3);
        control.advance();
        control.advance();
        assert!(!control.is_cancelled());
        control.advance();
        assert!(control.is_cancelled());
    }
}
