//! # State machine rules (spec.md §3 invariants I-J2, I-T1)
//!
//! Pure transition-validity predicates. The state *store* is what actually
//! performs transitions (guarded `UPDATE ... WHERE status = ...`); this
//! module is the single place that knows which transitions are legal, so
//! the store and the in-memory test double agree on the same rules.

use crate::model::{JobStatus, TaskStatus};

/// Whether `from -> to` is a legal job status transition.
///
/// I-J2: a job in COMPLETED/FAILED/CANCELLED is never mutated again, so
/// every terminal state has no outgoing edges. QUEUED and PROCESSING are
/// the only non-terminal states.
pub fn job_transition_allowed(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    if from.is_terminal() {
        return false;
    }
    matches!(
        (from, to),
        (Queued, Processing)
            | (Queued, Cancelled)
            | (Processing, Processing) // re-entrant: next stage's PROCESSING set
            | (Processing, Completed)
            | (Processing, Failed)
            | (Processing, Cancelled)
    )
}

/// Whether `from -> to` is a legal task status transition.
///
/// I-T1: QUEUED -> PROCESSING -> (COMPLETED | FAILED), no back-transitions.
pub fn task_transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    if from.is_terminal() {
        return false;
    }
    matches!(
        (from, to),
        (Queued, Processing) | (Queued, Completed) | (Queued, Failed) | (Processing, Completed)
            | (Processing, Failed)
    )
}
