//! Worker state machine

use relay_foundation::{Error, Result};
use serde::{Deserialize, Serialize};

/// Lifecycle states of a worker, in order.
///
/// A worker only ever moves forward through this list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WorkerState {
    /// Creation was requested from the platform
    Requested,

    /// The platform acknowledged the worker
    Created,

    /// The worker reported running and ready
    Ready,

    /// A command is (or was) running in the worker
    Executing,

    /// Teardown has started
    Terminating,

    /// Teardown finished
    Deleted,
}

impl WorkerState {
    /// Check whether moving to `next` keeps the state monotonic.
    ///
    /// Staying in `Executing` is allowed so several commands can run in
    /// the same worker.
    pub fn can_advance_to(self, next: WorkerState) -> bool {
        next > self || (next == self && self == WorkerState::Executing)
    }

    /// Whether teardown has started or finished
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Terminating | WorkerState::Deleted)
    }

    /// Whether the platform holds a live worker that needs deleting
    pub fn needs_teardown(self) -> bool {
        matches!(
            self,
            WorkerState::Created | WorkerState::Ready | WorkerState::Executing
        )
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            WorkerState::Requested => "Requested",
            WorkerState::Created => "Created",
            WorkerState::Ready => "Ready",
            WorkerState::Executing => "Executing",
            WorkerState::Terminating => "Terminating",
            WorkerState::Deleted => "Deleted",
        }
    }

    /// Validate a transition, returning the new state
    pub fn advance(self, next: WorkerState) -> Result<WorkerState> {
        if self.can_advance_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        let mut state = WorkerState::Requested;
        for next in [
            WorkerState::Created,
            WorkerState::Ready,
            WorkerState::Executing,
            WorkerState::Executing,
            WorkerState::Terminating,
            WorkerState::Deleted,
        ] {
            state = state.advance(next).unwrap();
        }
        assert_eq!(state, WorkerState::Deleted);
    }

    #[test]
    fn test_no_regression() {
        assert!(WorkerState::Ready.advance(WorkerState::Created).is_err());
        assert!(WorkerState::Deleted.advance(WorkerState::Executing).is_err());
        assert!(WorkerState::Terminating
            .advance(WorkerState::Terminating)
            .is_err());
    }

    #[test]
    fn test_skipping_forward_is_allowed() {
        // Creation failures after acknowledgement go straight to teardown
        assert!(WorkerState::Created.can_advance_to(WorkerState::Terminating));
        assert!(WorkerState::Requested.can_advance_to(WorkerState::Deleted));
    }

    #[test]
    fn test_needs_teardown() {
        assert!(!WorkerState::Requested.needs_teardown());
        assert!(WorkerState::Created.needs_teardown());
        assert!(WorkerState::Executing.needs_teardown());
        assert!(!WorkerState::Terminating.needs_teardown());
    }
}
