// Entry Execution State Machine
//
// Tracks where a queued entry is in its lifecycle:
//
//   Queued --Selected--> Executing --Succeeded--> Completed
//                            |
//                            +--Failed/Released--> Queued
//
// Completed entries are removed from the queue right away.

use serde::Serialize;

/// Lifecycle state of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionState {
    /// Waiting in the queue for a worker.
    Queued,

    /// A worker holds the executing handle for it.
    Executing,

    /// The action finished successfully.
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionEvent {
    /// Picked by the scheduler.
    Selected,
    Succeeded,
    /// The executor reported an error.
    Failed,
    /// The handle was released without a verdict.
    Released,
}

/// Errors produced during state transitions.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("illegal state transition: {0}")]
    IllegalTransition(String),
}

impl ExecutionState {
    /// Apply a single event, returning the next state.
    pub fn apply(self, event: ExecutionEvent) -> Result<ExecutionState, StateError> {
        use ExecutionEvent::*;
        use ExecutionState::*;

        let next = match (self, event) {
            (Queued, Selected) => Executing,
            (Executing, Succeeded) => Completed,
            (Executing, Failed | Released) => Queued,

            (state, event) => {
                return Err(StateError::IllegalTransition(format!(
                    "cannot apply {:?} while {:?}",
                    event, state
                )))
            }
        };

        Ok(next)
    }

    pub fn is_executing(self) -> bool {
        self == ExecutionState::Executing
    }
}
