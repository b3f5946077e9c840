//! Device workflows as explicit finite state machines.
//!
//! A workflow is the composition of three pieces:
//!
//! - a [`TransitionTable`] mapping `(state, trigger)` to the next state, validated once when it
//!   is built,
//! - an [`Actions`] set holding the async entry action of every working state,
//! - a context value shared with those actions (usually the device being driven).
//!
//! [`StateMachine`] runs the composition: it enters states, runs their entry actions and feeds
//! the trigger each action returns back into the table until it reaches the end or abort state.
//! Failing actions lead to error states, where an [`ErrorReporter`] picks Retry, Ignore or Abort.
//!
//! New workflow variants are new tables and action sets; the engine never changes.

use std::fmt::Debug;
use std::hash::Hash;

use thiserror::Error;

pub mod engine;
pub mod recovery;
pub mod table;
pub mod workflows;

pub use engine::{Actions, ExecutableMachine, MachineHandle, MachinePhase, StateMachine};
pub use recovery::{
    operator_channel, ErrorReport, ErrorReporter, OperatorChannel, OperatorRequest, Resolution,
    RetryPolicy,
};
pub use table::{ErrorState, TableBuilder, Transition, TransitionTable};

/// Requirements for state and trigger types: small, copyable, hashable enums.
pub trait Label: Copy + Eq + Hash + Debug + Send + Sync + 'static {}

impl<L> Label for L where L: Copy + Eq + Hash + Debug + Send + Sync + 'static {}

/// Trigger vocabulary every workflow honours.
pub trait WorkflowTrigger: Label {
    /// The step succeeded.
    const SUCCESS: Self;
    /// The step failed; go to its error state.
    const FAIL: Self;
    /// Loop back from an error state to the failed step.
    const RETRY: Self;
    /// Continue past the failed step.
    const IGNORE: Self;
    /// Terminate the workflow.
    const ABORT: Self;
}

/// Standard trigger set for device workflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// Kick off a workflow from its idle state
    Execute,
    /// Step succeeded
    Success,
    /// Step failed
    Fail,
    /// Step failed because a door is open
    FailDoor,
    /// Step failed while waiting for a rotor to spin down
    FailWaitForSpinDown,
    /// Workflow-specific continuation
    Continue,
    /// Keep waiting in the current state
    ContinueWait,
    /// Retry the failed step
    Retry,
    /// Skip the failed step
    Ignore,
    /// Terminate the workflow
    Abort,
}

impl WorkflowTrigger for Trigger {
    const SUCCESS: Self = Trigger::Success;
    const FAIL: Self = Trigger::Fail;
    const RETRY: Self = Trigger::Retry;
    const IGNORE: Self = Trigger::Ignore;
    const ABORT: Self = Trigger::Abort;
}

/// Problems found while building a transition table or pairing it with actions.
///
/// These are programming errors in a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    /// Two transitions for the same state and trigger.
    #[error("state {state} already has a transition for trigger {trigger}")]
    DuplicateTransition {
        /// Offending state
        state: String,
        /// Offending trigger
        trigger: String,
    },

    /// The start state does not accept the start trigger.
    #[error("start state {state} does not accept start trigger {trigger}")]
    MissingStartTransition {
        /// Start state
        state: String,
        /// Start trigger
        trigger: String,
    },

    /// End or abort state with outgoing transitions.
    #[error("terminal state {0} must not have outgoing transitions")]
    TerminalHasTransitions(String),

    /// Reachable, non-terminal state without outgoing transitions.
    #[error("state {0} is reachable but has no outgoing transitions")]
    DeadEnd(String),

    /// Reachable state that is neither a step nor an error state.
    #[error("state {0} has neither an entry action nor an error handler")]
    NoEntry(String),

    /// Step state without an action in the action set.
    #[error("state {0} is declared as a step but has no entry action")]
    MissingAction(String),

    /// Action registered for a state the table does not declare as a step.
    #[error("entry action registered for state {0}, which is not a step")]
    UnexpectedAction(String),
}

/// Why a workflow run did not reach its end state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    /// The run reached the abort state.
    #[error("{machine} aborted: {}", .reason.as_deref().unwrap_or("no error recorded"))]
    Aborted {
        /// Machine name
        machine: String,
        /// Last error recorded before the abort
        reason: Option<String>,
    },

    /// A trigger was fired that the current state does not permit.
    #[error("{machine}: trigger {trigger} is not permitted in state {state}")]
    InvalidTrigger {
        /// Machine name
        machine: String,
        /// State the machine was in
        state: String,
        /// Rejected trigger
        trigger: String,
    },

    /// The machine was flushed before it ran.
    #[error("{machine} was flushed before it started")]
    Flushed {
        /// Machine name
        machine: String,
    },

    /// The machine's task panicked.
    #[error("{machine} panicked")]
    Panicked {
        /// Machine name
        machine: String,
    },
}

impl WorkflowError {
    /// Name of the machine that failed.
    pub fn machine(&self) -> &str {
        match self {
            WorkflowError::Aborted { machine, .. }
            | WorkflowError::InvalidTrigger { machine, .. }
            | WorkflowError::Flushed { machine }
            | WorkflowError::Panicked { machine } => machine,
        }
    }
}
