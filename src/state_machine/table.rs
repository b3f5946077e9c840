//! Explicit transition tables.
//!
//! A table maps `(state, trigger)` to a [`Transition`]. Three states are distinguished: the
//! start state, the end state (normal completion) and the abort state (forced completion).
//!
//! Most tables are assembled from [`TableBuilder::step`]: a working state that moves on with
//! Success, drops into its error state on Fail and terminates on Abort. The error state loops
//! back on Retry, terminates on Abort and, for [`TableBuilder::step_with_ignore`], skips ahead
//! on Ignore.
//!
//! ```
//! use lab_orchestrator::state_machine::{Trigger, TransitionTable};
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum Seal { Idle, ApplySeal, ApplySealError, Done, Aborted }
//!
//! let table = TransitionTable::<Seal, Trigger>::builder(Seal::Idle, Seal::Done, Seal::Aborted)
//!     .start_trigger(Trigger::Execute)
//!     .permit(Seal::Idle, Trigger::Execute, Seal::ApplySeal)
//!     .step(Seal::ApplySeal, Seal::Done, Seal::ApplySealError)
//!     .build()
//!     .expect("valid table");
//! assert!(table.permits(Seal::ApplySealError, Trigger::Retry));
//! ```

use std::collections::{HashMap, HashSet, VecDeque};

use super::{Label, TableError, WorkflowTrigger};

/// Target of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<S> {
    /// State entered
    pub target: S,
    /// Self-loop that re-runs the entry action without counting as a state change
    pub reentry: bool,
}

/// Where an error state leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorState<S> {
    /// State re-entered on Retry
    pub retry: S,
    /// State entered on Ignore, when ignoring is allowed
    pub ignore: Option<S>,
}

/// Validated, immutable transition table.
#[derive(Debug, Clone)]
pub struct TransitionTable<S, T> {
    start: S,
    end: S,
    abort: S,
    start_trigger: T,
    transitions: HashMap<(S, T), Transition<S>>,
    error_states: HashMap<S, ErrorState<S>>,
    steps: HashSet<S>,
}

impl<S: Label, T: WorkflowTrigger> TransitionTable<S, T> {
    /// Start building a table.
    pub fn builder(start: S, end: S, abort: S) -> TableBuilder<S, T> {
        TableBuilder {
            start,
            end,
            abort,
            start_trigger: T::SUCCESS,
            transitions: HashMap::new(),
            order: Vec::new(),
            error_states: HashMap::new(),
            steps: HashSet::new(),
            errors: Vec::new(),
        }
    }

    /// Initial state.
    pub fn start(&self) -> S {
        self.start
    }

    /// Normal completion state.
    pub fn end(&self) -> S {
        self.end
    }

    /// Forced completion state.
    pub fn abort(&self) -> S {
        self.abort
    }

    /// Trigger fired from the start state to begin a run.
    pub fn start_trigger(&self) -> T {
        self.start_trigger
    }

    /// Transition for `trigger` in `state`, if permitted.
    pub fn next(&self, state: S, trigger: T) -> Option<Transition<S>> {
        self.transitions.get(&(state, trigger)).copied()
    }

    /// True when `state` accepts `trigger`.
    pub fn permits(&self, state: S, trigger: T) -> bool {
        self.transitions.contains_key(&(state, trigger))
    }

    /// Triggers accepted in `state`.
    pub fn permitted_triggers(&self, state: S) -> Vec<T> {
        self.transitions
            .keys()
            .filter(|(s, _)| *s == state)
            .map(|(_, t)| *t)
            .collect()
    }

    /// Error handling for `state` if it is an error state.
    pub fn error_state(&self, state: S) -> Option<ErrorState<S>> {
        self.error_states.get(&state).copied()
    }

    /// True for states that carry an entry action.
    pub fn is_step(&self, state: S) -> bool {
        self.steps.contains(&state)
    }

    /// States that carry an entry action.
    pub fn steps(&self) -> impl Iterator<Item = S> + '_ {
        self.steps.iter().copied()
    }

    /// End or abort state.
    pub fn is_terminal(&self, state: S) -> bool {
        state == self.end || state == self.abort
    }
}

/// Accumulates transitions and validates them in [`TableBuilder::build`].
#[derive(Debug)]
pub struct TableBuilder<S, T> {
    start: S,
    end: S,
    abort: S,
    start_trigger: T,
    transitions: HashMap<(S, T), Transition<S>>,
    order: Vec<S>,
    error_states: HashMap<S, ErrorState<S>>,
    steps: HashSet<S>,
    errors: Vec<TableError>,
}

impl<S: Label, T: WorkflowTrigger> TableBuilder<S, T> {
    /// Trigger fired from the start state; defaults to Success.
    #[must_use]
    pub fn start_trigger(mut self, trigger: T) -> Self {
        self.start_trigger = trigger;
        self
    }

    /// Permit `trigger` in `from`, leading to `to`.
    #[must_use]
    pub fn permit(mut self, from: S, trigger: T, to: S) -> Self {
        self.insert(from, trigger, Transition {
            target: to,
            reentry: false,
        });
        self
    }

    /// Permit `trigger` to re-enter `state`, re-running its entry action.
    #[must_use]
    pub fn permit_reentry(mut self, state: S, trigger: T) -> Self {
        self.insert(state, trigger, Transition {
            target: state,
            reentry: true,
        });
        self
    }

    /// Declare that `state` has an entry action, without adding transitions.
    #[must_use]
    pub fn action(mut self, state: S) -> Self {
        self.steps.insert(state);
        self
    }

    /// Working state: Success goes to `next`, Fail to `error`, Abort terminates.
    ///
    /// `error` is configured to accept Retry and Abort.
    #[must_use]
    pub fn step(self, state: S, next: S, error: S) -> Self {
        self.configure_step(state, next, error, false)
    }

    /// Like [`Self::step`], but the error state also accepts Ignore, continuing at `next`.
    #[must_use]
    pub fn step_with_ignore(self, state: S, next: S, error: S) -> Self {
        self.configure_step(state, next, error, true)
    }

    /// Error state that loops back to `retry` and optionally skips ahead to `ignore`.
    #[must_use]
    pub fn error_state(mut self, state: S, retry: S, ignore: Option<S>) -> Self {
        let abort = self.abort;
        self.error_states.insert(state, ErrorState { retry, ignore });
        self = self.permit(state, T::RETRY, retry).permit(state, T::ABORT, abort);
        if let Some(ignore) = ignore {
            self = self.permit(state, T::IGNORE, ignore);
        }
        self
    }

    fn configure_step(mut self, state: S, next: S, error: S, ignore: bool) -> Self {
        let abort = self.abort;
        self.steps.insert(state);
        self.permit(state, T::SUCCESS, next)
            .permit(state, T::FAIL, error)
            .permit(state, T::ABORT, abort)
            .error_state(error, state, ignore.then_some(next))
    }

    fn insert(&mut self, state: S, trigger: T, transition: Transition<S>) {
        if self.transitions.insert((state, trigger), transition).is_some() {
            self.errors.push(TableError::DuplicateTransition {
                state: format!("{state:?}"),
                trigger: format!("{trigger:?}"),
            });
        }
        if !self.order.contains(&state) {
            self.order.push(state);
        }
    }

    /// Validate and freeze the table.
    ///
    /// # Errors
    ///
    /// Returns the first problem found: duplicate transitions, a start state that does not
    /// accept the start trigger, terminal states with outgoing transitions, and reachable states
    /// that are dead ends or have neither an entry action nor an error handler.
    pub fn build(mut self) -> Result<TransitionTable<S, T>, TableError> {
        if !self.errors.is_empty() {
            return Err(self.errors.remove(0));
        }

        for terminal in [self.end, self.abort] {
            if self.order.contains(&terminal) {
                return Err(TableError::TerminalHasTransitions(format!("{terminal:?}")));
            }
        }

        if !self.transitions.contains_key(&(self.start, self.start_trigger)) {
            return Err(TableError::MissingStartTransition {
                state: format!("{:?}", self.start),
                trigger: format!("{:?}", self.start_trigger),
            });
        }

        // breadth-first over declared transitions, in declaration order of source states
        let mut reachable = HashSet::from([self.start]);
        let mut queue = VecDeque::from([self.start]);
        while let Some(state) = queue.pop_front() {
            if state == self.end || state == self.abort {
                continue;
            }
            if !self.order.contains(&state) {
                return Err(TableError::DeadEnd(format!("{state:?}")));
            }
            if state != self.start
                && !self.steps.contains(&state)
                && !self.error_states.contains_key(&state)
            {
                return Err(TableError::NoEntry(format!("{state:?}")));
            }
            for ((from, _), transition) in &self.transitions {
                if *from == state && reachable.insert(transition.target) {
                    queue.push_back(transition.target);
                }
            }
        }

        Ok(TransitionTable {
            start: self.start,
            end: self.end,
            abort: self.abort,
            start_trigger: self.start_trigger,
            transitions: self.transitions,
            error_states: self.error_states,
            steps: self.steps,
        })
    }
}
