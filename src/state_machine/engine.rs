//! The workflow engine.
//!
//! [`StateMachine::start`] drives a table from its start state to the end or abort state. Each
//! working state runs its entry action; the trigger the action returns selects the next state.
//! An action that returns `Err` records the error and fires Fail. Error states hand the last
//! error to the [`ErrorReporter`] and wait for a [`Resolution`].
//!
//! Flushing ([`MachineHandle::flush`]) is cooperative. It never interrupts a running entry
//! action; the next trigger is replaced by Abort wherever the current state permits it, and a
//! pending operator prompt is cancelled with Abort.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::recovery::{ErrorReport, ErrorReporter, Resolution};
use super::table::TransitionTable;
use super::{Label, TableError, WorkflowError, WorkflowTrigger};

/// Async entry action: receives the workflow context and returns the next trigger.
pub type EntryAction<C, T> = Arc<dyn Fn(Arc<C>) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

/// Cleanup run when a workflow reaches its abort state.
pub type AbortHook<C> = Arc<dyn Fn(Arc<C>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Entry actions keyed by state, plus an optional abort hook.
pub struct Actions<C, S, T> {
    entries: HashMap<S, EntryAction<C, T>>,
    on_abort: Option<AbortHook<C>>,
}

impl<C, S, T> Clone for Actions<C, S, T>
where
    S: Label,
{
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            on_abort: self.on_abort.clone(),
        }
    }
}

impl<C, S: Label, T> Default for Actions<C, S, T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            on_abort: None,
        }
    }
}

impl<C, S, T> Actions<C, S, T>
where
    C: Send + Sync + 'static,
    S: Label,
    T: WorkflowTrigger,
{
    /// Empty action set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the entry action of `state`.
    #[must_use]
    pub fn on_entry<F, Fut>(mut self, state: S, action: F) -> Self
    where
        F: Fn(Arc<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.entries
            .insert(state, Arc::new(move |ctx| action(ctx).boxed()));
        self
    }

    /// Register cleanup to run when the workflow aborts.
    #[must_use]
    pub fn on_abort<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_abort = Some(Arc::new(move |ctx| hook(ctx).boxed()));
        self
    }
}

/// Observable lifecycle of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachinePhase {
    /// Created, not started
    Idle,
    /// Running entry actions
    Running,
    /// Blocked in an error state until a resolution arrives
    AwaitingOperator,
    /// Reached the end state
    Completed,
    /// Reached the abort state or failed
    Aborted,
}

/// Cloneable handle to a machine that may be running on another task.
#[derive(Debug, Clone)]
pub struct MachineHandle {
    id: Uuid,
    name: Arc<str>,
    cancel: CancellationToken,
    phase: watch::Receiver<MachinePhase>,
}

impl MachineHandle {
    /// Unique id of this machine instance.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Machine name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the machine to abort at its next decision point.
    pub fn flush(&self) {
        self.cancel.cancel();
    }

    /// True once a flush was requested.
    pub fn is_flushed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Current phase.
    pub fn phase(&self) -> MachinePhase {
        *self.phase.borrow()
    }

    /// Watch phase changes.
    pub fn subscribe(&self) -> watch::Receiver<MachinePhase> {
        self.phase.clone()
    }
}

/// Type-erased machine as queued on an executor.
#[async_trait]
pub trait ExecutableMachine: Send {
    /// Machine name for logs and status.
    fn name(&self) -> &str;

    /// Handle for flushing and phase observation.
    fn handle(&self) -> MachineHandle;

    /// Run to completion.
    async fn start(&mut self) -> Result<(), WorkflowError>;

    /// Abort without running: execute the abort hook and report [`WorkflowError::Flushed`].
    async fn flush(&mut self) -> WorkflowError;
}

/// A workflow instance: table, actions and context, plus the run cursor.
pub struct StateMachine<C, S, T> {
    id: Uuid,
    name: String,
    table: Arc<TransitionTable<S, T>>,
    actions: Actions<C, S, T>,
    context: Arc<C>,
    reporter: Arc<dyn ErrorReporter>,
    current: S,
    last_error: Option<String>,
    attempts: HashMap<S, u32>,
    cancel: CancellationToken,
    phase: watch::Sender<MachinePhase>,
    active: Duration,
}

impl<C, S, T> StateMachine<C, S, T>
where
    C: Send + Sync + 'static,
    S: Label,
    T: WorkflowTrigger,
{
    /// Compose a machine.
    ///
    /// # Errors
    ///
    /// Fails when a step state of `table` has no entry action, or when `actions` contains an
    /// action for a state that is not a step.
    pub fn new(
        name: impl Into<String>,
        table: Arc<TransitionTable<S, T>>,
        actions: Actions<C, S, T>,
        context: Arc<C>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Result<Self, TableError> {
        for step in table.steps() {
            if !actions.entries.contains_key(&step) {
                return Err(TableError::MissingAction(format!("{step:?}")));
            }
        }
        for state in actions.entries.keys() {
            if !table.is_step(*state) {
                return Err(TableError::UnexpectedAction(format!("{state:?}")));
            }
        }

        let (phase, _) = watch::channel(MachinePhase::Idle);
        Ok(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            current: table.start(),
            table,
            actions,
            context,
            reporter,
            last_error: None,
            attempts: HashMap::new(),
            cancel: CancellationToken::new(),
            phase,
            active: Duration::ZERO,
        })
    }

    /// Machine name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle usable from other tasks.
    pub fn handle(&self) -> MachineHandle {
        MachineHandle {
            id: self.id,
            name: Arc::from(self.name.as_str()),
            cancel: self.cancel.clone(),
            phase: self.phase.subscribe(),
        }
    }

    /// State the machine is in.
    pub fn current_state(&self) -> S {
        self.current
    }

    /// Last error recorded by a failing entry action.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Shared workflow context.
    pub fn context(&self) -> &Arc<C> {
        &self.context
    }

    /// Time spent running, excluding time waiting on an operator.
    pub fn active_time(&self) -> Duration {
        self.active
    }

    /// Run from the start state until the end or abort state.
    ///
    /// # Errors
    ///
    /// [`WorkflowError::Flushed`] without running any step when the machine was flushed first,
    /// [`WorkflowError::Aborted`] with the last recorded error when the abort state is reached,
    /// [`WorkflowError::InvalidTrigger`] when an action or resolution fires a trigger the current
    /// state does not permit.
    pub async fn start(&mut self) -> Result<(), WorkflowError> {
        if self.cancel.is_cancelled() {
            return Err(self.flush().await);
        }
        self.current = self.table.start();
        self.last_error = None;
        self.attempts.clear();
        self.phase.send_replace(MachinePhase::Running);
        info!(machine = %self.name, id = %self.id, "Starting state machine");

        let mut trigger = self.table.start_trigger();
        let mut since = Instant::now();
        let result = loop {
            if self.cancel.is_cancelled()
                && trigger != T::ABORT
                && self.table.permits(self.current, T::ABORT)
            {
                debug!(machine = %self.name, state = ?self.current, replaced = ?trigger, "Flush requested, aborting");
                trigger = T::ABORT;
            }

            let Some(transition) = self.table.next(self.current, trigger) else {
                error!(
                    machine = %self.name,
                    state = ?self.current,
                    ?trigger,
                    permitted = ?self.table.permitted_triggers(self.current),
                    "Trigger not permitted in current state"
                );
                break Err(WorkflowError::InvalidTrigger {
                    machine: self.name.clone(),
                    state: format!("{:?}", self.current),
                    trigger: format!("{trigger:?}"),
                });
            };

            if !transition.reentry {
                debug!(machine = %self.name, state = ?self.current, ?trigger, "Leaving state");
                self.current = transition.target;
                debug!(machine = %self.name, state = ?self.current, "Entering state");
            }
            let state = self.current;

            if state == self.table.end() {
                break Ok(());
            }
            if state == self.table.abort() {
                if let Some(hook) = self.actions.on_abort.clone() {
                    hook(self.context.clone()).await;
                }
                break Err(WorkflowError::Aborted {
                    machine: self.name.clone(),
                    reason: self.last_error.clone(),
                });
            }

            if let Some(spec) = self.table.error_state(state) {
                self.active += since.elapsed();
                let resolution = self.await_resolution(state, spec.ignore.is_some()).await;
                since = Instant::now();
                trigger = match resolution {
                    Resolution::Retry => T::RETRY,
                    Resolution::Ignore => T::IGNORE,
                    Resolution::Abort => T::ABORT,
                };
                continue;
            }

            trigger = match self.actions.entries.get(&state).cloned() {
                Some(action) => match action(self.context.clone()).await {
                    Ok(next) => next,
                    Err(e) => {
                        let message = format!("{e:#}");
                        warn!(machine = %self.name, state = ?state, error = %message, "Step failed");
                        self.last_error = Some(message);
                        T::FAIL
                    }
                },
                // only the start state can be re-entered without an action
                None => T::SUCCESS,
            };
        };
        self.active += since.elapsed();

        match &result {
            Ok(()) => {
                self.phase.send_replace(MachinePhase::Completed);
                info!(
                    machine = %self.name,
                    elapsed_ms = self.active.as_millis() as u64,
                    "State machine completed"
                );
            }
            Err(e) => {
                self.phase.send_replace(MachinePhase::Aborted);
                warn!(
                    machine = %self.name,
                    elapsed_ms = self.active.as_millis() as u64,
                    error = %e,
                    "State machine did not complete"
                );
            }
        }
        result
    }

    /// Abort without running any step.
    pub async fn flush(&mut self) -> WorkflowError {
        self.cancel.cancel();
        self.current = self.table.abort();
        if let Some(hook) = self.actions.on_abort.clone() {
            hook(self.context.clone()).await;
        }
        self.phase.send_replace(MachinePhase::Aborted);
        info!(machine = %self.name, "State machine flushed before start");
        WorkflowError::Flushed {
            machine: self.name.clone(),
        }
    }

    async fn await_resolution(&mut self, state: S, allow_ignore: bool) -> Resolution {
        let mut options = vec![Resolution::Retry];
        if allow_ignore {
            options.push(Resolution::Ignore);
        }
        options.push(Resolution::Abort);

        let attempt = self.attempts.entry(state).or_insert(0);
        *attempt += 1;
        let report = ErrorReport::new(
            self.id,
            &self.name,
            format!("{state:?}"),
            self.last_error.clone().unwrap_or_else(|| "unknown error".to_string()),
            options,
        )
        .with_attempt(*attempt);
        warn!(machine = %self.name, state = ?state, error = %report.message, "Awaiting error resolution");
        self.phase.send_replace(MachinePhase::AwaitingOperator);

        let resolution = tokio::select! {
            _ = self.cancel.cancelled() => Resolution::Abort,
            resolution = self.reporter.report(report) => resolution,
        };

        self.phase.send_replace(MachinePhase::Running);
        info!(machine = %self.name, state = ?state, ?resolution, "Error resolved");
        resolution
    }
}

#[async_trait]
impl<C, S, T> ExecutableMachine for StateMachine<C, S, T>
where
    C: Send + Sync + 'static,
    S: Label,
    T: WorkflowTrigger,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self) -> MachineHandle {
        StateMachine::handle(self)
    }

    async fn start(&mut self) -> Result<(), WorkflowError> {
        StateMachine::start(self).await
    }

    async fn flush(&mut self) -> WorkflowError {
        StateMachine::flush(self).await
    }
}
