//! Per-Device Sequential Executor
//!
//! Each physical device (or device aspect, such as a robot arm) owns one executor. Workflows are
//! queued FIFO and run one at a time by a single consumer task, so two workflows never drive the
//! same device at once.
//!
//! # Design
//!
//! - The queue is a `parking_lot::Mutex<VecDeque>` paired with a `tokio::sync::Notify`.
//! - The consumer pops one entry, runs the machine in its own spawned task and awaits it before
//!   popping the next. A panicking workflow surfaces as a `JoinError`, is logged, and the
//!   consumer carries on with the next entry.
//! - Completion is signalled on an optional oneshot, whatever the outcome.
//! - Disabled executors flush queued machines instead of running them, so every queued caller
//!   still gets an answer.
//! - [`StateMachineExecutor::stop`] waits a bounded time for the consumer, then aborts it and
//!   answers the in-flight caller with [`WorkflowError::Flushed`].
//!
//! # Example
//!
//! ```no_run
//! # use lab_orchestrator::executor::StateMachineExecutor;
//! # use lab_orchestrator::state_machine::ExecutableMachine;
//! # async fn demo(machine: impl ExecutableMachine + 'static) -> anyhow::Result<()> {
//! let executor = StateMachineExecutor::new("Sealer");
//! executor.start();
//! let done = executor.submit(machine);
//! done.await??;
//! executor.stop().await;
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::state_machine::{ExecutableMachine, MachineHandle, MachinePhase, WorkflowError};

/// Receives the outcome of a queued workflow.
pub type Completion = oneshot::Receiver<Result<(), WorkflowError>>;

/// Sending half of a [`Completion`].
pub type CompletionSender = oneshot::Sender<Result<(), WorkflowError>>;

/// Coarse executor status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutorStatus {
    /// Nothing running or queued
    Idle,
    /// A workflow is running or queued
    Running,
    /// The running workflow waits for an error resolution
    InError,
    /// Queued workflows are flushed instead of run
    Disabled,
}

/// Status snapshot for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorInfo {
    /// Coarse status
    pub status: ExecutorStatus,
    /// Name of the workflow in progress
    pub in_progress: Option<String>,
    /// Workflows waiting in the queue
    pub queued: usize,
    /// Workflows left before the executor is idle; infinite while disabled or in error
    pub time_to_idle: f64,
}

struct QueueEntry {
    machine: Box<dyn ExecutableMachine>,
    done: Option<CompletionSender>,
}

#[derive(Default)]
struct ExecutorState {
    queue: VecDeque<QueueEntry>,
    current: Option<MachineHandle>,
    current_task: Option<AbortHandle>,
    current_done: Option<CompletionSender>,
}

struct Shared {
    name: String,
    state: Mutex<ExecutorState>,
    wake: Notify,
    disabled: AtomicBool,
}

struct Consumer {
    task: JoinHandle<()>,
    stop: CancellationToken,
}

/// Runs queued workflows for one device, strictly one at a time.
pub struct StateMachineExecutor {
    shared: Arc<Shared>,
    consumer: Mutex<Option<Consumer>>,
    shutdown_timeout: Duration,
}

impl StateMachineExecutor {
    /// Create a stopped executor with the default shutdown timeout.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, &ExecutorConfig::default())
    }

    /// Create a stopped executor using `config`.
    pub fn with_config(name: impl Into<String>, config: &ExecutorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(ExecutorState::default()),
                wake: Notify::new(),
                disabled: AtomicBool::new(false),
            }),
            consumer: Mutex::new(None),
            shutdown_timeout: Duration::from_millis(config.shutdown_timeout_ms),
        }
    }

    /// Executor name, usually the device name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Spawn the consumer task. Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut consumer = self.consumer.lock();
        if consumer.as_ref().is_some_and(|c| !c.task.is_finished()) {
            warn!(executor = %self.shared.name, "Executor already running");
            return;
        }
        let stop = CancellationToken::new();
        let task = tokio::spawn(Shared::run(self.shared.clone(), stop.clone()));
        *consumer = Some(Consumer { task, stop });
    }

    /// Stop the consumer and flush whatever is still queued.
    ///
    /// The in-flight workflow is asked to flush. If the consumer has not finished within the
    /// configured shutdown timeout, it and the workflow task are aborted.
    pub async fn stop(&self) {
        let consumer = self.consumer.lock().take();
        if let Some(Consumer { mut task, stop }) = consumer {
            stop.cancel();
            if let Some(current) = self.shared.state.lock().current.clone() {
                current.flush();
            }
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(executor = %self.shared.name, error = %e, "Executor task failed"),
                Err(_) => {
                    warn!(
                        executor = %self.shared.name,
                        timeout_ms = self.shutdown_timeout.as_millis() as u64,
                        "Executor did not stop in time, aborting"
                    );
                    task.abort();
                    let (current, done) = {
                        let mut state = self.shared.state.lock();
                        if let Some(machine_task) = state.current_task.take() {
                            machine_task.abort();
                        }
                        (state.current.take(), state.current_done.take())
                    };
                    if let (Some(current), Some(done)) = (current, done) {
                        let _ = done.send(Err(WorkflowError::Flushed {
                            machine: current.name().to_string(),
                        }));
                    }
                }
            }
        }

        let remaining: Vec<QueueEntry> = self.shared.state.lock().queue.drain(..).collect();
        for entry in remaining {
            Shared::flush_entry(&self.shared.name, entry).await;
        }
    }

    /// Queue `machine`; `done` receives its outcome.
    pub fn add_state_machine(&self, machine: Box<dyn ExecutableMachine>, done: Option<CompletionSender>) {
        debug!(executor = %self.shared.name, machine = %machine.name(), "Queued state machine");
        self.shared
            .state
            .lock()
            .queue
            .push_back(QueueEntry { machine, done });
        self.shared.wake.notify_one();
    }

    /// Queue `machine` and return a receiver for its outcome.
    pub fn submit<M>(&self, machine: M) -> Completion
    where
        M: ExecutableMachine + 'static,
    {
        let (done, completion) = oneshot::channel();
        self.add_state_machine(Box::new(machine), Some(done));
        completion
    }

    /// Drop all queued workflows and ask the in-flight one to flush.
    ///
    /// Dropped workflows complete with [`WorkflowError::Flushed`].
    pub fn flush(&self) {
        let (dropped, current) = {
            let mut state = self.shared.state.lock();
            (state.queue.drain(..).collect::<Vec<_>>(), state.current.clone())
        };
        if !dropped.is_empty() {
            info!(executor = %self.shared.name, count = dropped.len(), "Dropped queued state machines");
        }
        for entry in dropped {
            if let Some(done) = entry.done {
                let _ = done.send(Err(WorkflowError::Flushed {
                    machine: entry.machine.name().to_string(),
                }));
            }
        }
        if let Some(current) = current {
            current.flush();
        }
    }

    /// Flush the in-flight workflow and every workflow queued from now on.
    pub fn disable(&self) {
        self.shared.disabled.store(true, Ordering::SeqCst);
        info!(executor = %self.shared.name, "Executor disabled");
        if let Some(current) = self.shared.state.lock().current.clone() {
            current.flush();
        }
        self.shared.wake.notify_one();
    }

    /// Resume running queued workflows.
    pub fn enable(&self) {
        self.shared.disabled.store(false, Ordering::SeqCst);
        info!(executor = %self.shared.name, "Executor enabled");
    }

    /// True while disabled.
    pub fn is_disabled(&self) -> bool {
        self.shared.disabled.load(Ordering::SeqCst)
    }

    /// True while a workflow runs or waits in the queue.
    pub fn is_busy(&self) -> bool {
        let state = self.shared.state.lock();
        state.current.is_some() || !state.queue.is_empty()
    }

    /// Number of queued workflows, excluding the one in progress.
    pub fn queue_depth(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Name of the workflow in progress.
    pub fn state_machine_in_progress(&self) -> Option<String> {
        self.shared
            .state
            .lock()
            .current
            .as_ref()
            .map(|h| h.name().to_string())
    }

    /// Status snapshot.
    pub fn executor_info(&self) -> ExecutorInfo {
        let state = self.shared.state.lock();
        let queued = state.queue.len();
        let in_progress = state.current.as_ref().map(|h| h.name().to_string());
        let in_error = state
            .current
            .as_ref()
            .is_some_and(|h| h.phase() == MachinePhase::AwaitingOperator);

        let status = if self.is_disabled() {
            ExecutorStatus::Disabled
        } else if in_error {
            ExecutorStatus::InError
        } else if in_progress.is_some() || queued > 0 {
            ExecutorStatus::Running
        } else {
            ExecutorStatus::Idle
        };
        let time_to_idle = match status {
            ExecutorStatus::Idle => 0.0,
            ExecutorStatus::Running => (queued + usize::from(in_progress.is_some())) as f64,
            ExecutorStatus::InError | ExecutorStatus::Disabled => f64::INFINITY,
        };
        ExecutorInfo {
            status,
            in_progress,
            queued,
            time_to_idle,
        }
    }
}

impl Shared {
    async fn run(self: Arc<Self>, stop: CancellationToken) {
        info!(executor = %self.name, "Executor started");
        loop {
            let entry = {
                let mut state = self.state.lock();
                let entry = state.queue.pop_front();
                if let Some(entry) = &entry {
                    state.current = Some(entry.machine.handle());
                }
                entry
            };

            let Some(entry) = entry else {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = self.wake.notified() => {}
                }
                continue;
            };

            if stop.is_cancelled() {
                let mut state = self.state.lock();
                state.current = None;
                state.queue.push_front(entry);
                break;
            }
            self.execute(entry).await;
        }
        info!(executor = %self.name, "Executor stopped");
    }

    async fn execute(&self, entry: QueueEntry) {
        let QueueEntry { mut machine, mut done } = entry;
        let machine_name = machine.name().to_string();

        let result = if self.disabled.load(Ordering::SeqCst) {
            Err(machine.flush().await)
        } else {
            debug!(executor = %self.name, machine = %machine_name, "Running state machine");
            let task = tokio::spawn(async move { machine.start().await });
            {
                let mut state = self.state.lock();
                state.current_task = Some(task.abort_handle());
                // answered by `stop` if the consumer is aborted mid-run
                state.current_done = done.take();
            }
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    error!(
                        executor = %self.name,
                        machine = %machine_name,
                        error = %e,
                        "State machine task failed"
                    );
                    Err(WorkflowError::Panicked {
                        machine: machine_name.clone(),
                    })
                }
            }
        };

        let done = {
            let mut state = self.state.lock();
            state.current = None;
            state.current_task = None;
            state.current_done.take().or(done)
        };
        if let Err(e) = &result {
            debug!(executor = %self.name, machine = %machine_name, error = %e, "State machine failed");
        }
        if let Some(done) = done {
            let _ = done.send(result);
        }
    }

    async fn flush_entry(name: &str, entry: QueueEntry) {
        let QueueEntry { mut machine, done } = entry;
        debug!(executor = %name, machine = %machine.name(), "Flushing queued state machine");
        let err = machine.flush().await;
        if let Some(done) = done {
            let _ = done.send(Err(err));
        }
    }
}

impl Drop for StateMachineExecutor {
    fn drop(&mut self) {
        if let Some(consumer) = self.consumer.get_mut().take() {
            consumer.stop.cancel();
            consumer.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{Actions, RetryPolicy, StateMachine, TransitionTable, Trigger};
    use tokio::sync::watch;
    use tracing_test::traced_test;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Step {
        Idle,
        Run,
        RunError,
        Done,
        Aborted,
    }

    type Gate = StateMachine<watch::Receiver<bool>, Step, Trigger>;

    /// Machine whose only step blocks until released.
    fn gate(name: &str) -> (Gate, watch::Sender<bool>) {
        let table = TransitionTable::builder(Step::Idle, Step::Done, Step::Aborted)
            .permit(Step::Idle, Trigger::Success, Step::Run)
            .step(Step::Run, Step::Done, Step::RunError)
            .build()
            .expect("valid table");
        let actions = Actions::new().on_entry(Step::Run, |release: Arc<watch::Receiver<bool>>| async move {
            let mut release = (*release).clone();
            let _ = release.wait_for(|r| *r).await;
            anyhow::Ok(Trigger::Success)
        });
        let (tx, rx) = watch::channel(false);
        let machine = StateMachine::new(
            name,
            Arc::new(table),
            actions,
            Arc::new(rx),
            Arc::new(RetryPolicy::never()),
        )
        .expect("complete actions");
        (machine, tx)
    }

    #[tokio::test]
    async fn test_busy_and_queue_depth() {
        let executor = StateMachineExecutor::new("Sealer");
        executor.start();
        let (first, release_first) = gate("first");
        let (second, release_second) = gate("second");
        let first_done = executor.submit(first);
        let second_done = executor.submit(second);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(executor.is_busy());
        assert_eq!(executor.queue_depth(), 1);
        assert_eq!(executor.state_machine_in_progress().as_deref(), Some("first"));
        let info = executor.executor_info();
        assert_eq!(info.status, ExecutorStatus::Running);
        assert_eq!(info.time_to_idle, 2.0);

        release_first.send_replace(true);
        first_done.await.expect("completion").expect("success");
        release_second.send_replace(true);
        second_done.await.expect("completion").expect("success");
        assert!(!executor.is_busy());
        assert_eq!(executor.executor_info().status, ExecutorStatus::Idle);
        executor.stop().await;
    }

    #[tokio::test]
    async fn test_flush_drops_queued_and_aborts_in_flight() {
        let executor = StateMachineExecutor::new("Sealer");
        executor.start();
        let (first, release_first) = gate("first");
        let (second, _release_second) = gate("second");
        let first_done = executor.submit(first);
        let second_done = executor.submit(second);
        tokio::time::sleep(Duration::from_millis(20)).await;

        executor.flush();
        assert_eq!(
            second_done.await.expect("completion"),
            Err(WorkflowError::Flushed {
                machine: "second".into()
            })
        );
        // the running step is not interrupted; the machine aborts once it returns
        release_first.send_replace(true);
        assert!(matches!(
            first_done.await.expect("completion"),
            Err(WorkflowError::Aborted { .. })
        ));
        executor.stop().await;
    }

    #[tokio::test]
    async fn test_disabled_executor_flushes_instead_of_running() {
        let executor = StateMachineExecutor::new("Sealer");
        executor.disable();
        executor.start();
        let (machine, _release) = gate("never runs");
        let done = executor.submit(machine);
        assert!(matches!(
            done.await.expect("completion"),
            Err(WorkflowError::Flushed { .. })
        ));
        assert_eq!(executor.executor_info().status, ExecutorStatus::Disabled);

        executor.enable();
        let (machine, release) = gate("runs");
        release.send_replace(true);
        executor.submit(machine).await.expect("completion").expect("success");
        executor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_flushes_remaining_queue() {
        let executor = StateMachineExecutor::new("Sealer");
        let (machine, _release) = gate("queued");
        let done = executor.submit(machine);
        // never started: stop drains the queue
        executor.stop().await;
        assert!(matches!(
            done.await.expect("completion"),
            Err(WorkflowError::Flushed { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_aborts_stuck_machine_after_timeout() {
        let config = ExecutorConfig {
            shutdown_timeout_ms: 50,
        };
        let executor = StateMachineExecutor::with_config("Centrifuge", &config);
        executor.start();
        // the step never returns, so the flush request is never observed
        let (machine, _release) = gate("stuck");
        let done = executor.submit(machine);
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(1), executor.stop())
            .await
            .expect("stop is bounded");
        assert_eq!(
            done.await.expect("completion"),
            Err(WorkflowError::Flushed {
                machine: "stuck".into()
            })
        );
        assert!(!executor.is_busy());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_panicking_machine_does_not_stop_consumer() {
        let table = TransitionTable::builder(Step::Idle, Step::Done, Step::Aborted)
            .permit(Step::Idle, Trigger::Success, Step::Run)
            .step(Step::Run, Step::Done, Step::RunError)
            .build()
            .expect("valid table");
        let actions = Actions::new().on_entry(Step::Run, |crash: Arc<bool>| async move {
            assert!(!*crash, "gripper driver crashed");
            anyhow::Ok(Trigger::Success)
        });
        let machine = StateMachine::new(
            "crashes",
            Arc::new(table),
            actions,
            Arc::new(true),
            Arc::new(RetryPolicy::never()),
        )
        .expect("complete actions");

        let executor = StateMachineExecutor::new("Robot");
        executor.start();
        assert_eq!(
            executor.submit(machine).await.expect("completion"),
            Err(WorkflowError::Panicked {
                machine: "crashes".into()
            })
        );
        assert!(logs_contain("State machine task failed"));

        let (next, release) = gate("next");
        release.send_replace(true);
        executor.submit(next).await.expect("completion").expect("success");
        executor.stop().await;
    }
}
