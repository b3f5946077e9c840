//! Error resolution for workflow error states.
//!
//! When a step fails, the engine parks in the step's error state and asks an [`ErrorReporter`]
//! how to continue. Two reporters ship with the crate:
//!
//! - [`RetryPolicy`]: automated resolution, retrying a failing step a bounded number of times
//!   before aborting.
//! - [`OperatorChannel`]: forwards each report over an mpsc channel to an operator surface and
//!   waits for the answer on a oneshot.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

/// Operator choices for a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    /// Run the failed step again
    Retry,
    /// Continue as if the step succeeded
    Ignore,
    /// Terminate the workflow
    Abort,
}

/// A failed step awaiting resolution.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    /// Id of the machine instance that failed
    pub machine_id: Uuid,
    /// Machine name
    pub machine: String,
    /// Error state the machine is parked in
    pub state: String,
    /// Last error recorded by the failing step
    pub message: String,
    /// Resolutions the error state accepts
    pub options: Vec<Resolution>,
    /// How often this error state was entered during the current run, starting at 1
    pub attempt: u32,
    /// When the error was raised
    pub raised_at: DateTime<Utc>,
}

impl ErrorReport {
    /// Build a report timestamped now.
    pub fn new(
        machine_id: Uuid,
        machine: impl Into<String>,
        state: impl Into<String>,
        message: impl Into<String>,
        options: Vec<Resolution>,
    ) -> Self {
        Self {
            machine_id,
            machine: machine.into(),
            state: state.into(),
            message: message.into(),
            options,
            attempt: 1,
            raised_at: Utc::now(),
        }
    }

    /// Set the per-run attempt number.
    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// True when `resolution` is among the offered options.
    pub fn offers(&self, resolution: Resolution) -> bool {
        self.options.contains(&resolution)
    }
}

/// Collaborator that decides how a failed step continues.
///
/// Implementations may block for as long as they need; the engine races the report against a
/// flush request.
#[async_trait]
pub trait ErrorReporter: Send + Sync {
    /// Present `report` and return the chosen resolution.
    async fn report(&self, report: ErrorReport) -> Resolution;
}

// =============================================================================
// RetryPolicy - automated resolution
// =============================================================================

/// Retries each failing step up to `max_retries` times, then aborts.
///
/// The policy keeps no state: the engine counts attempts per run and error state and passes
/// the count in [`ErrorReport::attempt`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries granted per run and error state.
    pub max_retries: u32,
    /// Delay before each retry.
    pub backoff_delay: Duration,
}

impl RetryPolicy {
    /// Policy retrying up to `max_retries` times without delay.
    pub fn new(max_retries: u32) -> Self {
        Self::with_backoff(max_retries, Duration::ZERO)
    }

    /// Policy retrying up to `max_retries` times, waiting `backoff_delay` before each retry.
    pub fn with_backoff(max_retries: u32, backoff_delay: Duration) -> Self {
        Self {
            max_retries,
            backoff_delay,
        }
    }

    /// Policy that aborts on the first failure.
    pub fn never() -> Self {
        Self::new(0)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_backoff(3, Duration::from_millis(100))
    }
}

#[async_trait]
impl ErrorReporter for RetryPolicy {
    async fn report(&self, report: ErrorReport) -> Resolution {
        let attempt = report.attempt;
        if attempt > self.max_retries || !report.offers(Resolution::Retry) {
            warn!(
                machine = %report.machine,
                state = %report.state,
                error = %report.message,
                attempts = attempt.saturating_sub(1),
                "Retries exhausted, aborting"
            );
            return Resolution::Abort;
        }

        debug!(
            machine = %report.machine,
            state = %report.state,
            attempt,
            max = self.max_retries,
            "Retrying failed step"
        );
        if !self.backoff_delay.is_zero() {
            sleep(self.backoff_delay).await;
        }
        Resolution::Retry
    }
}

// =============================================================================
// OperatorChannel - resolution by an external operator surface
// =============================================================================

/// A report travelling to the operator, with the channel for the answer.
#[derive(Debug)]
pub struct OperatorRequest {
    /// The failed step
    pub report: ErrorReport,
    respond_to: oneshot::Sender<Resolution>,
}

impl OperatorRequest {
    /// Answer the request. Answers to machines that went away are dropped.
    pub fn resolve(self, resolution: Resolution) {
        if self.respond_to.send(resolution).is_err() {
            debug!(machine = %self.report.machine, "Resolution arrived after the machine stopped waiting");
        }
    }
}

/// Reporter that forwards reports to an operator surface.
#[derive(Debug, Clone)]
pub struct OperatorChannel {
    tx: mpsc::Sender<OperatorRequest>,
}

/// Create an operator channel holding up to `capacity` pending reports.
pub fn operator_channel(capacity: usize) -> (OperatorChannel, mpsc::Receiver<OperatorRequest>) {
    let (tx, rx) = mpsc::channel(capacity);
    (OperatorChannel { tx }, rx)
}

#[async_trait]
impl ErrorReporter for OperatorChannel {
    async fn report(&self, report: ErrorReport) -> Resolution {
        let machine = report.machine.clone();
        let (respond_to, response) = oneshot::channel();
        if self
            .tx
            .send(OperatorRequest { report, respond_to })
            .await
            .is_err()
        {
            warn!(%machine, "No operator surface attached, aborting");
            return Resolution::Abort;
        }
        match response.await {
            Ok(resolution) => resolution,
            Err(_) => {
                warn!(%machine, "Operator dropped the request, aborting");
                Resolution::Abort
            }
        }
    }
}
