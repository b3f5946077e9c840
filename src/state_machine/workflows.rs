//! Workflows shipped with the orchestrator.
//!
//! Each workflow is a transition table plus an action set, composed onto a context that holds
//! the device it drives:
//!
//! | Workflow | Steps | Runs on |
//! |----------|-------|---------|
//! | [`command_workflow`] | Prepare, ExecuteCommand | the device executing a plate task |
//! | [`transfer_workflow`] | Prepare, Pick, Place | the robot making one hop |
//! | [`home_workflow`] | Connect, Home | any device, at startup |
//!
//! Every step gets an error state accepting Retry and Abort; a failed command may also be
//! ignored. Aborting any of them calls the device's `abort`.

use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::{debug, warn};

use super::engine::{Actions, StateMachine};
use super::recovery::ErrorReporter;
use super::table::TransitionTable;
use super::{TableError, Trigger};
use crate::devices::{DeviceInterface, PlacePoint, RobotInterface};
use crate::plate::{Parameter, PlateTask};

/// Connect and home the device unless it already is.
async fn ensure_ready<D>(device: &D) -> Result<Trigger>
where
    D: DeviceInterface + ?Sized,
{
    if !device.is_connected() {
        device.connect().await?;
    }
    if !device.is_homed() {
        device.home().await?;
    }
    Ok(Trigger::Success)
}

async fn abort_device<D>(device: &D)
where
    D: DeviceInterface + ?Sized,
{
    if let Err(e) = device.abort().await {
        warn!(device = %device.name(), error = %e, "Device abort failed");
    }
}

// =============================================================================
// Command workflow
// =============================================================================

/// States of [`CommandWorkflow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandState {
    /// Not started
    Idle,
    /// Connect and home if needed
    Prepare,
    /// Preparation failed
    PrepareError,
    /// Run the command
    ExecuteCommand,
    /// The command failed
    ExecuteCommandError,
    /// Command finished
    Done,
    /// Workflow aborted
    Aborted,
}

/// Context of [`CommandWorkflow`].
pub struct CommandContext<D: ?Sized> {
    /// Device running the command
    pub device: Arc<D>,
    /// Command name
    pub command: String,
    /// Command parameters
    pub parameters: Vec<Parameter>,
}

/// Runs one device command.
pub type CommandWorkflow<D> = StateMachine<CommandContext<D>, CommandState, Trigger>;

/// Transition table of [`CommandWorkflow`].
///
/// # Errors
///
/// Never fails for this table; the error is the table builder's validation result.
pub fn command_table() -> Result<TransitionTable<CommandState, Trigger>, TableError> {
    use CommandState::*;
    TransitionTable::builder(Idle, Done, Aborted)
        .start_trigger(Trigger::Execute)
        .permit(Idle, Trigger::Execute, Prepare)
        .step(Prepare, ExecuteCommand, PrepareError)
        .step_with_ignore(ExecuteCommand, Done, ExecuteCommandError)
        .build()
}

async fn execute_command<D>(ctx: Arc<CommandContext<D>>) -> Result<Trigger>
where
    D: DeviceInterface + ?Sized,
{
    debug!(device = %ctx.device.name(), command = %ctx.command, "Executing command");
    if !ctx.device.execute_command(&ctx.command, &ctx.parameters).await? {
        bail!("{} reported failure for {}", ctx.device.name(), ctx.command);
    }
    Ok(Trigger::Success)
}

/// Build a workflow that runs `task`'s command on `device`.
///
/// # Errors
///
/// Returns a [`TableError`] if the workflow definition is inconsistent.
pub fn command_workflow<D>(
    device: Arc<D>,
    task: &PlateTask,
    reporter: Arc<dyn ErrorReporter>,
) -> Result<CommandWorkflow<D>, TableError>
where
    D: DeviceInterface + ?Sized + 'static,
{
    let actions = Actions::new()
        .on_entry(CommandState::Prepare, |ctx: Arc<CommandContext<D>>| async move {
            ensure_ready(ctx.device.as_ref()).await
        })
        .on_entry(CommandState::ExecuteCommand, execute_command::<D>)
        .on_abort(|ctx: Arc<CommandContext<D>>| async move { abort_device(ctx.device.as_ref()).await });

    let name = format!("{}:{}", device.name(), task.command);
    let context = CommandContext {
        device,
        command: task.command.clone(),
        parameters: task.parameters.clone(),
    };
    StateMachine::new(name, Arc::new(command_table()?), actions, Arc::new(context), reporter)
}

// =============================================================================
// Transfer workflow
// =============================================================================

/// States of [`TransferWorkflow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    /// Not started
    Idle,
    /// Connect and home the robot if needed
    Prepare,
    /// Preparation failed
    PrepareError,
    /// Pick the plate at the source place
    Pick,
    /// Pick failed
    PickError,
    /// Place the plate at the target place
    Place,
    /// Place failed
    PlaceError,
    /// Plate delivered
    Done,
    /// Workflow aborted
    Aborted,
}

/// Context of [`TransferWorkflow`].
pub struct TransferContext<R: ?Sized> {
    /// Robot making the move
    pub robot: Arc<R>,
    /// Where the plate is picked
    pub from: PlacePoint,
    /// Where the plate is placed
    pub to: PlacePoint,
}

/// Carries one plate over one hop.
pub type TransferWorkflow<R> = StateMachine<TransferContext<R>, TransferState, Trigger>;

/// Transition table of [`TransferWorkflow`].
///
/// # Errors
///
/// Never fails for this table; the error is the table builder's validation result.
pub fn transfer_table() -> Result<TransitionTable<TransferState, Trigger>, TableError> {
    use TransferState::*;
    TransitionTable::builder(Idle, Done, Aborted)
        .start_trigger(Trigger::Execute)
        .permit(Idle, Trigger::Execute, Prepare)
        .step(Prepare, Pick, PrepareError)
        .step(Pick, Place, PickError)
        .step(Place, Done, PlaceError)
        .build()
}

/// Build a workflow that moves a plate from `from` to `to` with `robot`.
///
/// # Errors
///
/// Returns a [`TableError`] if the workflow definition is inconsistent.
pub fn transfer_workflow<R>(
    robot: Arc<R>,
    from: PlacePoint,
    to: PlacePoint,
    reporter: Arc<dyn ErrorReporter>,
) -> Result<TransferWorkflow<R>, TableError>
where
    R: RobotInterface + ?Sized + 'static,
{
    let actions = Actions::new()
        .on_entry(TransferState::Prepare, |ctx: Arc<TransferContext<R>>| async move {
            ensure_ready(ctx.robot.as_ref()).await
        })
        .on_entry(TransferState::Pick, |ctx: Arc<TransferContext<R>>| async move {
            ctx.robot.pick(&ctx.from).await?;
            anyhow::Ok(Trigger::Success)
        })
        .on_entry(TransferState::Place, |ctx: Arc<TransferContext<R>>| async move {
            ctx.robot.place(&ctx.to).await?;
            anyhow::Ok(Trigger::Success)
        })
        .on_abort(|ctx: Arc<TransferContext<R>>| async move { abort_device(ctx.robot.as_ref()).await });

    let name = format!("{}:{}->{}", robot.name(), from, to);
    let context = TransferContext { robot, from, to };
    StateMachine::new(name, Arc::new(transfer_table()?), actions, Arc::new(context), reporter)
}

// =============================================================================
// Home workflow
// =============================================================================

/// States of [`HomeWorkflow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HomeState {
    /// Not started
    Idle,
    /// Establish the connection
    Connect,
    /// Connection failed
    ConnectError,
    /// Home the device
    Home,
    /// Homing failed
    HomeError,
    /// Device ready
    Done,
    /// Workflow aborted
    Aborted,
}

/// Context of [`HomeWorkflow`].
pub struct HomeContext<D: ?Sized> {
    /// Device to home
    pub device: Arc<D>,
}

/// Connects and homes a device.
pub type HomeWorkflow<D> = StateMachine<HomeContext<D>, HomeState, Trigger>;

/// Transition table of [`HomeWorkflow`].
///
/// # Errors
///
/// Never fails for this table; the error is the table builder's validation result.
pub fn home_table() -> Result<TransitionTable<HomeState, Trigger>, TableError> {
    use HomeState::*;
    TransitionTable::builder(Idle, Done, Aborted)
        .start_trigger(Trigger::Execute)
        .permit(Idle, Trigger::Execute, Connect)
        .step(Connect, Home, ConnectError)
        .step(Home, Done, HomeError)
        .build()
}

/// Build a workflow that connects and homes `device`.
///
/// # Errors
///
/// Returns a [`TableError`] if the workflow definition is inconsistent.
pub fn home_workflow<D>(device: Arc<D>, reporter: Arc<dyn ErrorReporter>) -> Result<HomeWorkflow<D>, TableError>
where
    D: DeviceInterface + ?Sized + 'static,
{
    let actions = Actions::new()
        .on_entry(HomeState::Connect, |ctx: Arc<HomeContext<D>>| async move {
            if !ctx.device.is_connected() {
                ctx.device.connect().await?;
            }
            anyhow::Ok(Trigger::Success)
        })
        .on_entry(HomeState::Home, |ctx: Arc<HomeContext<D>>| async move {
            ctx.device.home().await?;
            anyhow::Ok(Trigger::Success)
        })
        .on_abort(|ctx: Arc<HomeContext<D>>| async move { abort_device(ctx.device.as_ref()).await });

    let name = format!("{}:Home", device.name());
    StateMachine::new(name, Arc::new(home_table()?), actions, Arc::new(HomeContext { device }), reporter)
}
