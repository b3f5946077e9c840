//! Simulated lab demo for lab_orchestrator.
//!
//! Builds a small simulated lab (input stacker, hitpicker, sealer, output stacker and one
//! robot), runs one worklist through it and prints the report.
//!
//! ```bash
//! lab_orchestrator run --sources 3 --destinations 2
//! lab_orchestrator run --worklist plan.json --fail-rate 0.1
//! RUST_LOG=lab_orchestrator=debug lab_orchestrator run
//! lab_orchestrator show-config
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lab_orchestrator::config::OrchestratorConfig;
use lab_orchestrator::devices::{DeviceManager, SimDevice, SimRobot, Station};
use lab_orchestrator::plate::{Plate, PlateLocation, PlateTask, Transfer, Worklist};
use lab_orchestrator::scheduler::{PlateScheduler, RobotScheduler};
use lab_orchestrator::state_machine::ErrorReporter;

#[derive(Debug, Parser)]
#[command(name = "lab_orchestrator", version, about = "Plate-transfer orchestration demo")]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "config/orchestrator.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one worklist through the simulated lab
    Run {
        /// Number of generated source plates
        #[arg(long, default_value_t = 3)]
        sources: usize,
        /// Number of generated destination plates
        #[arg(long, default_value_t = 2)]
        destinations: usize,
        /// Load the worklist from a JSON file instead of generating one
        #[arg(long)]
        worklist: Option<PathBuf>,
        /// Probability that a simulated command reports failure
        #[arg(long, default_value_t = 0.0)]
        fail_rate: f64,
        /// Simulated command duration in milliseconds
        #[arg(long, default_value_t = 200)]
        command_ms: u64,
        /// Give up after this many seconds
        #[arg(long, default_value_t = 120)]
        timeout_secs: u64,
    },
    /// Print the effective configuration as TOML
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = OrchestratorConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.application.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::ShowConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Run {
            sources,
            destinations,
            worklist,
            fail_rate,
            command_ms,
            timeout_secs,
        } => {
            let worklist = match worklist {
                Some(path) => load_worklist(&path)?,
                None => generate_worklist(sources, destinations),
            };
            run(
                &config,
                worklist,
                fail_rate,
                Duration::from_millis(command_ms),
                Duration::from_secs(timeout_secs),
            )
            .await
        }
    }
}

fn load_worklist(path: &Path) -> Result<Worklist> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
}

/// Every source plate feeds every destination plate.
fn generate_worklist(sources: usize, destinations: usize) -> Worklist {
    let mut worklist = Worklist::new(format!("demo {sources}x{destinations}"));
    worklist.source_plates = (0..sources)
        .map(|i| Plate::new(format!("SRC{i:03}"), "96 well"))
        .collect();
    worklist.destination_plates = (0..destinations)
        .map(|i| Plate::new(format!("DST{i:03}"), "384 well"))
        .collect();
    for source in &worklist.source_plates {
        for destination in &worklist.destination_plates {
            worklist.transfers.push(Transfer {
                source_plate: source.barcode.clone(),
                destination_plate: destination.barcode.clone(),
                volume_ul: 5.0,
            });
        }
    }

    let downstack = PlateTask::new("InputStacker", "Downstack");
    let upstack = PlateTask::new("OutputStacker", "Upstack");
    worklist.tasks.source_prehitpick = vec![downstack.clone()];
    worklist.tasks.source_posthitpick = vec![upstack.clone()];
    worklist.tasks.destination_prehitpick = vec![downstack];
    worklist.tasks.destination_posthitpick = vec![
        PlateTask::new("Sealer", "Seal").with_parameter("temperature", "165"),
        upstack,
    ];
    worklist
}

fn build_lab(config: &OrchestratorConfig, reporter: &Arc<dyn ErrorReporter>, fail_rate: f64, command: Duration) -> DeviceManager {
    let station = |name: &str, product: &str, nests: &[&str]| {
        let device = SimDevice::new(name, product)
            .with_delay(command)
            .with_fail_rate(fail_rate);
        let locations = nests.iter().map(|nest| PlateLocation::new(name, *nest)).collect();
        Station::new(Arc::new(device), locations)
            .with_reporter(reporter.clone())
            .with_executor_config(&config.executor)
    };

    let mut devices = DeviceManager::with_executor_config(config.executor.clone()).with_reporter(reporter.clone());
    devices.add_device(Arc::new(station("InputStacker1", "InputStacker", &["Nest"])));
    devices.add_device(Arc::new(station("Hitpicker1", "Hitpicker", &["Nest1", "Nest2"])));
    devices.add_device(Arc::new(station("Sealer1", "Sealer", &["Nest"])));
    devices.add_device(Arc::new(
        station("OutputStacker1", "OutputStacker", &["Nest"]).consuming(["Upstack"]),
    ));
    devices.add_robot(Arc::new(SimRobot::new("Arm1", command / 2)));
    devices
}

async fn run(
    config: &OrchestratorConfig,
    worklist: Worklist,
    fail_rate: f64,
    command: Duration,
    timeout: Duration,
) -> Result<()> {
    info!(name = %config.application.name, "Starting simulated lab");
    if fail_rate > 0.0 && config.recovery.max_auto_retries == 0 {
        warn!("Simulated failures are enabled but recovery.max_auto_retries is 0; failed plates will stay stuck");
    }

    let reporter: Arc<dyn ErrorReporter> = Arc::new(config.recovery.retry_policy());
    let devices = Arc::new(build_lab(config, &reporter, fail_rate, command));
    devices.start();

    let robots = Arc::new(RobotScheduler::new(devices.clone(), reporter));
    robots.start()?;
    let scheduler = PlateScheduler::new(config.scheduler.clone(), devices.clone(), robots.clone());
    scheduler.start();

    let report = tokio::time::timeout(timeout, scheduler.enqueue_worklist(worklist)).await;
    if report.is_err() {
        warn!(timeout_secs = timeout.as_secs(), "Worklist did not finish in time");
        println!("{}", scheduler.status());
        println!("{}", robots.status());
    }

    scheduler.stop().await;
    robots.stop().await;
    for device in devices.devices() {
        println!("{}: {}", device.name(), serde_json::to_string(&device.executor_info())?);
    }
    devices.shutdown().await;

    let report = match report {
        Ok(report) => report.context("scheduler dropped the worklist")?,
        Err(_) => bail!("worklist timed out after {}s", timeout.as_secs()),
    };
    println!(
        "Worklist '{}' ({}): {} source / {} destination plates in {:.1}s",
        report.worklist,
        report.id,
        report.source_plates,
        report.destination_plates,
        report.elapsed().num_milliseconds() as f64 / 1000.0
    );
    report.outcome.context("worklist failed")
}
