//! Dispenser: command-line entry point.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Adapters (outer ring)                     │
//! │                                                              │
//! │  RelayBank<SimPin>    JsonFileStore      LogEventSink        │
//! │  (ActuatorPort)       (StorePort)        (EventSink)         │
//! │                                                              │
//! │  ─────────────── Port Trait Boundary ───────────────         │
//! │                                                              │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │                 AppService (pure logic)                │  │
//! │  │  Registry · Ledger · Orchestrator · Calibration        │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │                                                              │
//! │  Autosave thread · operator console thread (resume/abort)    │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use log::{info, warn};

use dispenser::adapters::gpio::{RelayBank, SimPin, sim_bank};
use dispenser::adapters::json_store::JsonFileStore;
use dispenser::adapters::log_sink::LogEventSink;
use dispenser::app::commands::{AppCommand, AppResponse};
use dispenser::app::ports::{ActuatorPort, StorePort};
use dispenser::app::service::AppService;
use dispenser::autosave::Autosave;
use dispenser::ledger::IngredientLedger;
use dispenser::recipe::Recipe;
use dispenser::registry::{PumpId, PumpRegistry};

type Service = AppService<RelayBank<SimPin>>;

/// Drink rig dispenser: pour recipes, manage stock, calibrate pumps.
#[derive(Debug, Parser)]
#[command(name = "dispenser", author, version, about, long_about = None)]
struct Cli {
    /// Directory holding pump-config.json, ingredient-levels.json and
    /// optional config.json.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Pour a recipe file at a serving size.
    Pour {
        recipe: PathBuf,
        #[arg(long)]
        size: f32,
    },
    /// Pour one ingredient.
    Shot { ingredient: String, amount_ml: f32 },
    /// Check whether a recipe can be poured.
    Check {
        recipe: PathBuf,
        #[arg(long)]
        size: f32,
    },
    /// Show all ingredient levels.
    Levels,
    /// Refill one ingredient, or all with --all.
    Refill {
        ingredient: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Change a reservoir's capacity.
    SetCapacity { ingredient: String, capacity_ml: f32 },
    /// Correct a reservoir's current amount.
    SetAmount { ingredient: String, amount_ml: f32 },
    /// Replace all levels from a backup file.
    ImportLevels { file: PathBuf },
    /// List the pump table.
    Pumps,
    /// Set a pump's flow rate directly.
    SetFlow { pump: PumpId, ml_per_sec: f32 },
    /// Enable or disable a pump.
    Enable {
        pump: PumpId,
        #[arg(long)]
        off: bool,
    },
    /// Run a pump for a fixed time, then enter the measured volume.
    Calibrate {
        pump: PumpId,
        #[arg(long, default_value_t = 10_000)]
        ms: u32,
    },
    /// Prime a pump's line.
    Vent {
        pump: PumpId,
        #[arg(long)]
        ms: Option<u32>,
    },
    /// Flush a pump's line.
    Clean {
        pump: PumpId,
        #[arg(long, default_value_t = 10_000)]
        ms: u32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("dispenser=info")),
        )
        .init();

    let cli = Cli::parse();

    let store = Arc::new(JsonFileStore::open(&cli.data_dir)?);
    let config = store.load_config()?;
    let store: Arc<dyn StorePort> = store;

    let registry = Arc::new(PumpRegistry::load(store.clone())?);
    let ledger = Arc::new(IngredientLedger::load(config.default_capacity_ml, store));
    let relays = Arc::new(sim_bank(&registry.list_all(), config.max_actuation_ms)?);

    let autosave = Autosave::spawn(
        registry.clone(),
        ledger.clone(),
        Duration::from_secs(u64::from(config.autosave_interval_secs)),
        Duration::from_millis(u64::from(config.shutdown_flush_timeout_ms)),
    )?;

    let service = Arc::new(AppService::from_parts(
        config,
        registry,
        ledger,
        relays.clone(),
        Arc::new(LogEventSink::new()),
    ));

    let outcome = run(&service, cli.command);

    relays.all_off();
    if !autosave.shutdown() {
        warn!("Some state could not be saved; it will be retried on next start");
    }
    outcome
}

fn run(service: &Arc<Service>, command: Command) -> Result<()> {
    let cmd = match command {
        Command::Pour { recipe, size } => {
            spawn_console(service.clone());
            AppCommand::Dispense {
                recipe: load_recipe(&recipe)?,
                size_ml: size,
            }
        }
        Command::Shot {
            ingredient,
            amount_ml,
        } => {
            spawn_console(service.clone());
            AppCommand::Shot {
                ingredient,
                amount_ml,
            }
        }
        Command::Check { recipe, size } => AppCommand::Availability {
            recipe: load_recipe(&recipe)?,
            size_ml: size,
        },
        Command::Levels => AppCommand::Levels,
        Command::Refill { all: true, .. } => AppCommand::RefillAll,
        Command::Refill {
            ingredient: Some(ingredient),
            ..
        } => AppCommand::Refill { ingredient },
        Command::Refill { .. } => bail!("name an ingredient or pass --all"),
        Command::SetCapacity {
            ingredient,
            capacity_ml,
        } => AppCommand::SetCapacity {
            ingredient,
            capacity_ml,
        },
        Command::SetAmount {
            ingredient,
            amount_ml,
        } => AppCommand::SetAmount {
            ingredient,
            amount_ml,
        },
        Command::ImportLevels { file } => AppCommand::ImportLevels {
            json: std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?,
        },
        Command::Pumps => AppCommand::Pumps,
        Command::SetFlow { pump, ml_per_sec } => AppCommand::SetFlowRate { pump, ml_per_sec },
        Command::Enable { pump, off } => AppCommand::SetEnabled {
            pump,
            enabled: !off,
        },
        Command::Calibrate { pump, ms } => return calibrate(service, pump, ms),
        Command::Vent { pump, ms } => AppCommand::Vent {
            pump,
            duration_ms: ms,
        },
        Command::Clean { pump, ms } => AppCommand::Clean {
            pump,
            duration_ms: ms,
        },
    };

    let response = service.handle_command(cmd)?;
    print_response(&response)
}

fn calibrate(service: &Service, pump: PumpId, ms: u32) -> Result<()> {
    let run = match service.handle_command(AppCommand::CalibrationTest {
        pump,
        duration_ms: ms,
    })? {
        AppResponse::CalibrationRun(run) => run,
        other => bail!("unexpected response {other:?}"),
    };

    eprintln!("Pump {pump} ran for {ms} ms. Measured volume in ml:");
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let measured_ml: f32 = line.trim().parse().context("not a number")?;

    let response = service.handle_command(AppCommand::CompleteCalibration { run, measured_ml })?;
    print_response(&response)
}

/// Operator console for a running job: an empty line resumes a manual
/// step, `abort` cancels the job.
fn spawn_console(service: Arc<Service>) {
    let spawned = std::thread::Builder::new()
        .name("console".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                let cmd = if line.trim().eq_ignore_ascii_case("abort") {
                    AppCommand::Abort
                } else {
                    AppCommand::Resume
                };
                if let Err(e) = service.handle_command(cmd) {
                    info!("console: {}", e);
                }
            }
        });
    if let Err(e) = spawned {
        warn!("console thread not started: {}", e);
    }
}

fn load_recipe(path: &Path) -> Result<Recipe> {
    let json =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("parsing {}", path.display()))
}

fn print_response(response: &AppResponse) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(())
}
