//! `hwhub` – command line front end for the device hub.
//!
//! 1. Loads `~/.hwhub/config.toml` (or `--config`), falling back to defaults.
//! 2. Registers the configured backends with a fresh [`DeviceRegistry`].
//! 3. Runs one subcommand:
//!
//! | Command | Effect |
//! |---|---|
//! | `list <query>` | print every device matching the query, then exit |
//! | `watch <query>` | print the matching set and every change until Ctrl-C |
//! | `backends` | print backend status and start-up diagnostics |
//! | `init` | write a default config file if none exists |

mod config;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{info, warn};

use hwhub_backends::{FakeBackend, FakeDevice, MountTableBackend, PowerSupplyBackend};
use hwhub_model::{ListProjection, ProjectionEvent};
use hwhub_query::{Predicate, QueryCache, QueryEvent};
use hwhub_registry::{BackendAdapter, BackendStatus, DeviceHandle, DeviceRegistry};
use hwhub_types::{Capability, DeviceId, HubError, PropertyMap};

use config::{BackendKind, Config, ConfigError};

/// Query and watch the devices of this machine.
#[derive(Parser, Debug)]
#[command(name = "hwhub")]
#[command(about = "Query and watch hardware devices", long_about = None)]
struct Args {
    /// Config file (defaults to ~/.hwhub/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the devices matching a query
    List {
        /// Device query, e.g. "Battery.chargeState = Discharging"
        #[arg(default_value = "")]
        query: String,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Follow the devices matching a query until interrupted
    Watch {
        #[arg(default_value = "")]
        query: String,
    },
    /// Show backend status and diagnostics
    Backends,
    /// Write a default config file
    Init,
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Hub(#[from] HubError),
    #[error("failed to encode JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    // RUST_LOG selects the filter (default "info"); HWHUB_LOG_FORMAT=json
    // switches to newline-delimited JSON.
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    if std::env::var("HWHUB_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .compact()
            .init();
    }

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), CliError> {
    let path = args.config.clone().unwrap_or_else(config::config_path);

    if let Command::Init = args.command {
        return init(&path);
    }

    let cfg = match config::load_from(&path)? {
        Some(cfg) => {
            info!(path = %path.display(), "config loaded");
            cfg
        }
        None => {
            let mut cfg = Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    let registry = start_registry(&cfg).await?;
    let result = match args.command {
        Command::List { query, json } => list(&registry, &query, json),
        Command::Watch { query } => watch(&registry, &query).await,
        Command::Backends => {
            backends(&registry);
            Ok(())
        }
        Command::Init => Ok(()),
    };
    registry.shutdown();
    result
}

fn init(path: &Path) -> Result<(), CliError> {
    if path.exists() {
        println!("  Config already present at {}", path.display().to_string().bold());
        return Ok(());
    }
    config::save_to(&Config::default(), path)?;
    println!("  {} {}", "✓ Wrote".green(), path.display().to_string().bold());
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry bootstrap
// ─────────────────────────────────────────────────────────────────────────────

async fn start_registry(cfg: &Config) -> Result<Arc<DeviceRegistry>, CliError> {
    let registry = DeviceRegistry::with_start_timeout(cfg.start_timeout());
    for kind in &cfg.backends {
        let adapter: Arc<dyn BackendAdapter> = match kind {
            BackendKind::Fake => Arc::new(fake_backend(cfg)?),
            BackendKind::PowerSupply => Arc::new(PowerSupplyBackend::new(cfg.power_supply_config())),
            BackendKind::Mtab => Arc::new(MountTableBackend::new(cfg.mount_table_config())),
        };
        let id = registry.register_backend(adapter).await;
        if let Some(BackendStatus::Degraded(reason)) = registry.backend_status(id) {
            warn!(backend = %kind, %reason, "backend unavailable");
        }
    }
    Ok(registry)
}

fn fake_backend(cfg: &Config) -> Result<FakeBackend, HubError> {
    match &cfg.fixture {
        Some(path) => FakeBackend::from_fixture(path),
        None => Ok(FakeBackend::new()
            .with_device(FakeDevice::laptop_battery("acpi_BAT0"))
            .with_device(FakeDevice::ac_adapter("acpi_AC"))),
    }
}

fn check_query(query: &str) {
    if let Err(e) = Predicate::parse(query) {
        eprintln!(
            "{}: {} (the query will match nothing)",
            "invalid query".yellow().bold(),
            e
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// list
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct DeviceRow {
    udi: DeviceId,
    interfaces: Vec<Capability>,
    properties: PropertyMap,
}

impl From<&DeviceHandle> for DeviceRow {
    fn from(device: &DeviceHandle) -> Self {
        Self {
            udi: device.id().clone(),
            interfaces: device.capabilities().iter().copied().collect(),
            properties: device.properties(),
        }
    }
}

fn list(registry: &Arc<DeviceRegistry>, query: &str, json: bool) -> Result<(), CliError> {
    check_query(query);
    let cache = QueryCache::new(Arc::clone(registry));
    let handle = cache.for_query(query);
    let devices = handle.devices();

    if json {
        let rows: Vec<DeviceRow> = devices.iter().map(DeviceRow::from).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("  {}", "No matching devices.".dimmed());
        return Ok(());
    }
    for device in &devices {
        print_device(device);
    }
    println!("\n  {} device(s)", devices.len().to_string().bold());
    Ok(())
}

fn print_device(device: &DeviceHandle) {
    let interfaces: Vec<String> = device.capabilities().iter().map(|c| c.to_string()).collect();
    println!("{}  [{}]", device.id().to_string().bold().cyan(), interfaces.join(", "));
    for (key, value) in device.properties() {
        println!("    {:<20} {}", key.dimmed(), value);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// watch
// ─────────────────────────────────────────────────────────────────────────────

async fn watch(registry: &Arc<DeviceRegistry>, query: &str) -> Result<(), CliError> {
    check_query(query);
    let cache = QueryCache::new(Arc::clone(registry));
    let projection = ListProjection::new(&cache, query);

    for device in projection.devices() {
        print_device(&device);
    }
    println!(
        "\n  Watching {} device(s) for '{}'.  Press Ctrl-C to stop.\n",
        projection.count().to_string().bold(),
        query
    );

    projection.observe(|event| match event {
        ProjectionEvent::DeviceAdded(id) => {
            println!("{} {} {}", timestamp(), "+".green().bold(), id);
        }
        ProjectionEvent::DeviceRemoved(id) => {
            println!("{} {} {}", timestamp(), "-".red().bold(), id);
        }
        ProjectionEvent::EmptyChanged(true) => {
            println!("{} {}", timestamp(), "no matching devices".dimmed());
        }
        _ => {}
    });

    // Property changes do not reorder rows, so follow them on the shared
    // live query directly.
    let handle = cache.for_query(query);
    let _changes = handle.subscribe(|event| {
        if let QueryEvent::PropertyChanged {
            id,
            changes,
            removed,
        } = event
        {
            for (key, value) in changes {
                println!("{} {} {} {} = {}", timestamp(), "~".yellow().bold(), id, key, value);
            }
            for key in removed {
                println!("{} {} {} {} {}", timestamp(), "~".yellow().bold(), id, key, "unset".dimmed());
            }
        }
    });

    let shutdown = Arc::new(Notify::new());
    let on_signal = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || on_signal.notify_one()) {
        warn!(error = %e, "failed to install Ctrl-C handler");
    }

    let dispatcher = {
        let registry = Arc::clone(registry);
        tokio::spawn(async move { registry.run().await })
    };
    shutdown.notified().await;
    println!();
    println!("{}", "  ✓ Stopping.".green());
    registry.shutdown();
    if let Err(e) = dispatcher.await {
        warn!(error = %e, "dispatch task ended abnormally");
    }
    Ok(())
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string().dimmed().to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// backends
// ─────────────────────────────────────────────────────────────────────────────

fn backends(registry: &DeviceRegistry) {
    for (id, name, status) in registry.backends() {
        let status = match status {
            BackendStatus::Active => "active".green().to_string(),
            BackendStatus::Degraded(reason) => format!("{} ({})", "degraded".yellow(), reason),
            BackendStatus::Removed => "removed".dimmed().to_string(),
        };
        println!("  {:>2}  {:<14} {}", id, name.bold(), status);
    }
    let diagnostics = registry.diagnostics();
    if diagnostics.is_empty() {
        return;
    }
    println!("\n  Diagnostics:");
    for diagnostic in diagnostics {
        println!(
            "    {} {:<14} {:?}: {}",
            diagnostic.at.format("%H:%M:%S").to_string().dimmed(),
            diagnostic.backend,
            diagnostic.kind,
            diagnostic.message
        );
    }
}
