use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use cadence_core::Governor;
use cadence_core::store::PostgresStore;
use cadence_server::create_app;
use cadence_server::infra::bootstrap::{build_governor, connect_store};
use cadence_server::infra::config::{Config, ConfigLoad, ConfigLoader, ConfigWarnings};
use cadence_server::infra::telemetry::init_tracing;

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "cadence-server")]
#[command(about = "Lease-based ingestion governor for rate-limited activity feeds")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, env = "CADENCE_CONFIG")]
    config: Option<PathBuf>,

    /// Path to a .env file loaded before reading the environment
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a single governor tick, print its report, and exit
    Tick,
    /// Tick on a fixed interval until interrupted
    Run(RunArgs),
    /// Serve the HTTP trigger (default)
    Serve(ServeArgs),
    /// Print queue counts by status
    Status,
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(ClapArgs, Debug, Clone, Default)]
struct RunArgs {
    /// Tick interval such as `5m` (overrides config)
    #[arg(long, value_parser = humantime::parse_duration)]
    interval: Option<Duration>,
}

#[derive(ClapArgs, Debug, Clone, Default)]
struct ServeArgs {
    /// Server port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Also tick on the configured schedule while serving
    #[arg(long, default_value_t = false)]
    schedule: bool,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_runtime_config(&cli)?;

    match cli.command.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::Tick => run_once(&config).await,
        Command::Run(args) => {
            let interval = args.interval.unwrap_or(config.schedule.tick_interval);
            let governor = build_governor(&config).await?;
            run_schedule(governor, interval).await;
            Ok(())
        }
        Command::Serve(args) => run_server(config, args).await,
        Command::Status => {
            let governor = build_governor(&config).await?;
            let counts = governor
                .status_counts()
                .await
                .context("failed to read queue counts")?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
            Ok(())
        }
        Command::Db(DbCommand::Migrate) => {
            let mut database = config.database.clone();
            database.run_migrations = true;
            connect_store(&database)
                .await
                .context("database migration failed")?;
            info!("Database migrations applied successfully");
            Ok(())
        }
    }
}

fn load_runtime_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = &cli.env_file {
        loader = loader.with_env_file(path);
    }
    let ConfigLoad { config, warnings } =
        loader.load().context("failed to load configuration")?;

    init_tracing();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration file loaded");
    }
    log_warnings(&warnings);

    Ok(config)
}

fn log_warnings(warnings: &ConfigWarnings) {
    if !warnings.is_empty() {
        for warning in &warnings.items {
            match &warning.hint {
                Some(hint) => {
                    warn!(message = %warning.message, hint = %hint, "configuration warning")
                }
                None => {
                    warn!(message = %warning.message, "configuration warning")
                }
            }
        }
    }
}

async fn run_once(config: &Config) -> anyhow::Result<()> {
    let governor = build_governor(config).await?;
    let report = governor.tick().await.context("governor tick failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Ticks until ctrl-c. A failed tick is logged and the schedule continues.
async fn run_schedule(governor: Arc<Governor<PostgresStore>>, interval: Duration) {
    info!(interval = %humantime::format_duration(interval), "governor schedule started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = governor.tick().await {
                    error!(error = %err, "governor tick failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested; stopping schedule");
                break;
            }
        }
    }
}

async fn run_server(mut config: Config, args: ServeArgs) -> anyhow::Result<()> {
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }

    let governor = build_governor(&config).await?;

    if args.schedule {
        let scheduled = Arc::clone(&governor);
        let interval = config.schedule.tick_interval;
        tokio::spawn(async move { run_schedule(scheduled, interval).await });
    }

    let app = create_app(governor);
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "cadence server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "failed to listen for shutdown signal");
            }
        })
        .await
        .context("server error")?;
    Ok(())
}
