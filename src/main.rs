//! # Sparkie: autonomous task scheduler
//!
//! Usage:
//!   sparkie                          # Serve the API and run the heartbeat
//!   sparkie --port 8080 serve        # Custom port
//!   sparkie tick                     # Run one heartbeat tick and exit
//!   sparkie cron "0 9 * * 1" -n 3    # Preview the next fire times
//!   sparkie init                     # Write a default config file

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use sparkie_core::config::SparkieConfig;
use sparkie_scheduler::{
    ExecutorSettings, Heartbeat, HeartbeatLock, HeartbeatScheduler, SchedulerDb, SqliteLeaseLock,
    TaskExecutor, cron,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "sparkie",
    version,
    about = "⏰ Sparkie: scheduled AI tasks, heartbeat execution and proactive outreach"
)]
struct Cli {
    /// Config file (defaults to $SPARKIE_CONFIG or ~/.sparkie/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Gateway port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Database path (overrides config)
    #[arg(long)]
    db: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API with the background heartbeat (default)
    Serve,
    /// Run a single heartbeat tick and exit
    Tick,
    /// Write a default config file (refuses to overwrite)
    Init,
    /// Print the next fire times of a cron expression
    Cron {
        expression: String,
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "sparkie=debug,sparkie_scheduler=debug,sparkie_gateway=debug,sparkie_providers=debug,tower_http=debug"
    } else {
        "sparkie=info,sparkie_scheduler=info,sparkie_gateway=info,sparkie_providers=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    match &cli.command {
        Some(Command::Cron { expression, count }) => return preview_cron(expression, *count),
        Some(Command::Init) => return init_config(cli.config.as_deref()),
        _ => {}
    }

    let mut config = match &cli.config {
        Some(path) => SparkieConfig::load_from(path)?,
        None => SparkieConfig::load()?,
    };
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }
    if let Some(db) = &cli.db {
        config.database.path = db.clone();
    }

    let db_path = shellexpand::tilde(&config.database.path).to_string();
    let db = Arc::new(
        SchedulerDb::open(Path::new(&db_path))
            .with_context(|| format!("opening database at {db_path}"))?,
    );

    let lock = heartbeat_lock(&config, db.clone()).await?;
    let client = sparkie_providers::create_completion_client(&config.completion);
    if client.is_none() {
        tracing::warn!("No completion key configured; AI tasks will record a placeholder result");
    }
    let settings = ExecutorSettings::from_config(&config.scheduler, &config.completion);
    let executor = Arc::new(TaskExecutor::new(db, client, settings));
    let heartbeat = Arc::new(Heartbeat::new(executor.clone(), lock));

    match cli.command.unwrap_or(Command::Serve) {
        Command::Tick => {
            let report = heartbeat.tick().await?;
            if report.ran {
                println!(
                    "✅ Tick complete: {} owner(s), {} executed, {} failed, {} recovered",
                    report.owners, report.executed, report.failed, report.recovered
                );
            } else {
                println!("⏭️  Another holder has the heartbeat lock, nothing done");
            }
            Ok(())
        }
        Command::Serve => serve(config, executor, heartbeat, db_path).await,
        Command::Cron { .. } | Command::Init => Ok(()),
    }
}

async fn serve(
    config: SparkieConfig,
    executor: Arc<TaskExecutor>,
    heartbeat: Arc<Heartbeat>,
    db_path: String,
) -> Result<()> {
    let scheduler = HeartbeatScheduler::from_config(heartbeat, &config.scheduler);
    if config.scheduler.enabled {
        scheduler.start();
    } else {
        tracing::info!("Heartbeat disabled in config; tasks run only on client polls");
    }

    println!("⏰ Sparkie v{}", env!("CARGO_PKG_VERSION"));
    println!("   🌐 API:      http://{}:{}", config.gateway.host, config.gateway.port);
    println!("   🗄️  Database: {db_path}");
    println!(
        "   💓 Heartbeat: every {}s (batch {})",
        config.scheduler.interval_secs, config.scheduler.batch_size
    );
    println!();

    let state = sparkie_gateway::AppState::new(executor, &config);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {e}");
        }
        tracing::info!("Shutting down");
    };
    let served = sparkie_gateway::start(&config.gateway, state, shutdown).await;
    scheduler.stop().await;
    served
}

async fn heartbeat_lock(config: &SparkieConfig, db: Arc<SchedulerDb>) -> Result<Arc<dyn HeartbeatLock>> {
    #[cfg(feature = "postgres")]
    if let Some(url) = &config.database.postgres_url {
        let lock = sparkie_scheduler::PgAdvisoryLock::connect(url, config.scheduler.lock_key).await?;
        tracing::info!("Heartbeat lock: postgres advisory lock {}", config.scheduler.lock_key);
        return Ok(Arc::new(lock));
    }

    #[cfg(not(feature = "postgres"))]
    if config.database.postgres_url.is_some() {
        tracing::warn!("postgres_url is set but this build lacks the `postgres` feature; using the SQLite lease");
    }

    Ok(Arc::new(SqliteLeaseLock::new(
        db,
        config.scheduler.lock_key,
        config.scheduler.lock_ttl_secs,
    )))
}

fn init_config(path: Option<&Path>) -> Result<()> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(SparkieConfig::default_path);
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    SparkieConfig::default().save_to(&path)?;
    println!("✅ Wrote default config to {}", path.display());
    Ok(())
}

fn preview_cron(expression: &str, count: usize) -> Result<()> {
    cron::CronSchedule::parse(expression)?;
    let mut after = Utc::now();
    println!("Next {count} fire time(s) for \"{expression}\" (UTC):");
    for _ in 0..count {
        after = cron::next_fire_time(expression, after);
        println!("   {}", after.format("%a %Y-%m-%d %H:%M"));
    }
    Ok(())
}
