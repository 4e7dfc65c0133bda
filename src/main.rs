//! mtuned - Autonomous MySQL/MariaDB Tuning Daemon
//!
//! Loads the configuration, connects to the server and supervises the
//! notification and tuner services until SIGINT/SIGTERM.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mtuned::config::{Config, DEFAULT_LOG_FILE};
use mtuned::db::{Db, ErrorMonitor};
use mtuned::error::Result;
use mtuned::notify;
use mtuned::supervise::spawn_supervised;
use mtuned::tuner::TunerService;

/// mtuned - Autonomous MySQL/MariaDB Tuning Daemon
#[derive(Parser)]
#[command(name = "mtuned")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path of mtuned
    #[arg(long, default_value = "/etc/mtuned.cnf")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)?;

    init_logging(&config)?;

    let errors = ErrorMonitor::new();
    let db = match Db::connect(&config, errors.clone()).await {
        Ok(db) => db,
        Err(err) => {
            tracing::error!(error = %err, "connecting to the database failed");
            return Err(err);
        }
    };
    tracing::info!("database connection established");

    let token = CancellationToken::new();

    let notify_svc = Arc::new(notify::Service::new(&config));
    {
        let svc = Arc::clone(&notify_svc);
        let child = token.clone();
        spawn_supervised("notify", token.clone(), move || {
            let svc = Arc::clone(&svc);
            let token = child.clone();
            async move { svc.run(token).await }
        });
    }

    let tuner_svc = Arc::new(
        TunerService::new(
            token.clone(),
            &config,
            db,
            errors,
            Arc::clone(&notify_svc),
        )
        .await?,
    );
    spawn_supervised("tuner", token.clone(), move || {
        let svc = Arc::clone(&tuner_svc);
        async move { svc.run().await }
    });

    tracing::info!("mtuned started");

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }

    tracing::info!("received shutdown signal");
    token.cancel();

    Ok(())
}

/// Route tracing output to the configured log file
fn init_logging(config: &Config) -> Result<()> {
    let level = match config.log_level {
        i64::MIN..=-1 => "debug",
        0 => "info",
        1 => "warn",
        _ => "error",
    };

    let path = if config.log.trim().is_empty() {
        DEFAULT_LOG_FILE
    } else {
        config.log.as_str()
    };

    let file = OpenOptions::new().create(true).append(true).open(path)?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Arc::new(file))
                .with_ansi(false),
        )
        .init();

    Ok(())
}
