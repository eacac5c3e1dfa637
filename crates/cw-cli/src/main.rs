use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use cw_sync::{scheduler_from_config, StoreBackend, WatcherConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "classifieds-watcher")]
#[command(about = "Watches classified listing sources and notifies about new entries")]
struct Cli {
    #[arg(long, value_enum, default_value_t = LogFormat::Json, global = true)]
    log_format: LogFormat,
    /// Keep seen ids in memory only; nothing is written to disk or the database.
    #[arg(long, global = true)]
    dry_store: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every configured watcher once and exit.
    Run,
    /// Run immediately, then on the configured interval until interrupted.
    Daemon,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "classifieds watcher failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = WatcherConfig::from_env().context("loading configuration")?;
    if cli.dry_store {
        config.store = StoreBackend::Memory;
    }
    let scheduler = scheduler_from_config(&config).await.context("building watchers")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summaries = scheduler.run_once(&shutdown).await?;
            for summary in summaries {
                println!(
                    "{}: run_id={} fetched={} new={} already_seen={} skipped={}",
                    summary.provider,
                    summary.run_id,
                    summary.fetched,
                    summary.new_items,
                    summary.already_seen,
                    summary.invalid
                        + summary.check_failed
                        + summary.notify_failed
                        + summary.save_failed
                );
            }
        }
        Commands::Daemon => scheduler.run_daemon(&shutdown).await,
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true).with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init(),
    }
}

/// Cancels `token` on Ctrl-C, or SIGTERM on unix.
async fn cancel_on_signal(token: CancellationToken) {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
    token.cancel();
}
