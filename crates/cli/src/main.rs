//! `batch-executions` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve`: start the API server and the background job resetter.
//! - `migrate`: run pending database migrations.
//! - `reset`: run a single stall/error reset sweep and exit.

mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use adapters::{AllowAllRepoAccess, SqlCredentialStore};
use api::AppState;
use db::DbPool;
use pipeline::{run_resetter, ExecutionController};

use crate::settings::{LogSettings, Settings};

#[derive(Parser)]
#[command(
    name = "batch-executions",
    about = "Workspace execution job pipeline for batch changes",
    version
)]
struct Cli {
    /// Settings file (TOML, YAML or JSON).
    #[arg(long, short, env = "BATCHES_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Overrides `database.url`.
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the REST API server.
    Serve {
        /// Overrides `server.bind`.
        #[arg(long)]
        bind: Option<String>,
        /// Do not run the reset sweep in this process.
        #[arg(long)]
        no_resetter: bool,
    },
    /// Run pending database migrations.
    Migrate,
    /// Requeue stalled and errored jobs once.
    Reset,
}

fn init_tracing(log: &LogSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));
    let registry = tracing_subscriber::registry().with(filter);
    if log.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn connect(settings: &Settings) -> anyhow::Result<DbPool> {
    let pool = db::pool::create_pool(&settings.database.url, settings.database.max_connections)
        .await
        .with_context(|| format!("failed to connect to {}", settings.database.url))?;
    db::pool::run_migrations(&pool).await.context("migration failed")?;
    Ok(pool)
}

fn controller(pool: DbPool, settings: &Settings) -> ExecutionController {
    ExecutionController::new(
        pool,
        settings.lifecycle.clone(),
        Arc::new(AllowAllRepoAccess),
        Arc::new(SqlCredentialStore),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    if let Some(url) = cli.database_url {
        settings.database.url = url;
    }
    init_tracing(&settings.log);

    match cli.command {
        Command::Serve { bind, no_resetter } => {
            let bind = bind.unwrap_or_else(|| settings.server.bind.clone());
            let controller = controller(connect(&settings).await?, &settings);
            let shutdown = CancellationToken::new();

            let resetter = (settings.server.run_resetter && !no_resetter)
                .then(|| tokio::spawn(run_resetter(controller.clone(), shutdown.clone())));

            let on_signal = shutdown.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => info!("shutdown signal received"),
                    Err(err) => warn!(error = %err, "could not listen for shutdown signal"),
                }
                on_signal.cancel();
            });

            let until = shutdown.clone();
            api::serve(&bind, AppState::new(controller), async move { until.cancelled().await }).await?;

            shutdown.cancel();
            if let Some(handle) = resetter {
                handle.await?;
            }
        }
        Command::Migrate => {
            info!("Running migrations against {}", settings.database.url);
            connect(&settings).await?;
            info!("Migrations applied successfully");
        }
        Command::Reset => {
            let controller = controller(connect(&settings).await?, &settings);
            let stats = controller.reset_sweep().await?;
            info!(
                requeued_stalled = stats.requeued_stalled,
                failed_stalled = stats.failed_stalled,
                requeued_errored = stats.requeued_errored,
                canceled = stats.canceled,
                "reset sweep finished"
            );
        }
    }

    Ok(())
}
