use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokuten_storage::PgMovieStore;
use tokuten_sync::{maybe_build_scheduler, report_daily_markdown, SyncConfig, SyncService};
use tokuten_web::AppState;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "tokuten")]
#[command(about = "Movie bonus scrape, merge and sync pipeline")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync and print the report.
    Sync {
        /// Print the full JSON report instead of a summary line.
        #[arg(long)]
        json: bool,
    },
    /// Serve the trigger endpoint (and the cron scheduler when enabled).
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
    /// Run only the cron scheduler until interrupted.
    Schedule,
    /// Apply database migrations.
    Migrate,
    /// Summarize recent run reports as markdown.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { json: false }) {
        Commands::Sync { json } => {
            let service = SyncService::connect(config).await?;
            let report = service.run_sync_once().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let saved = report.sync_outcome.as_ref().map_or(0, |o| o.saved_count);
                println!(
                    "sync complete: run_id={} success={} movies={} bonuses={} unmatched={} saved={} errors={}",
                    report.run_id,
                    report.success,
                    report.merged_movies.len(),
                    report.total_bonuses,
                    report.unmatched_bonuses.len(),
                    saved,
                    report.source_errors.len()
                );
            }
        }
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.bind_addr.clone());
            let secret = config.trigger_secret.clone();
            let service = Arc::new(SyncService::connect(config).await?);
            let scheduler = maybe_build_scheduler(service.clone()).await?;
            if let Some(scheduler) = &scheduler {
                scheduler.start().await.context("starting scheduler")?;
            }
            tokuten_web::serve(AppState::new(secret, service), &bind).await?;
        }
        Commands::Schedule => {
            let service = Arc::new(SyncService::connect(config).await?);
            let Some(mut scheduler) = maybe_build_scheduler(service).await? else {
                anyhow::bail!("scheduler is disabled; set TOKUTEN_SCHEDULER_ENABLED=true");
            };
            scheduler.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for migrate")?;
            PgMovieStore::connect(url).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Report { runs } => {
            println!("{}", report_daily_markdown(runs, &config.workspace_root)?);
        }
    }

    Ok(())
}
