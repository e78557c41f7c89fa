use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bitstats_storage::SqliteRecordStore;
use bitstats_sync::{SyncConfig, SyncPipeline};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "bitstats")]
#[command(about = "Daily bitly click statistics into a SQLite data file")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync: backup, download, reconcile yesterday's clicks, upload.
    Sync {
        /// Opaque id of the triggering event, used only for logging.
        #[arg(long)]
        request_id: Option<String>,
        /// Print records as JSON lines instead of touching the bucket.
        #[arg(long)]
        dry_run: bool,
    },
    /// Render stored clicks of the last N days as Markdown.
    Report {
        #[arg(long, default_value_t = 7)]
        days: u32,
        /// Data file to read; defaults to the local copy in the temp dir.
        #[arg(long)]
        database: Option<PathBuf>,
    },
    /// Create an empty data file with the links table.
    InitDb { path: PathBuf },
    /// Run syncs on the configured cron until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bitstats=info,bitstats_sync=info,bitstats_storage=info,bitstats_adapters=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        request_id: None,
        dry_run: false,
    }) {
        Commands::Sync {
            request_id,
            dry_run,
        } => {
            let request_id = request_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            info!(request_id = %request_id, dry_run, "processing sync request");
            let pipeline = SyncPipeline::new(config)?;
            let summary = if dry_run {
                pipeline.dry_run(&request_id, std::io::stdout()).await
            } else {
                pipeline.run_once(&request_id).await
            }
            .with_context(|| format!("sync request {request_id} failed"))?;
            eprintln!(
                "sync complete: run_id={} links={} persisted={} skipped={} uploaded={}",
                summary.run_id, summary.links_total, summary.persisted, summary.skipped, summary.uploaded
            );
            if !dry_run {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
        }
        Commands::Report { days, database } => {
            let path = database.unwrap_or_else(|| config.local_database_path());
            let store = SqliteRecordStore::open(&path)
                .await
                .with_context(|| format!("opening {}", path.display()))?;
            let markdown =
                bitstats_sync::report_markdown(&store, days, Utc::now().date_naive()).await?;
            store.close().await;
            println!("{markdown}");
        }
        Commands::InitDb { path } => {
            bitstats_sync::init_database(&path).await?;
            eprintln!("created {}", path.display());
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            let Some(mut sched) = bitstats_sync::maybe_build_scheduler(pipeline).await? else {
                anyhow::bail!("scheduler disabled");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
