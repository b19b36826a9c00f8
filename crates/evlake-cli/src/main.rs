use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use clap::{Parser, Subcommand};
use evlake_core::RunStatus;
use evlake_ingest::{IngestConfig, IngestReport, Pipeline};
use tracing_subscriber::EnvFilter;

mod generate;

#[derive(Debug, Parser)]
#[command(name = "evlake")]
#[command(about = "File-based analytics event ingestion pipeline")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest one batch file, or every *.jsonl file in a directory.
    Ingest {
        /// Batch file or directory (defaults to the incoming directory).
        path: Option<PathBuf>,

        /// Rows per insert transaction.
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Leave source files in place after a successful run.
        #[arg(long)]
        no_archive: bool,
    },

    /// Write a synthetic JSONL batch into the incoming directory.
    Generate {
        /// Number of events to generate in the file.
        #[arg(long, default_value_t = 500)]
        rows: usize,

        /// Number of distinct users.
        #[arg(long, default_value_t = 200)]
        users: i64,

        /// Share of late events (0..1).
        #[arg(long, default_value_t = 0.05)]
        late_rate: f64,

        /// Share of duplicated events (0..1).
        #[arg(long, default_value_t = 0.01)]
        dup_rate: f64,

        /// Output directory (defaults to the incoming directory).
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },

    /// Apply the schema migrations.
    Migrate,

    /// Show recent ingestion runs and flag stale `running` rows.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: i64,

        /// Minutes after which a `running` run counts as stale.
        #[arg(long, default_value_t = 60)]
        stale_after: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = IngestConfig::from_env();

    match cli.command {
        Commands::Ingest {
            path,
            chunk_size,
            no_archive,
        } => {
            if let Some(chunk_size) = chunk_size {
                config.chunk_size = chunk_size;
            }
            if no_archive {
                config.archive_dir = None;
            }

            let pool = evlake_store::connect(&config.database_url)
                .await
                .context("connecting to the event store")?;
            let target = path.unwrap_or_else(|| config.incoming_dir.clone());

            // Ctrl+C stops reading and finalizes the current run with the
            // counts accumulated so far.
            let shutdown = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&shutdown);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutdown signal received, stopping after the current chunk");
                    flag.store(true, Ordering::SeqCst);
                }
            });

            let pipeline = Pipeline::new(pool, config).with_shutdown_flag(shutdown);

            let reports = if target.is_dir() {
                pipeline.ingest_dir(&target).await?
            } else {
                vec![pipeline.ingest_file(&target).await?]
            };

            for report in &reports {
                print_report(report);
            }
            std::process::exit(exit_code(&reports));
        }

        Commands::Generate {
            rows,
            users,
            late_rate,
            dup_rate,
            out_dir,
        } => {
            let out_dir = out_dir.unwrap_or_else(|| config.incoming_dir.clone());
            let generator = generate::GeneratorConfig {
                rows,
                users,
                late_rate,
                dup_rate,
            };
            let (path, written) = generate::write_batch(&out_dir, &generator)?;
            println!("generated {} events -> {}", written, path.display());
        }

        Commands::Migrate => {
            let pool = evlake_store::connect(&config.database_url)
                .await
                .context("connecting to the event store")?;
            evlake_store::run_migrations(&pool).await?;
            println!("migrations applied");
        }

        Commands::Runs { limit, stale_after } => {
            let pool = evlake_store::connect(&config.database_url)
                .await
                .context("connecting to the event store")?;
            let ledger = evlake_store::RunLedger::new(pool);

            let runs = ledger.list_recent(limit).await?;
            if runs.is_empty() {
                println!("no ingestion runs recorded");
            }
            for run in &runs {
                let finished = run
                    .finished_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{} {} status={} in_file={} loaded={} deduped={} started={} finished={}{}",
                    run.run_id,
                    run.file_name,
                    run.status,
                    run.rows_in_file,
                    run.rows_loaded,
                    run.rows_deduped,
                    run.started_at.to_rfc3339(),
                    finished,
                    run.error_message
                        .as_deref()
                        .map(|m| format!(" error={m:?}"))
                        .unwrap_or_default(),
                );
            }

            let stale = ledger
                .stale_running(Duration::minutes(stale_after))
                .await?;
            for run in &stale {
                println!(
                    "STALE: run {} on {} has been `running` since {}; reconcile and re-ingest",
                    run.run_id,
                    run.file_name,
                    run.started_at.to_rfc3339(),
                );
            }
        }
    }

    Ok(())
}

fn print_report(report: &IngestReport) {
    let archived = report
        .archived_to
        .as_ref()
        .map(|p| format!(" -> {}", p.display()))
        .unwrap_or_default();
    println!(
        "{}: status={} in_file={} loaded={} deduped={} invalid={}{}{}",
        report.file_name,
        report.status,
        report.counts.rows_in_file,
        report.counts.rows_loaded,
        report.counts.rows_deduped,
        report.counts.rows_invalid,
        report
            .error_message
            .as_deref()
            .map(|m| format!(" ({m})"))
            .unwrap_or_default(),
        archived,
    );
}

/// 0 only when every run succeeded; failed runs dominate partial ones.
fn exit_code(reports: &[IngestReport]) -> i32 {
    let mut code = 0;
    for report in reports {
        match report.status {
            RunStatus::Failed => return 1,
            RunStatus::Partial => code = 2,
            RunStatus::Succeeded | RunStatus::Running => {}
        }
    }
    code
}
