use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gridfeed_core::RunStatus;
use gridfeed_db::PgStore;
use gridfeed_pipeline::{load_report_registry, Pipeline, PipelineConfig};
use gridfeed_storage::{ArchiveCache, HttpFetcher};
use gridfeed_upstream::HttpUpstream;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gridfeed")]
#[command(about = "Incremental report-archive ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest new archives for every report in the registry.
    Run {
        /// Restrict the run to a single report_type.
        #[arg(long)]
        report: Option<String>,
    },
    /// Apply the embedded database schema.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Run { report: None }) {
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url, config.db_max_connections)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("applying schema")?;
            println!("schema applied");
        }
        Commands::Run { report } => {
            let mut registry = load_report_registry(&config.reports_path)?;
            if let Some(report) = report {
                registry.reports.retain(|spec| spec.report_type == report);
                anyhow::ensure!(
                    !registry.reports.is_empty(),
                    "no report named {report} in registry"
                );
            }
            info!(reports = registry.reports.len(), "starting ingestion");

            let store = PgStore::connect(&config.database_url, config.db_max_connections)
                .await
                .context("connecting to database")?;
            let fetcher = HttpFetcher::new(config.http_config())?;
            let upstream = Arc::new(HttpUpstream::new(
                config.catalog_base_url.clone(),
                fetcher,
                config.auth(),
            ));
            let cache = ArchiveCache::new(config.cache_dir.clone(), config.request_delay());
            let pipeline = Pipeline::new(cache, upstream, config.max_files);

            let summaries = pipeline.run_all(&store, &store, &store, &registry).await?;
            let mut failed = false;
            for summary in &summaries {
                println!(
                    "{}: status={} run_id={} candidates={} ingested={} errored={} inserted_rows={}",
                    summary.report_type,
                    summary.status.as_str(),
                    summary.run_id,
                    summary.tally.candidates,
                    summary.tally.ingested_archives,
                    summary.tally.errored,
                    summary.tally.inserted_rows
                );
                failed |= summary.status == RunStatus::Fail;
            }
            anyhow::ensure!(!failed, "one or more report runs failed");
        }
    }

    Ok(())
}
