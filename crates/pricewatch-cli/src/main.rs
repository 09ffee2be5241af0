use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pricewatch_catalog::{CatalogClient, SITE_ROOT};
use pricewatch_pipeline::{build_scheduler, Pipeline, WatchConfig};
use pricewatch_storage::{HttpClientConfig, HttpFetcher};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "pricewatch")]
#[command(about = "Marketplace price drop watcher")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one full cycle: rotate, scrape, diff, notify.
    Run,
    /// Run cycles on the configured interval until interrupted.
    Watch,
    /// Dump category URLs matching the given substrings to a urls file.
    Categories {
        /// Keep only categories whose URL contains one of these substrings.
        #[arg(long = "filter")]
        filters: Vec<String>,
        #[arg(long, default_value = "urls.txt")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = WatchConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let pipeline = Pipeline::new(config)?;
            let summary = pipeline.run_cycle().await?;
            println!(
                "cycle complete: run_id={} categories={} records={} changes={} notified={}",
                summary.run_id,
                summary.categories_scraped,
                summary.records_collected,
                summary.changes_detected,
                summary.notifications_sent
            );
        }
        Commands::Watch => {
            let pipeline = Arc::new(Pipeline::new(config)?);

            // First cycle fires immediately; the scheduler handles the rest.
            if let Err(err) = pipeline.run_cycle().await {
                error!("initial cycle failed: {err:#}");
            }

            let mut scheduler = build_scheduler(pipeline).await?;
            scheduler.start().await.context("starting scheduler")?;
            info!("watching; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Categories { filters, output } => {
            let http = Arc::new(HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                proxy_url: config.proxy_url.clone(),
                ..Default::default()
            })?);
            let entries = CatalogClient::new(http).fetch_tree().await?;

            let mut lines = Vec::new();
            for entry in &entries {
                if filters.is_empty() || filters.iter().any(|f| entry.url.contains(f.as_str())) {
                    lines.push(format!("{SITE_ROOT}{}", entry.url));
                }
            }
            std::fs::write(&output, lines.join("\n") + "\n")
                .with_context(|| format!("writing {}", output.display()))?;
            println!("wrote {} category urls to {}", lines.len(), output.display());
        }
    }

    Ok(())
}
