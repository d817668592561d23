use std::process::ExitCode;

use activities::{
    config::Config,
    database::{RedisRecordStore, init_redis},
    queue::{StreamPublisher, connect_with_backoff},
};
use anyhow::Context;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// List what would be republished without publishing anything.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let config = Config::load()?;

    info!("Connecting to record store...");
    let store = RedisRecordStore::new(
        init_redis(&config.redis_url)
            .await
            .context("Failed to connect to the record store")?,
        config.call_timeout,
    );

    info!("Connecting to event queue...");
    let publisher = StreamPublisher::new(
        connect_with_backoff(&config.redis_url, config.queue_connect_attempts).await?,
        &config,
    );

    let pb = ProgressBar::new(0);
    pb.set_style(ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    )?);

    let summary = reindex::republish(&store, &publisher, &pb, args.dry_run).await?;

    info!("Total activities: {}", summary.total);
    info!("Successfully published: {}", summary.published);
    info!("Errors: {}", summary.failed.len());

    if !summary.is_clean() {
        warn!("Reindexing completed with errors: {:?}", summary.failed);
        return Ok(ExitCode::FAILURE);
    }

    info!("Reindexing completed successfully");
    Ok(ExitCode::SUCCESS)
}
