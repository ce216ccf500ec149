use anyhow::Result;
use clap::{Parser, ValueEnum};
use giftrec::services::scheduler::{Job, Schedule, Supervisor};
use giftrec::{init_tracing, AppState, Config};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum JobKind {
    Similarity,
    Popularity,
    Profiles,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Run a single job once and exit instead of scheduling all of them.
    #[arg(long, value_enum)]
    once: Option<JobKind>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    std::env::set_var("RUST_LOG", &args.log_level);
    init_tracing().await;

    let config = Config::load_or_default(&args.config)?;
    let scheduler = config.scheduler.clone();
    let state = AppState::new(config).await?;

    let jobs: Vec<(JobKind, Arc<dyn Job>, u64)> = vec![
        (JobKind::Similarity, Arc::new(state.similarity_builder()) as Arc<dyn Job>, scheduler.similarity_interval_secs),
        (JobKind::Popularity, Arc::new(state.popularity_builder()) as Arc<dyn Job>, scheduler.popularity_interval_secs),
        (JobKind::Profiles, Arc::new(state.profile_builder()) as Arc<dyn Job>, scheduler.profile_interval_secs),
    ];

    if let Some(kind) = args.once {
        for (candidate, job, _) in &jobs {
            if *candidate == kind {
                info!(job = job.name(), "Running job once");
                job.run().await?;
            }
        }
        return Ok(());
    }

    info!("Starting giftrec worker");
    let mut supervisor = Supervisor::new();
    for (_, job, interval_secs) in jobs {
        supervisor.spawn(
            job,
            Schedule {
                interval: Duration::from_secs(interval_secs),
                retry_backoff: scheduler.retry_backoff(),
            },
        );
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, waiting for running jobs");
    supervisor.shutdown().await;

    Ok(())
}
