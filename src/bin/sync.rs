use anyhow::Result;
use clap::Parser;
use giftrec::services::builders::run_full_sync;
use giftrec::{init_tracing, AppState, Config};
use tracing::info;

/// Rebuilds every derived relation from scratch and clears the page cache.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    std::env::set_var("RUST_LOG", &args.log_level);
    init_tracing().await;

    let config = Config::load_or_default(&args.config)?;
    let state = AppState::new(config).await?;

    let report = run_full_sync(
        state.derived.as_ref(),
        &state.similarity_builder(),
        &state.popularity_builder(),
        &state.profile_builder(),
        &state.cache,
    )
    .await?;

    info!(
        similarities = report.similarities.written,
        popular_items = report.popular_items.written,
        profiles = report.profiles.written,
        "Full sync finished"
    );
    Ok(())
}
