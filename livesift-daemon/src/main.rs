use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use livesift_source::Pipeline;
use tracing::{info, warn};
use zbus::ConnectionBuilder;

mod config;
mod logging;
mod service;
mod watcher;

use service::{BUS_NAME, Engine, OBJECT_PATH};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/livesift/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Do not reload sources when the config file changes
    #[arg(long)]
    no_watch: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();

    info!("Daemon starting up. Determining config path...");
    let path = args.config.or_else(config::default_path);
    match &path {
        Some(path) if path.exists() => info!("Using config at {}", path.display()),
        Some(path) => warn!("Config file does not exist at {}", path.display()),
        None => warn!("Could not determine config path"),
    }

    let catalog = config::load(path.as_deref())
        .and_then(|config| config.catalog())
        .context("Failed to load configuration")?;
    let pipeline = Arc::new(Pipeline::new(catalog));

    if pipeline.source_names().is_empty() {
        warn!("No sources configured. The daemon will not return any results.");
    }

    if let Some(path) = path.filter(|_| !args.no_watch) {
        watcher::start_watcher_thread(path, Arc::clone(&pipeline));
    }

    let engine = Engine::new(pipeline);

    let _conn = ConnectionBuilder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, engine)?
        .build()
        .await
        .context("Failed to register on the session bus")?;

    info!("livesift server is running.");
    std::future::pending::<()>().await;

    Ok(())
}
