use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::Duration;

use livesift_source::Pipeline;
use notify::{Event, RecursiveMode, Watcher};
use tracing::{info, warn};

use crate::config;

/// Quiet period after the last event before reloading.
const SETTLE: Duration = Duration::from_millis(200);

/// Rebuilds the pipeline's sources whenever the config file changes.
pub fn start_watcher_thread(path: PathBuf, pipeline: Arc<Pipeline>) {
    thread::spawn(move || {
        if let Err(err) = watch(&path, &pipeline) {
            warn!("Config watcher stopped: {err}");
        }
    });
}

fn watch(path: &Path, pipeline: &Pipeline) -> notify::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    if !dir.exists() {
        warn!("Config directory does not exist at {}, not watching", dir.display());
        return Ok(());
    }

    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher = notify::recommended_watcher(tx)?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    info!("Watching for changes in: {}", dir.display());

    for res in &rx {
        match res {
            Ok(event) if touches(&event, path) => {
                settle(&rx);
                reload(path, pipeline);
            }
            Ok(_) => {}
            Err(err) => warn!("Watch error: {err}"),
        }
    }
    Ok(())
}

fn touches(event: &Event, path: &Path) -> bool {
    let relevant = event.kind.is_create() || event.kind.is_modify() || event.kind.is_remove();
    relevant && event.paths.iter().any(|p| p.file_name() == path.file_name())
}

fn settle(rx: &Receiver<notify::Result<Event>>) {
    while rx.recv_timeout(SETTLE).is_ok() {}
}

/// Swaps in the catalog from `path`, keeping the current one if the file
/// no longer loads.
pub fn reload(path: &Path, pipeline: &Pipeline) -> bool {
    match config::load(Some(path)).and_then(|config| config.catalog()) {
        Ok(catalog) => {
            info!("Reloaded {} source(s) from {}", catalog.sources.len(), path.display());
            pipeline.install(catalog);
            true
        }
        Err(err) => {
            warn!("Keeping previous sources, reload failed: {err}");
            false
        }
    }
}
