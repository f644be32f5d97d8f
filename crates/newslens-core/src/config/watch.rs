//! Hot reload for the ensemble configuration.
//!
//! Watches the ensemble JSON file via the `notify` crate with debouncing and
//! swaps the active config atomically on change. Runs already in flight keep
//! the config they started with; only subsequently started runs observe the
//! new document.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_full::{
    new_debouncer, notify::RecursiveMode, DebounceEventResult, Debouncer, RecommendedCache,
};
use tokio_util::sync::CancellationToken;

use super::ensemble::{EnsembleConfig, EnsembleHandle};

/// Debounce window for bursts of editor write events.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// Watch `path` and reload the ensemble config into `handle` on change.
///
/// Runs until `cancel` fires. A file that fails to re-parse leaves the
/// previous config active and logs the error; the watcher keeps running.
pub async fn watch_ensemble_config(
    path: std::path::PathBuf,
    handle: Arc<EnsembleHandle>,
    cancel: CancellationToken,
) {
    let (event_tx, mut event_rx) = tokio::sync::mpsc::channel::<DebounceEventResult>(16);

    let handler = move |result: DebounceEventResult| {
        let _ = event_tx.blocking_send(result);
    };

    let mut debouncer: Debouncer<notify::RecommendedWatcher, RecommendedCache> =
        match new_debouncer(DEBOUNCE_WINDOW, None, handler) {
            Ok(d) => d,
            Err(e) => {
                tracing::error!(error = %e, "failed to create ensemble config watcher");
                return;
            }
        };

    // Watch the parent directory so atomic rename-based saves are seen.
    let watch_target = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    if let Err(e) = debouncer.watch(&watch_target, RecursiveMode::NonRecursive) {
        tracing::error!(
            path = %watch_target.display(),
            error = %e,
            "failed to watch ensemble config directory"
        );
        return;
    }

    tracing::info!(path = %path.display(), "watching ensemble config for changes");

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!("ensemble config watcher cancelled");
                return;
            }
            result = event_rx.recv() => {
                let Some(result) = result else { return };
                match result {
                    Ok(events) => {
                        let touched = events.iter().any(|e| {
                            e.paths.iter().any(|p| p.file_name() == path.file_name())
                        });
                        if touched {
                            reload(&path, &handle);
                        }
                    }
                    Err(errors) => {
                        for e in errors {
                            tracing::warn!(error = %e, "ensemble config watch error");
                        }
                    }
                }
            }
        }
    }
}

/// Re-parse the config file and swap it in if valid.
fn reload(path: &Path, handle: &EnsembleHandle) {
    match EnsembleConfig::load(&path.to_string_lossy()) {
        Ok(config) => {
            tracing::info!(
                version = %config.version,
                models = config.models.len(),
                "ensemble config reloaded"
            );
            handle.swap(config);
        }
        Err(errors) => {
            for e in &errors {
                tracing::error!(error = %e, "ensemble config rejected");
            }
            tracing::error!(
                errors = errors.len(),
                "ensemble config reload failed, keeping previous"
            );
        }
    }
}
