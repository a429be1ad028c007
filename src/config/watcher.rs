//! Configuration file watcher for hot reload.

use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::time::Duration;

use crate::lifecycle::reload::Reload;

/// Monitors the configuration files and raises the reload signal on change.
///
/// Loading happens on the reload path, exactly as for SIGHUP, so a broken
/// edit is reported there and the running configuration is kept.
pub struct ConfigWatcher {
    paths: Vec<PathBuf>,
    reload: Reload,
}

impl ConfigWatcher {
    pub fn new(paths: &[PathBuf], reload: Reload) -> Self {
        Self {
            paths: paths.to_vec(),
            reload,
        }
    }

    /// Start watching in a background thread.
    ///
    /// The returned watcher must be kept alive for events to flow.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let reload = self.reload.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        tracing::info!(paths = ?event.paths, "Config file change detected, reloading");
                        reload.trigger();
                    }
                }
                Err(e) => tracing::error!(error = %e, "Config watch error"),
            },
            NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        for path in &self.paths {
            let mode = if path.is_dir() {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            };
            watcher.watch(path, mode)?;
        }

        tracing::info!(paths = ?self.paths, "Config watcher started");
        Ok(watcher)
    }
}
