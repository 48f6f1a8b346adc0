//! Hot reload of the gate configuration file.
//!
//! Editors often emit several modify events for one save, so a reload is
//! forwarded only when the parsed configuration differs from the last one
//! forwarded.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::GateConfig;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Drops reloads that would not change anything.
#[derive(Debug, Default)]
pub struct ReloadFilter {
    last: Mutex<Option<String>>,
}

impl ReloadFilter {
    /// Start from the configuration already in effect.
    pub fn with_current(config: &GateConfig) -> Self {
        Self {
            last: Mutex::new(fingerprint(config)),
        }
    }

    /// True if `config` differs from the last accepted one; records it if so.
    pub fn accept(&self, config: &GateConfig) -> bool {
        let Some(next) = fingerprint(config) else {
            return true;
        };
        let mut last = self.last.lock().expect("reload filter mutex poisoned");
        if last.as_deref() == Some(next.as_str()) {
            return false;
        }
        *last = Some(next);
        true
    }
}

fn fingerprint(config: &GateConfig) -> Option<String> {
    serde_json::to_string(config).ok()
}

/// Watches one configuration file and forwards validated, changed configs.
pub struct ConfigWatcher {
    path: PathBuf,
    filter: ReloadFilter,
    update_tx: mpsc::UnboundedSender<GateConfig>,
}

impl ConfigWatcher {
    /// `current` is the configuration loaded at startup.
    pub fn new(path: &Path, current: &GateConfig) -> (Self, mpsc::UnboundedReceiver<GateConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let watcher = Self {
            path: path.to_path_buf(),
            filter: ReloadFilter::with_current(current),
            update_tx,
        };
        (watcher, update_rx)
    }

    /// Re-read the file and forward it if it parsed and changed.
    pub fn reload(&self) -> bool {
        match load_config(&self.path) {
            Ok(config) if self.filter.accept(&config) => {
                tracing::info!(path = ?self.path, "Configuration change detected");
                self.update_tx.send(config).is_ok()
            }
            Ok(_) => {
                tracing::debug!(path = ?self.path, "Configuration file touched without changes");
                false
            }
            Err(e) => {
                tracing::error!(path = ?self.path, error = %e, "Reload failed, keeping current configuration");
                false
            }
        }
    }

    /// Start watching. The returned handle must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    self.reload();
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Config watch error"),
            },
            Config::default().with_poll_interval(POLL_INTERVAL),
        )?;
        watcher.watch(&path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?path, "Config watcher started");
        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_filter_skips_unchanged() {
        let config = GateConfig::default();
        let filter = ReloadFilter::with_current(&config);
        assert!(!filter.accept(&config));

        let mut changed = config.clone();
        changed.rate_limit.default_rule.max_requests += 1;
        assert!(filter.accept(&changed));
        assert!(!filter.accept(&changed));
    }

    #[test]
    fn test_reload_forwards_changed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[rate_limit.default_rule]\nmax_requests = 7\nwindow_ms = 1000").unwrap();

        let (watcher, mut updates) = ConfigWatcher::new(file.path(), &GateConfig::default());
        assert!(watcher.reload());
        let config = updates.try_recv().unwrap();
        assert_eq!(config.rate_limit.default_rule.max_requests, 7);

        // Same contents again.
        assert!(!watcher.reload());
        assert!(updates.try_recv().is_err());
    }

    #[test]
    fn test_reload_keeps_current_on_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "rate_limit = [").unwrap();

        let (watcher, mut updates) = ConfigWatcher::new(file.path(), &GateConfig::default());
        assert!(!watcher.reload());
        assert!(updates.try_recv().is_err());
    }
}
