//! Reload-on-changes: filesystem watching with an ignore filter.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};

use gantry_core::error::{Error, Result};

const DEFAULT_IGNORE_DIRS: [&str; 9] = [
    ".git",
    ".hg",
    ".svn",
    ".tox",
    ".venv",
    ".idea",
    "__pycache__",
    "node_modules",
    "target",
];

const DEFAULT_IGNORE_PATTERNS: [&str; 5] = [".swp", ".swx", ".tmp", ".DS_Store", "~"];

/// Configuration for the change reloader.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReloadConfig {
    /// Paths watched recursively.
    pub paths: Vec<PathBuf>,
    /// Directory names ignored anywhere in a path, added to the default
    /// set.
    pub ignore_dirs: Vec<String>,
    /// File-name fragments ignored, added to the default set.
    pub ignore_patterns: Vec<String>,
    /// Exact path prefixes ignored.
    pub ignore_paths: Vec<PathBuf>,
    /// Watch tick interval in milliseconds. Range 50..=5000.
    pub tick_ms: u64,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            paths: vec![PathBuf::from(".")],
            ignore_dirs: Vec::new(),
            ignore_patterns: Vec::new(),
            ignore_paths: Vec::new(),
            tick_ms: 250,
        }
    }
}

impl ReloadConfig {
    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.tick_ms < 50 || self.tick_ms > 5000 {
            return Err(Error::config("reload_tick"));
        }
        if self.paths.is_empty() {
            return Err(Error::config("reload_paths"));
        }
        Ok(())
    }

    fn is_ignored(&self, path: &Path) -> bool {
        if self.ignore_paths.iter().any(|p| path.starts_with(p)) {
            return true;
        }
        let in_ignored_dir = path.components().any(|c| {
            let name = c.as_os_str().to_string_lossy();
            DEFAULT_IGNORE_DIRS.iter().any(|d| *d == name)
                || self.ignore_dirs.iter().any(|d| *d == name)
        });
        if in_ignored_dir {
            return true;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        DEFAULT_IGNORE_PATTERNS
            .iter()
            .any(|p| file_name.contains(p))
            || self.ignore_patterns.iter().any(|p| file_name.contains(p))
    }
}

/// A running filesystem watcher with the composed ignore filter applied.
pub(crate) struct ChangeWatcher {
    config: ReloadConfig,
    rx: Receiver<notify::Result<notify::Event>>,
    // Watching stops when this is dropped.
    _watcher: RecommendedWatcher,
}

impl ChangeWatcher {
    pub(crate) fn new(config: ReloadConfig) -> Result<Self> {
        config.validate()?;
        let (tx, rx) = std::sync::mpsc::channel();
        let mut watcher = notify::recommended_watcher(tx)
            .map_err(|e| Error::config(format!("cannot start file watcher: {e}")))?;
        for path in &config.paths {
            watcher
                .watch(path, RecursiveMode::Recursive)
                .map_err(|e| Error::config(format!("cannot watch {}: {e}", path.display())))?;
        }
        Ok(Self {
            config,
            rx,
            _watcher: watcher,
        })
    }

    /// Block up to one tick and return the filtered changed paths, if any.
    pub(crate) fn poll(&self) -> Vec<PathBuf> {
        let tick = Duration::from_millis(self.config.tick_ms);
        let mut changed = Vec::new();
        match self.rx.recv_timeout(tick) {
            Ok(event) => self.collect(event, &mut changed),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                return changed;
            }
        }
        // Coalesce the burst that usually follows a first notification.
        while let Ok(event) = self.rx.try_recv() {
            self.collect(event, &mut changed);
        }
        changed
    }

    fn collect(&self, event: notify::Result<notify::Event>, changed: &mut Vec<PathBuf>) {
        let Ok(event) = event else { return };
        for path in event.paths {
            if !self.config.is_ignored(&path) && !changed.contains(&path) {
                changed.push(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_range() {
        for bad in [49, 5001] {
            let config = ReloadConfig {
                tick_ms: bad,
                ..ReloadConfig::default()
            };
            assert!(config.validate().is_err());
        }
        assert!(ReloadConfig::default().validate().is_ok());
    }

    #[test]
    fn test_default_filter_composition() {
        let config = ReloadConfig {
            ignore_dirs: vec!["generated".to_owned()],
            ignore_patterns: vec![".lock".to_owned()],
            ignore_paths: vec![PathBuf::from("/opt/app/secrets")],
            ..ReloadConfig::default()
        };
        // Defaults still apply.
        assert!(config.is_ignored(Path::new("/app/.git/HEAD")));
        assert!(config.is_ignored(Path::new("/app/src/.main.rs.swp")));
        // User additions compose.
        assert!(config.is_ignored(Path::new("/app/generated/schema.rs")));
        assert!(config.is_ignored(Path::new("/app/Cargo.lock")));
        assert!(config.is_ignored(Path::new("/opt/app/secrets/key.pem")));
        // Regular sources pass.
        assert!(!config.is_ignored(Path::new("/app/src/main.rs")));
    }

    #[test]
    fn test_watcher_sees_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReloadConfig {
            paths: vec![dir.path().to_path_buf()],
            tick_ms: 200,
            ..ReloadConfig::default()
        };
        let watcher = ChangeWatcher::new(config).unwrap();

        std::fs::write(dir.path().join("app.py"), b"x").unwrap();
        let mut changed = Vec::new();
        // Backends may need a few ticks to deliver the first event.
        for _ in 0..25 {
            changed = watcher.poll();
            if !changed.is_empty() {
                break;
            }
        }
        assert!(
            changed.iter().any(|p| p.ends_with("app.py")),
            "expected app.py in {changed:?}"
        );
    }
}
