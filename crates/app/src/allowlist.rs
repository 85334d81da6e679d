//! Caller/destination allowlist: a pure predicate over number strings,
//! reloaded whenever the backing file changes.
//!
//! The file is JSON: `{"inbound": [...], "outbound": [...]}`. An empty (or
//! absent) array allows everything on that side.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllowlistEntries {
    #[serde(default)]
    pub inbound: Vec<String>,
    #[serde(default)]
    pub outbound: Vec<String>,
}

#[derive(Debug, Error)]
pub enum AllowlistError {
    #[error("failed to read allowlist {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse allowlist {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

struct AllowlistInner {
    entries: RwLock<AllowlistEntries>,
    path: Option<PathBuf>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

#[derive(Clone)]
pub struct Allowlist {
    inner: Arc<AllowlistInner>,
}

impl Allowlist {
    /// An allowlist with no backing file: everything is allowed.
    pub fn allow_all() -> Self {
        Self {
            inner: Arc::new(AllowlistInner {
                entries: RwLock::new(AllowlistEntries::default()),
                path: None,
                watcher: Mutex::new(None),
            }),
        }
    }

    /// Load from `path` and start watching it for changes.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AllowlistError> {
        let path = path.as_ref().to_path_buf();
        let entries = read_entries(&path)?;
        info!(
            path = %path.display(),
            inbound = entries.inbound.len(),
            outbound = entries.outbound.len(),
            "allowlist loaded"
        );
        let list = Self {
            inner: Arc::new(AllowlistInner {
                entries: RwLock::new(entries),
                path: Some(path),
                watcher: Mutex::new(None),
            }),
        };
        list.start_watcher();
        Ok(list)
    }

    /// Whether an inbound call from `number` may proceed.
    pub fn allows_inbound(&self, number: &str) -> bool {
        let entries = self.inner.entries.read();
        entries.inbound.is_empty() || entries.inbound.iter().any(|n| n == number)
    }

    /// Whether an outbound call to `number` may proceed.
    pub fn allows_outbound(&self, number: &str) -> bool {
        let entries = self.inner.entries.read();
        entries.outbound.is_empty() || entries.outbound.iter().any(|n| n == number)
    }

    pub fn entries(&self) -> AllowlistEntries {
        self.inner.entries.read().clone()
    }

    /// Replace the entries and persist them to the backing file, if any.
    pub fn replace(&self, entries: AllowlistEntries) -> Result<(), AllowlistError> {
        if let Some(path) = &self.inner.path {
            let text = serde_json::to_string_pretty(&entries).map_err(|source| {
                AllowlistError::Parse {
                    path: path.clone(),
                    source,
                }
            })?;
            std::fs::write(path, text).map_err(|source| AllowlistError::Io {
                path: path.clone(),
                source,
            })?;
        }
        *self.inner.entries.write() = entries;
        Ok(())
    }

    /// Re-read the backing file. Keeps the previous entries on failure so a
    /// half-written file cannot open the gate.
    pub fn reload(&self) {
        let Some(path) = &self.inner.path else { return };
        match read_entries(path) {
            Ok(entries) => {
                info!(
                    inbound = entries.inbound.len(),
                    outbound = entries.outbound.len(),
                    "allowlist reloaded"
                );
                *self.inner.entries.write() = entries;
            }
            Err(e) => warn!("allowlist reload failed, keeping previous entries: {e}"),
        }
    }

    fn start_watcher(&self) {
        let Some(path) = self.inner.path.clone() else { return };
        let (tx, rx) = std::sync::mpsc::channel::<()>();

        let mut watcher = match notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    let _ = tx.send(());
                }
            }
        }) {
            Ok(w) => w,
            Err(e) => {
                warn!("allowlist watcher unavailable, hot reload disabled: {e}");
                return;
            }
        };

        // Watch the parent directory: editors replace files rather than
        // rewriting them in place, which unregisters a file-level watch.
        let watch_target = path.parent().map(Path::to_path_buf).unwrap_or_else(|| path.clone());
        if let Err(e) = watcher.watch(&watch_target, RecursiveMode::NonRecursive) {
            warn!("allowlist watch failed, hot reload disabled: {e}");
            return;
        }
        *self.inner.watcher.lock() = Some(watcher);

        let list = self.clone();
        std::thread::spawn(move || {
            while rx.recv().is_ok() {
                // Coalesce bursts of events from a single save.
                std::thread::sleep(Duration::from_millis(100));
                while rx.try_recv().is_ok() {}
                list.reload();
            }
        });
    }
}

fn read_entries(path: &Path) -> Result<AllowlistEntries, AllowlistError> {
    let text = std::fs::read_to_string(path).map_err(|source| AllowlistError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| AllowlistError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
