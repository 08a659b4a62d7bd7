//! File system event monitoring for the PKI directory.
//!
//! Wraps `notify::RecommendedWatcher` (inotify on Linux, kqueue on macOS)
//! and forwards classified events to a callback from a dedicated
//! forwarder thread. [`super::FsJsonPkiStore`] uses it to drop cached
//! records when another process rewrites or deletes a record file.

use std::path::{Path, PathBuf};
use std::sync::mpsc;

use anyhow::{Context, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};

/// Classification of a file system event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// A new file was created.
    Create,
    /// File content or metadata was modified (not a rename).
    Modify,
    /// A file was renamed or moved.
    Rename,
    /// A file was deleted.
    Delete,
    /// Access events, watcher-internal events, etc.
    Other,
}

/// A single file system event with path and classification.
#[derive(Debug, Clone)]
pub struct FileEvent {
    /// Affected path.
    pub path: PathBuf,
    /// What happened to it.
    pub kind: FileEventKind,
}

impl FileEvent {
    /// Whether the event can change what a reader of `path` would see.
    pub fn is_mutation(&self) -> bool {
        self.kind != FileEventKind::Other
    }
}

/// Watches one directory (non-recursively) until dropped.
pub struct DirWatcher {
    _watcher: RecommendedWatcher,
    dir: PathBuf,
}

impl std::fmt::Debug for DirWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirWatcher")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl DirWatcher {
    /// Start watching `dir`, calling `on_event` for every classified event.
    ///
    /// The callback runs on a forwarder thread that exits once the
    /// watcher is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS watcher cannot be created or the
    /// directory cannot be watched.
    pub fn spawn<F>(dir: &Path, on_event: F) -> Result<Self>
    where
        F: Fn(FileEvent) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Result<Event, notify::Error>>();

        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .context("Failed to create file watcher")?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch: {}", dir.display()))?;

        std::thread::Builder::new()
            .name("pki-watcher".to_string())
            .spawn(move || {
                // Ends when the watcher (and with it the sender) is dropped.
                while let Ok(result) = rx.recv() {
                    match result {
                        Ok(event) => {
                            for file_event in classify_event(&event) {
                                on_event(file_event);
                            }
                        }
                        Err(e) => log::warn!("PKI watcher error: {e}"),
                    }
                }
                log::debug!("PKI watcher forwarder exiting");
            })
            .context("Failed to spawn PKI watcher thread")?;

        log::info!("Watching PKI directory for changes: {:?}", dir);
        Ok(Self {
            _watcher: watcher,
            dir: dir.to_path_buf(),
        })
    }
}

/// Split a raw `notify::Event` into per-path [`FileEvent`]s.
pub fn classify_event(event: &Event) -> Vec<FileEvent> {
    let kind = classify(&event.kind);
    event
        .paths
        .iter()
        .map(|p| FileEvent {
            path: p.clone(),
            kind,
        })
        .collect()
}

fn classify(kind: &notify::EventKind) -> FileEventKind {
    match kind {
        notify::EventKind::Create(_) => FileEventKind::Create,
        notify::EventKind::Modify(notify::event::ModifyKind::Name(_)) => FileEventKind::Rename,
        notify::EventKind::Modify(_) => FileEventKind::Modify,
        notify::EventKind::Remove(_) => FileEventKind::Delete,
        _ => FileEventKind::Other,
    }
}
