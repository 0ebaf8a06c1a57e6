//! Filesystem watcher feeding runtime requests to the render loop.
//!
//! The parent directory of every watched file is registered with `notify`,
//! so atomic saves that replace the file through a rename are still seen.
//! Events are filtered by path and settle for one quiet interval before the
//! file's request is queued; the render loop applies it between frames.

use std::collections::{BTreeSet, HashSet};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use renderer::{RequestSender, RuntimeRequest};

#[derive(Debug, Clone)]
pub struct WatchedFile {
    pub path: PathBuf,
    pub request: RuntimeRequest,
}

/// A watched file keyed by its canonical directory and file name.
struct Target {
    dir: PathBuf,
    name: OsString,
    file: WatchedFile,
}

impl Target {
    fn new(file: WatchedFile) -> Result<Self> {
        let name = file
            .path
            .file_name()
            .map(OsString::from)
            .with_context(|| format!("cannot watch {}: no file name", file.path.display()))?;
        let parent = file
            .path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let dir = fs::canonicalize(parent)
            .with_context(|| format!("cannot watch directory {}", parent.display()))?;
        Ok(Self { dir, name, file })
    }

    fn matches(&self, path: &Path) -> bool {
        path.file_name() == Some(self.name.as_os_str()) && path.parent() == Some(self.dir.as_path())
    }
}

/// Owns the `notify` watcher and the thread forwarding its events.
///
/// Dropping or stopping it unregisters the watches and joins the thread.
pub struct FileWatcher {
    watcher: Option<RecommendedWatcher>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FileWatcher {
    pub fn spawn(files: Vec<WatchedFile>, interval: Duration, sender: RequestSender) -> Result<Self> {
        let targets = files
            .into_iter()
            .map(Target::new)
            .collect::<Result<Vec<_>>>()?;

        let (events_tx, events_rx) = unbounded::<notify::Result<notify::Event>>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = events_tx.send(res);
        })
        .context("failed to create file watcher")?;

        let dirs: HashSet<&Path> = targets.iter().map(|target| target.dir.as_path()).collect();
        for dir in dirs {
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .with_context(|| format!("failed to watch {}", dir.display()))?;
            tracing::debug!(dir = %dir.display(), "watching directory");
        }

        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("shaderloop-watch".into())
            .spawn(move || forward(targets, events_rx, interval, sender, flag))
            .context("failed to start file watcher thread")?;

        Ok(Self {
            watcher: Some(watcher),
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.watcher.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("file watcher thread panicked");
            }
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn forward(
    targets: Vec<Target>,
    events: Receiver<notify::Result<notify::Event>>,
    interval: Duration,
    sender: RequestSender,
    stop: Arc<AtomicBool>,
) {
    let mut pending: BTreeSet<usize> = BTreeSet::new();

    while !stop.load(Ordering::Relaxed) {
        match events.recv_timeout(interval) {
            Ok(Ok(event)) => {
                if !matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                ) {
                    continue;
                }
                for path in &event.paths {
                    pending.extend(
                        targets
                            .iter()
                            .enumerate()
                            .filter(|(_, target)| target.matches(path))
                            .map(|(index, _)| index),
                    );
                }
            }
            Ok(Err(err)) => tracing::warn!(error = %err, "file watcher error"),
            Err(RecvTimeoutError::Timeout) => {
                for index in std::mem::take(&mut pending) {
                    let file = &targets[index].file;
                    if !file.path.exists() {
                        tracing::warn!(path = %file.path.display(), "watched file disappeared");
                        continue;
                    }
                    tracing::debug!(path = %file.path.display(), "watched file changed");
                    if !sender.send(file.request.clone()) {
                        return;
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}
