//! Filesystem event sources: the seam between the OS watcher and the orchestrator.

pub mod scan;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::{AwaitWriteFinish, WatchOptions};
use crate::error::{Result, WatchError};
use crate::event::{FileEvent, FileEventKind, FileStat};

use scan::{RootFilter, ScanEntry};

/// What an event source delivers to the orchestrator.
#[derive(Debug)]
pub enum SourceMessage {
    Event(FileEvent),
    /// The initial scan is complete; live events follow.
    Ready,
    Error(WatchError),
}

/// A producer of raw filesystem events.
///
/// `subscribe` starts delivery for `roots` (absolute paths): first one `add` per existing
/// file unless initial events are suppressed, then [`SourceMessage::Ready`], then live
/// events. `close` stops delivery; the sender is dropped afterwards.
pub trait EventSource: Send {
    fn subscribe(&mut self, roots: &[PathBuf], tx: mpsc::Sender<SourceMessage>) -> Result<()>;
    fn close(&mut self);
}

/// [`EventSource`] backed by the platform watcher from `notify`.
pub struct NotifySource {
    options: WatchOptions,
    watcher: Option<RecommendedWatcher>,
    bridge: Option<JoinHandle<()>>,
}

impl NotifySource {
    pub fn new(options: WatchOptions) -> Self {
        Self {
            options,
            watcher: None,
            bridge: None,
        }
    }
}

impl EventSource for NotifySource {
    fn subscribe(&mut self, roots: &[PathBuf], tx: mpsc::Sender<SourceMessage>) -> Result<()> {
        let (std_tx, std_rx) = std::sync::mpsc::channel::<notify::Result<notify::Event>>();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = std_tx.send(res);
        })?;
        for root in roots {
            watcher.watch(root, RecursiveMode::Recursive)?;
        }

        let filters: Vec<RootFilter> = roots
            .iter()
            .map(|r| RootFilter::new(r, &self.options))
            .collect();
        let options = self.options.clone();

        // Bridge: scan, signal ready, then classify and forward live events. Live events
        // raised during the scan queue up in the std channel.
        let bridge = tokio::task::spawn_blocking(move || {
            let mut bridge = Bridge {
                filters,
                known_dirs: HashSet::new(),
                await_write_finish: options.await_write_finish.clone(),
                tx,
            };
            if !bridge.initial_scan(&options) {
                return;
            }
            while let Ok(result) = std_rx.recv() {
                let delivered = match result {
                    Ok(event) => bridge.forward(event),
                    Err(err) => bridge.send(SourceMessage::Error(err.into())),
                };
                if !delivered {
                    return; // receiver dropped, shutdown
                }
            }
        });

        self.watcher = Some(watcher);
        self.bridge = Some(bridge);
        Ok(())
    }

    fn close(&mut self) {
        // Dropping the watcher drops the std sender, which ends the bridge loop.
        self.watcher = None;
        self.bridge = None;
    }
}

struct Bridge {
    filters: Vec<RootFilter>,
    known_dirs: HashSet<PathBuf>,
    await_write_finish: Option<AwaitWriteFinish>,
    tx: mpsc::Sender<SourceMessage>,
}

impl Bridge {
    fn send(&self, message: SourceMessage) -> bool {
        self.tx.blocking_send(message).is_ok()
    }

    fn initial_scan(&mut self, options: &WatchOptions) -> bool {
        for filter in &self.filters {
            let root = filter.root();
            if !root.is_dir() {
                if !options.ignore_initial && !self.send_file_event(FileEventKind::Add, root) {
                    return false;
                }
                continue;
            }
            self.known_dirs.insert(root.to_path_buf());
            for ScanEntry { path, is_dir } in scan::scan(filter, options.follow_symlinks) {
                if is_dir {
                    self.known_dirs.insert(path);
                } else if !options.ignore_initial
                    && !self.send_file_event(FileEventKind::Add, &path)
                {
                    return false;
                }
            }
        }
        debug!(directories = self.known_dirs.len(), "initial scan complete");
        self.send(SourceMessage::Ready)
    }

    fn allows(&self, path: &Path, is_dir: bool) -> bool {
        self.filters.iter().any(|f| f.allows(path, is_dir))
    }

    /// Classify one notify event into zero or more file events and send them.
    fn forward(&mut self, event: notify::Event) -> bool {
        trace!(kind = ?event.kind, paths = ?event.paths, "raw notify event");
        let mut out: Vec<(FileEventKind, PathBuf)> = Vec::new();
        match event.kind {
            EventKind::Create(kind) => {
                for path in event.paths {
                    let is_dir = matches!(kind, CreateKind::Folder)
                        || (!matches!(kind, CreateKind::File) && path.is_dir());
                    out.push((added(is_dir), path));
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                let mut paths = event.paths.into_iter();
                if let (Some(from), Some(to)) = (paths.next(), paths.next()) {
                    out.push((self.removed(&from), from));
                    out.push((added(to.is_dir()), to));
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                for path in event.paths {
                    out.push((self.removed(&path), path));
                }
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                for path in event.paths {
                    if path.exists() {
                        out.push((added(path.is_dir()), path));
                    } else {
                        out.push((self.removed(&path), path));
                    }
                }
            }
            EventKind::Modify(ModifyKind::Metadata(_)) => {}
            EventKind::Modify(_) => {
                for path in event.paths {
                    if path.is_file() {
                        out.push((FileEventKind::Change, path));
                    }
                }
            }
            EventKind::Remove(kind) => {
                for path in event.paths {
                    let kind = match kind {
                        RemoveKind::Folder => FileEventKind::UnlinkDir,
                        RemoveKind::File => FileEventKind::Unlink,
                        _ => self.removed(&path),
                    };
                    out.push((kind, path));
                }
            }
            EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
        }

        for (kind, path) in out {
            match kind {
                FileEventKind::AddDir => {
                    self.known_dirs.insert(path.clone());
                }
                FileEventKind::UnlinkDir => {
                    self.known_dirs.retain(|d| !d.starts_with(&path));
                }
                _ => {}
            }
            if !self.allows(&path, kind.is_directory()) {
                continue;
            }
            if !self.send_file_event(kind, &path) {
                return false;
            }
        }
        true
    }

    fn removed(&self, path: &Path) -> FileEventKind {
        if self.known_dirs.contains(path) {
            FileEventKind::UnlinkDir
        } else {
            FileEventKind::Unlink
        }
    }

    fn send_file_event(&self, kind: FileEventKind, path: &Path) -> bool {
        let mut event = FileEvent::new(kind, path);
        if matches!(kind, FileEventKind::Add | FileEventKind::Change) {
            if let Some(awf) = &self.await_write_finish {
                wait_for_write_finish(path, awf);
            }
            match std::fs::metadata(path) {
                Ok(metadata) => event = event.with_stats(FileStat::from_metadata(&metadata)),
                Err(err) => {
                    // Gone again before we looked; the matching unlink follows.
                    debug!(path = %path.display(), error = %err, "dropping event for vanished file");
                    return true;
                }
            }
        }
        self.send(SourceMessage::Event(event))
    }
}

fn added(is_dir: bool) -> FileEventKind {
    if is_dir {
        FileEventKind::AddDir
    } else {
        FileEventKind::Add
    }
}

/// Block until the size of `path` has not changed for the stability threshold.
/// Gives up after twenty thresholds of continuous growth.
fn wait_for_write_finish(path: &Path, awf: &AwaitWriteFinish) {
    let threshold = Duration::from_millis(awf.stability_threshold_ms);
    let poll = Duration::from_millis(awf.poll_interval_ms);
    let give_up = Instant::now() + threshold * 20;

    let mut last_size = std::fs::metadata(path).map(|m| m.len()).ok();
    let mut stable_since = Instant::now();
    while Instant::now() < give_up {
        std::thread::sleep(poll);
        let size = std::fs::metadata(path).map(|m| m.len()).ok();
        if size.is_none() {
            return;
        }
        if size != last_size {
            last_size = size;
            stable_since = Instant::now();
        } else if stable_since.elapsed() >= threshold {
            return;
        }
    }
    warn!(path = %path.display(), "file still changing, forwarding event anyway");
}
