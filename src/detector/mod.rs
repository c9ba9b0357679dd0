//! Change detection: per-file state, the dependency graph, and the mapping from one raw
//! filesystem event to the set of files that need revalidation.

pub mod circular;
pub mod graph;
pub mod resolve;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::DetectionConfig;
use crate::error::{Result, WatchError};
use crate::event::{FileEvent, FileEventKind};

use circular::CircularDep;
use graph::DependencyGraph;
use resolve::{DependencyResolver, normalize_path};

/// Last observed state of a tracked file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    pub path: PathBuf,
    /// `sha256:<hex>` of the content, empty when content tracking is off.
    pub content_hash: String,
    pub mtime: DateTime<Utc>,
    pub size: u64,
    pub dependencies: Vec<PathBuf>,
}

/// How much revalidation a change calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationScope {
    Full,
    Incremental,
}

/// Why a change set was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeReason {
    FileAdded,
    FileChanged,
    FileDeleted,
    DirectoryAdded,
    DirectoryDeleted,
    ExcludedFile,
    NoChange,
    FileNotTracked,
}

impl ChangeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FileAdded => "file-added",
            Self::FileChanged => "file-changed",
            Self::FileDeleted => "file-deleted",
            Self::DirectoryAdded => "directory-added",
            Self::DirectoryDeleted => "directory-deleted",
            Self::ExcludedFile => "excluded-file",
            Self::NoChange => "no-change",
            Self::FileNotTracked => "file-not-tracked",
        }
    }
}

impl std::fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The files one processed event requires to be revalidated, and why.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    /// The changed file (unless deleted) followed by its transitive dependents.
    pub files: Vec<PathBuf>,
    /// Resolved direct dependencies of the changed file.
    pub dependencies: Vec<PathBuf>,
    pub validation_type: ValidationScope,
    pub reason: ChangeReason,
    pub timestamp: DateTime<Utc>,
}

impl ChangeSet {
    fn empty(reason: ChangeReason) -> Self {
        Self {
            files: Vec::new(),
            dependencies: Vec::new(),
            validation_type: ValidationScope::Incremental,
            reason,
            timestamp: Utc::now(),
        }
    }

    fn full(files: Vec<PathBuf>, reason: ChangeReason) -> Self {
        Self {
            files,
            dependencies: Vec::new(),
            validation_type: ValidationScope::Full,
            reason,
            timestamp: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Owns the file-state cache and the dependency graph. Single writer: only
/// [`ChangeDetector::process_event`] mutates either.
#[derive(Debug)]
pub struct ChangeDetector {
    extensions: HashSet<String>,
    exclude: Vec<glob::Pattern>,
    resolver: DependencyResolver,
    track_content: bool,
    cache_size: usize,
    full_on_content_change: bool,
    states: HashMap<PathBuf, FileState>,
    graph: DependencyGraph,
}

impl ChangeDetector {
    pub fn new(config: &DetectionConfig) -> Result<Self> {
        let exclude = config
            .exclude
            .iter()
            .map(|p| {
                glob::Pattern::new(p).map_err(|err| {
                    WatchError::Configuration(format!("invalid exclude pattern `{p}`: {err}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            extensions: config
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_owned())
                .collect(),
            exclude,
            resolver: DependencyResolver::new(
                &config.dependency_patterns,
                &config.resolve_extensions,
            )?,
            track_content: config.track_content,
            cache_size: config.cache_size.max(1),
            full_on_content_change: config.full_on_content_change,
            states: HashMap::new(),
            graph: DependencyGraph::new(),
        })
    }

    /// Turn one raw event into a change set, updating file states and the graph.
    pub fn process_event(&mut self, event: &FileEvent, base_path: &Path) -> Result<ChangeSet> {
        let path = normalize_path(&base_path.join(&event.path));
        let changes = match event.kind {
            FileEventKind::Add | FileEventKind::Change => {
                if !self.is_tracked_path(&path, base_path) {
                    return Ok(ChangeSet::empty(ChangeReason::ExcludedFile));
                }
                let reason = if event.kind == FileEventKind::Add {
                    ChangeReason::FileAdded
                } else {
                    ChangeReason::FileChanged
                };
                self.on_file_written(&path, reason)?
            }
            FileEventKind::Unlink => self.on_file_removed(&path),
            FileEventKind::AddDir => ChangeSet::full(Vec::new(), ChangeReason::DirectoryAdded),
            FileEventKind::UnlinkDir => self.on_directory_removed(&path),
        };

        debug!(
            path = %path.display(),
            kind = event.kind.as_str(),
            reason = %changes.reason,
            files = changes.files.len(),
            "processed file event"
        );
        Ok(changes)
    }

    fn on_file_written(&mut self, path: &Path, reason: ChangeReason) -> Result<ChangeSet> {
        let metadata =
            std::fs::metadata(path).map_err(|e| WatchError::filesystem("stat", path, e))?;
        if metadata.is_dir() {
            return Ok(ChangeSet::empty(ChangeReason::ExcludedFile));
        }
        let mtime = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .map_err(|e| WatchError::filesystem("stat", path, e))?;
        let size = metadata.len();

        let prior = self.states.get(path);
        if !self.track_content
            && prior.is_some_and(|p| p.mtime == mtime && p.size == size)
        {
            return Ok(ChangeSet::empty(ChangeReason::NoChange));
        }

        let bytes = std::fs::read(path).map_err(|e| WatchError::filesystem("read", path, e))?;
        let content_hash = if self.track_content {
            hash_content(&bytes)
        } else {
            String::new()
        };
        if self.track_content && prior.is_some_and(|p| p.content_hash == content_hash) {
            return Ok(ChangeSet::empty(ChangeReason::NoChange));
        }

        let dependencies = self
            .resolver
            .dependencies(path, &String::from_utf8_lossy(&bytes));
        let first_seen = prior.is_none();
        let deps_changed = prior.is_none_or(|p| !same_members(&p.dependencies, &dependencies));
        let validation_type = if first_seen || deps_changed || self.full_on_content_change {
            ValidationScope::Full
        } else {
            ValidationScope::Incremental
        };

        self.graph.set_dependencies(path, &dependencies);
        self.states.insert(
            path.to_path_buf(),
            FileState {
                path: path.to_path_buf(),
                content_hash,
                mtime,
                size,
                dependencies: dependencies.clone(),
            },
        );

        let mut files = vec![path.to_path_buf()];
        files.extend(self.graph.transitive_dependents(path));
        self.evict_if_needed();

        Ok(ChangeSet {
            files,
            dependencies,
            validation_type,
            reason,
            timestamp: Utc::now(),
        })
    }

    fn on_file_removed(&mut self, path: &Path) -> ChangeSet {
        if !self.states.contains_key(path) {
            return ChangeSet::empty(ChangeReason::FileNotTracked);
        }
        // Dependents must be collected before the node disappears.
        let affected = self.graph.transitive_dependents(path);
        self.forget(path);
        ChangeSet::full(affected, ChangeReason::FileDeleted)
    }

    fn on_directory_removed(&mut self, dir: &Path) -> ChangeSet {
        let mut removed: Vec<PathBuf> = self
            .states
            .keys()
            .filter(|p| p.starts_with(dir))
            .cloned()
            .collect();
        removed.extend(self.graph.files_under(dir));
        removed.sort();
        removed.dedup();

        let mut affected: BTreeSet<PathBuf> = BTreeSet::new();
        for path in &removed {
            affected.extend(self.graph.transitive_dependents(path));
        }
        for path in &removed {
            self.forget(path);
        }
        affected.retain(|p| !p.starts_with(dir));

        ChangeSet::full(affected.into_iter().collect(), ChangeReason::DirectoryDeleted)
    }

    /// Drop the cached state and graph node of `path`, and strip it from the recorded
    /// dependency lists of its direct dependents.
    fn forget(&mut self, path: &Path) {
        for dependent in self.graph.dependents(path) {
            if let Some(state) = self.states.get_mut(&dependent) {
                state.dependencies.retain(|d| d != path);
            }
        }
        self.states.remove(path);
        self.graph.remove_file(path);
    }

    /// Evict the oldest-mtime entries until the cache is back at `cache_size`.
    fn evict_if_needed(&mut self) {
        if self.states.len() <= self.cache_size {
            return;
        }
        let excess = self.states.len() - self.cache_size;
        let mut by_age: Vec<(DateTime<Utc>, PathBuf)> = self
            .states
            .values()
            .map(|s| (s.mtime, s.path.clone()))
            .collect();
        by_age.sort();
        for (_, path) in by_age.into_iter().take(excess) {
            debug!(path = %path.display(), "evicting file state from cache");
            self.forget(&path);
        }
    }

    /// Whether `path` passes the extension allow-list and no exclusion pattern matches it.
    pub fn is_tracked_path(&self, path: &Path, base_path: &Path) -> bool {
        let ext_ok = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.extensions.contains(e));
        if !ext_ok {
            return false;
        }
        let relative = path.strip_prefix(base_path).unwrap_or(path);
        !self
            .exclude
            .iter()
            .any(|p| p.matches_path(path) || p.matches_path(relative))
    }

    pub fn transitive_dependents(&self, path: &Path) -> Vec<PathBuf> {
        self.graph.transitive_dependents(&normalize_path(path))
    }

    pub fn dependency_chain(&self, path: &Path) -> Vec<PathBuf> {
        self.graph.dependency_chain(&normalize_path(path))
    }

    pub fn detect_cycles(&self) -> Vec<CircularDep> {
        circular::find_cycles(&self.graph)
    }

    pub fn file_state(&self, path: &Path) -> Option<&FileState> {
        self.states.get(&normalize_path(path))
    }

    /// Number of files with a cached state.
    pub fn tracked_files(&self) -> usize {
        self.states.len()
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }
}

fn hash_content(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

fn same_members(a: &[PathBuf], b: &[PathBuf]) -> bool {
    a.len() == b.len() && a.iter().collect::<HashSet<_>>() == b.iter().collect::<HashSet<_>>()
}
