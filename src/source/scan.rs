use std::path::{Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::debug;

use crate::config::WatchOptions;

/// One entry found by the initial scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    pub path: PathBuf,
    pub is_dir: bool,
}

/// Decides which paths below one watch root are reported.
///
/// Applies, in order: the `.git` exclusion, the depth limit, `watch_options.ignored`
/// globs (matched against the absolute and the root-relative path), then the root's
/// `.gitignore`. The initial scan and live events share it, so both see the same tree.
pub struct RootFilter {
    root: PathBuf,
    ignored: Vec<glob::Pattern>,
    gitignore: Gitignore,
    depth: Option<usize>,
}

impl RootFilter {
    pub fn new(root: &Path, options: &WatchOptions) -> Self {
        let dir = if root.is_dir() {
            root
        } else {
            root.parent().unwrap_or(root)
        };
        Self {
            root: root.to_path_buf(),
            // Patterns were checked by config validation; a bad one simply never matches.
            ignored: options
                .ignored
                .iter()
                .filter_map(|p| glob::Pattern::new(p).ok())
                .collect(),
            gitignore: build_gitignore_matcher(dir),
            depth: options.depth,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `depth = 0` keeps only the root's direct children.
    pub fn max_walk_depth(&self) -> Option<usize> {
        self.depth.map(|d| d + 1)
    }

    pub fn allows(&self, path: &Path, is_dir: bool) -> bool {
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return false;
        };
        if relative.components().any(|c| c.as_os_str() == ".git") {
            return false;
        }
        if let Some(max) = self.max_walk_depth() {
            if relative.components().count() > max {
                return false;
            }
        }
        if self
            .ignored
            .iter()
            .any(|p| p.matches_path(path) || p.matches_path(relative))
        {
            return false;
        }
        !self
            .gitignore
            .matched_path_or_any_parents(path, is_dir)
            .is_ignore()
    }
}

/// Build a matcher from the root's `.gitignore`, empty when there is none.
fn build_gitignore_matcher(dir: &Path) -> Gitignore {
    let mut builder = GitignoreBuilder::new(dir);
    let gitignore_path = dir.join(".gitignore");
    if gitignore_path.exists() {
        if let Some(err) = builder.add(&gitignore_path) {
            debug!(path = %gitignore_path.display(), error = %err, "ignoring unreadable .gitignore");
        }
    }
    builder.build().unwrap_or_else(|_| Gitignore::empty())
}

/// Walk `filter.root()` once and return every allowed file and directory below it,
/// sorted by path. The root itself is not included.
pub fn scan(filter: &RootFilter, follow_symlinks: bool) -> Vec<ScanEntry> {
    let mut builder = ignore::WalkBuilder::new(filter.root());
    builder
        .standard_filters(true)
        .hidden(false)
        .require_git(false)
        .follow_links(follow_symlinks)
        .max_depth(filter.max_walk_depth());

    let mut entries = Vec::new();
    for result in builder.build() {
        let entry = match result {
            Ok(e) => e,
            Err(err) => {
                debug!(error = %err, "skipping unreadable entry during scan");
                continue;
            }
        };
        if entry.depth() == 0 && entry.path() == filter.root() && filter.root().is_dir() {
            continue;
        }
        let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
        if filter.allows(entry.path(), is_dir) {
            entries.push(ScanEntry {
                path: entry.path().to_path_buf(),
                is_dir,
            });
        }
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    entries
}
