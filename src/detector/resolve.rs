use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use regex::Regex;

use crate::error::{Result, WatchError};

/// The outcome of resolving a single dependency reference.
#[derive(Debug, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// Resolved to an existing file.
    Resolved(PathBuf),
    /// The reference could not be resolved. `String` contains a human-readable reason.
    Unresolved(String),
}

/// Finds dependency references in file content and maps them to files on disk.
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    patterns: Vec<Regex>,
    extensions: Vec<String>,
}

impl DependencyResolver {
    /// Compile the ordered reference patterns. Each must have at least one capture group.
    pub fn new(patterns: &[String], extensions: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                let re = Regex::new(p).map_err(|err| {
                    WatchError::Configuration(format!("invalid dependency pattern `{p}`: {err}"))
                })?;
                if re.captures_len() < 2 {
                    return Err(WatchError::Configuration(format!(
                        "dependency pattern `{p}` has no capture group"
                    )));
                }
                Ok(re)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            patterns,
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_owned())
                .filter(|e| !e.is_empty())
                .collect(),
        })
    }

    /// Raw references found in `content`, in pattern order then match order, deduplicated.
    pub fn extract_references(&self, content: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut refs = Vec::new();
        for re in &self.patterns {
            for caps in re.captures_iter(content) {
                if let Some(m) = caps.get(1) {
                    let reference = m.as_str().trim();
                    if !reference.is_empty() && seen.insert(reference.to_owned()) {
                        refs.push(reference.to_owned());
                    }
                }
            }
        }
        refs
    }

    /// Resolve `reference` from the perspective of `from_file`.
    ///
    /// Candidates, in order: the literal path, the path with each candidate extension
    /// appended, `<ref>/index.<ext>` next to `from_file`, then `<ref>/index.<ext>` in the
    /// parent directory. The first existing file wins.
    pub fn resolve(&self, from_file: &Path, reference: &str) -> ResolutionOutcome {
        let Some(dir) = from_file.parent() else {
            return ResolutionOutcome::Unresolved("file has no parent directory".to_owned());
        };
        if reference.contains("://") {
            return ResolutionOutcome::Unresolved("remote reference".to_owned());
        }

        let literal = dir.join(reference);
        let mut candidates = vec![literal.clone()];
        candidates.extend(
            self.extensions
                .iter()
                .map(|ext| dir.join(format!("{reference}.{ext}"))),
        );
        candidates.extend(
            self.extensions
                .iter()
                .map(|ext| literal.join(format!("index.{ext}"))),
        );
        if let Some(parent) = dir.parent() {
            candidates.extend(
                self.extensions
                    .iter()
                    .map(|ext| parent.join(reference).join(format!("index.{ext}"))),
            );
        }

        candidates
            .into_iter()
            .map(|c| normalize_path(&c))
            .find(|c| c.is_file())
            .map(ResolutionOutcome::Resolved)
            .unwrap_or_else(|| ResolutionOutcome::Unresolved(format!("no file for `{reference}`")))
    }

    /// Resolved dependencies of `from_file` given its content. Best-effort: unresolvable
    /// references are dropped, self references are ignored.
    pub fn dependencies(&self, from_file: &Path, content: &str) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        let mut deps = Vec::new();
        for reference in self.extract_references(content) {
            match self.resolve(from_file, &reference) {
                ResolutionOutcome::Resolved(path) => {
                    if path != from_file && seen.insert(path.clone()) {
                        deps.push(path);
                    }
                }
                ResolutionOutcome::Unresolved(reason) => {
                    tracing::trace!(
                        file = %from_file.display(),
                        reference = %reference,
                        reason = %reason,
                        "dropping unresolved dependency reference"
                    );
                }
            }
        }
        deps
    }
}

/// Lexically normalize a path: drop `.` components and fold `..` into its parent.
/// Does not touch the filesystem, so it works for paths that no longer exist.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(out.components().next_back(), Some(Component::Normal(_)))
                    && out.pop();
                if !popped && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}
