use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a raw filesystem notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileEventKind {
    Add,
    Change,
    Unlink,
    AddDir,
    UnlinkDir,
}

impl FileEventKind {
    pub fn is_directory(self) -> bool {
        matches!(self, Self::AddDir | Self::UnlinkDir)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Change => "change",
            Self::Unlink => "unlink",
            Self::AddDir => "addDir",
            Self::UnlinkDir => "unlinkDir",
        }
    }
}

/// Stat snapshot taken by the event source when the event was observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub size: u64,
    pub mtime: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctime: Option<DateTime<Utc>>,
}

impl FileStat {
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        Self {
            size: metadata.len(),
            mtime: metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now()),
            ctime: metadata.created().ok().map(DateTime::<Utc>::from),
        }
    }
}

/// One raw filesystem event, as delivered by an event source. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    #[serde(rename = "type")]
    pub kind: FileEventKind,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<FileStat>,
    pub timestamp: DateTime<Utc>,
}

impl FileEvent {
    pub fn new(kind: FileEventKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            stats: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_stats(mut self, stats: FileStat) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Copy of this event with its path expressed relative to `base`.
    /// Paths outside `base` are kept as they are.
    pub fn relative_to(&self, base: &Path) -> Self {
        let path = self
            .path
            .strip_prefix(base)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| self.path.clone());
        Self {
            path,
            ..self.clone()
        }
    }
}
