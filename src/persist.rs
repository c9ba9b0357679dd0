use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Result, WatchError};
use crate::watcher::WatcherState;

/// Snapshot format version. Bump when the layout changes.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Final watcher state written on shutdown. Informational only: nothing reads it back
/// on start.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot<'a> {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub state: &'a WatcherState,
    pub tracked_files: usize,
    pub dependency_edges: usize,
}

/// Write `snapshot` as pretty JSON atomically: temp file in the target directory, then
/// rename. Creates the parent directory if needed.
pub fn save_snapshot(target: &Path, snapshot: &StateSnapshot<'_>) -> Result<()> {
    let dir = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| WatchError::filesystem("create_dir", dir, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| WatchError::filesystem("create", dir, e))?;
    serde_json::to_writer_pretty(&mut tmp, snapshot)
        .map_err(|e| WatchError::filesystem("write", target, e.into()))?;
    tmp.as_file()
        .flush()
        .map_err(|e| WatchError::filesystem("write", target, e))?;
    tmp.persist(target)
        .map_err(|e| WatchError::filesystem("rename", target, e.error))?;
    Ok(())
}
