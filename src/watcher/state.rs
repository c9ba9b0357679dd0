use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Result, WatchError};
use crate::reporter::protocol::{MemoryUsage, MetricsData};
use crate::validator::{ValidationResult, ValidationStatus};

/// Lifecycle of a watcher.
///
/// ```text
/// starting -> running -> stopping -> stopped
///     \__________\___________\________> error (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl WatcherStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use WatcherStatus::*;
        matches!(
            (self, next),
            (Starting, Running) | (Running, Stopping) | (Stopping, Stopped)
        ) || (next == Error && self != Error)
    }
}

impl std::fmt::Display for WatcherStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable snapshot of a watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherState {
    pub status: WatcherStatus,
    pub start_time: DateTime<Utc>,
    pub watched_paths: Vec<PathBuf>,
    pub files_watched: usize,
    pub validations_run: u64,
    pub errors_count: u64,
    pub active_validations: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl WatcherState {
    pub fn new(watched_paths: Vec<PathBuf>) -> Self {
        Self {
            status: WatcherStatus::Starting,
            start_time: Utc::now(),
            watched_paths,
            files_watched: 0,
            validations_run: 0,
            errors_count: 0,
            active_validations: 0,
            last_heartbeat: None,
        }
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: WatcherStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(WatchError::InvalidTransition {
                from: self.status.as_str(),
                to: next.as_str(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Milliseconds since `start_time`.
    pub fn uptime_ms(&self) -> u64 {
        (Utc::now() - self.start_time).num_milliseconds().max(0) as u64
    }
}

/// Accumulates per-result statistics for `metrics` events.
#[derive(Debug, Default)]
pub struct MetricsTracker {
    total: u64,
    errors: u64,
    total_duration_ms: u64,
    by_type: BTreeMap<String, u64>,
}

impl MetricsTracker {
    pub fn record(&mut self, result: &ValidationResult) {
        self.total += 1;
        self.total_duration_ms += result.duration;
        if result.status == ValidationStatus::Error {
            self.errors += 1;
        }
        *self
            .by_type
            .entry(result.validation_type.as_str().to_owned())
            .or_default() += 1;
    }

    pub fn snapshot(&self, uptime_ms: u64) -> MetricsData {
        let ratio = |n: u64, d: u64| if d == 0 { 0.0 } else { n as f64 / d as f64 };
        MetricsData {
            total_validations: self.total,
            average_validation_time: ratio(self.total_duration_ms, self.total),
            validations_by_type: self.by_type.clone(),
            error_rate: ratio(self.errors, self.total),
            throughput: if uptime_ms == 0 {
                0.0
            } else {
                self.total as f64 * 1000.0 / uptime_ms as f64
            },
            memory_usage: memory_usage(),
        }
    }
}

/// Process memory from `/proc/self/statm`. Zeros where that file does not exist.
pub fn memory_usage() -> MemoryUsage {
    // statm counts pages; 4 KiB pages are assumed.
    const PAGE_SIZE: u64 = 4096;
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return MemoryUsage::default();
    };
    let mut fields = statm.split_whitespace().map(|f| f.parse::<u64>().unwrap_or(0));
    let total = fields.next().unwrap_or(0) * PAGE_SIZE;
    let used = fields.next().unwrap_or(0) * PAGE_SIZE;
    MemoryUsage {
        used,
        total,
        external: 0,
    }
}
