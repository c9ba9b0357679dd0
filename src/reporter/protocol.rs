//! Wire shapes of the NDJSON event stream. Every line is an [`Envelope`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::WatchError;
use crate::validator::{ValidationKind, ValidationResult, ValidationStatus};
use crate::watcher::WatcherStatus;

/// The closed vocabulary of event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    FileEvent,
    ValidationResult,
    Error,
    Heartbeat,
    Status,
    Metrics,
    BatchResult,
    AggregatedStats,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FileEvent => "file-event",
            Self::ValidationResult => "validation-result",
            Self::Error => "error",
            Self::Heartbeat => "heartbeat",
            Self::Status => "status",
            Self::Metrics => "metrics",
            Self::BatchResult => "batch-result",
            Self::AggregatedStats => "aggregated-stats",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize)]
pub struct Envelope<'a, T: Serialize> {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub timestamp: DateTime<Utc>,
    pub data: &'a T,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorData {
    pub message: String,
    /// Taxonomy name, e.g. `FilesystemError`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl From<&WatchError> for ErrorData {
    fn from(err: &WatchError) -> Self {
        Self {
            message: err.to_string(),
            error: Some(err.kind().to_owned()),
            context: err.context(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatData {
    /// Milliseconds since the watcher started.
    pub uptime: u64,
    pub files_watched: usize,
    pub validations_run: u64,
    pub errors_count: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusData {
    pub status: WatcherStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub watched_paths: Vec<PathBuf>,
    pub active_validations: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    /// Resident bytes.
    pub used: u64,
    /// Virtual bytes.
    pub total: u64,
    pub external: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsData {
    pub total_validations: u64,
    /// Mean validation duration in milliseconds.
    pub average_validation_time: f64,
    pub validations_by_type: BTreeMap<String, u64>,
    /// Share of results with status `error`, in `[0, 1]`.
    pub error_rate: f64,
    /// Validations per second since start.
    pub throughput: f64,
    pub memory_usage: MemoryUsage,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFileSummary {
    pub file_path: PathBuf,
    pub status: ValidationStatus,
    pub validation_type: ValidationKind,
    pub error_count: usize,
    pub warning_count: usize,
    pub duration: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResultData {
    pub batch_id: String,
    pub files_processed: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub warning_count: usize,
    /// Milliseconds from dispatch to completion.
    pub processing_time: u64,
    pub results: Vec<BatchFileSummary>,
}

impl BatchResultData {
    pub fn summarize(batch_id: String, results: &[ValidationResult], processing_time: u64) -> Self {
        let count = |status: ValidationStatus| results.iter().filter(|r| r.status == status).count();
        Self {
            batch_id,
            files_processed: results.len(),
            success_count: count(ValidationStatus::Success),
            error_count: count(ValidationStatus::Error),
            warning_count: count(ValidationStatus::Warning),
            processing_time,
            results: results
                .iter()
                .map(|r| BatchFileSummary {
                    file_path: r.file_path.clone(),
                    status: r.status,
                    validation_type: r.validation_type,
                    error_count: r.errors.len(),
                    warning_count: r.warnings.len(),
                    duration: r.duration,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopFile {
    pub path: String,
    pub validation_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedStatsData {
    pub total_validations: u64,
    pub total_errors: u64,
    pub total_warnings: u64,
    pub file_path_stats: BTreeMap<String, u64>,
    pub validation_type_stats: BTreeMap<String, u64>,
    pub top_error_files: Vec<TopFile>,
}
