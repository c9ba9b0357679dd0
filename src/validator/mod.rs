//! Validation results and the validator seam the orchestrator drives.

pub mod command;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

pub use command::CommandValidator;

/// Per-file transitive dependency lists handed to the validator with each batch.
pub type DependencyMap = HashMap<PathBuf, Vec<PathBuf>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Success,
    Error,
    Warning,
    Skipped,
}

/// Which kind of check produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationKind {
    Syntax,
    Semantic,
    Contract,
    Schema,
    Dependency,
}

impl ValidationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::Semantic => "semantic",
            Self::Contract => "contract",
            Self::Schema => "schema",
            Self::Dependency => "dependency",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// One diagnostic reported by the validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationError {
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl ValidationError {
    pub fn new(kind: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            severity,
            message: message.into(),
            line: None,
            column: None,
            offset: None,
            length: None,
            code: None,
            context: None,
        }
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }
}

/// Outcome of validating one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub file_path: PathBuf,
    pub status: ValidationStatus,
    pub validation_type: ValidationKind,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationError>,
    pub info: Vec<ValidationError>,
    /// Wall time in milliseconds.
    pub duration: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_results: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<PathBuf>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ValidationResult {
    /// A successful result with no diagnostics.
    pub fn success(file_path: impl Into<PathBuf>, kind: ValidationKind) -> Self {
        Self {
            file_path: file_path.into(),
            status: ValidationStatus::Success,
            validation_type: kind,
            errors: Vec::new(),
            warnings: Vec::new(),
            info: Vec::new(),
            duration: 0,
            timestamp: Utc::now(),
            contract_results: None,
            dependencies: None,
            metadata: None,
        }
    }

    /// A failed result carrying a single error diagnostic.
    pub fn failure(file_path: impl Into<PathBuf>, kind: ValidationKind, message: impl Into<String>) -> Self {
        let mut result = Self::success(file_path, kind);
        result.push(ValidationError::new(kind.as_str(), Severity::Error, message));
        result
    }

    /// Record a diagnostic in the list matching its severity and update `status`.
    /// Errors dominate warnings.
    pub fn push(&mut self, diagnostic: ValidationError) {
        match diagnostic.severity {
            Severity::Error => {
                self.status = ValidationStatus::Error;
                self.errors.push(diagnostic);
            }
            Severity::Warning => {
                if self.status == ValidationStatus::Success {
                    self.status = ValidationStatus::Warning;
                }
                self.warnings.push(diagnostic);
            }
            Severity::Info => self.info.push(diagnostic),
        }
    }

    pub fn is_for(&self, path: &Path) -> bool {
        self.file_path == path
    }
}

/// The content validator. Implementations may process a batch concurrently but must
/// return at most one result per input file.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate_batch(
        &self,
        files: &[PathBuf],
        dependency_map: &DependencyMap,
    ) -> Result<Vec<ValidationResult>>;

    /// Release held resources. Called once during shutdown.
    async fn shutdown(&self) {}
}
