use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::{
    DependencyMap, Severity, ValidationError, ValidationKind, ValidationResult, Validator,
};
use crate::config::ValidationSettings;
use crate::error::{Result, WatchError};

/// `<file>:<line>:<column>` location embedded in a diagnostic line.
static LOCATION: OnceLock<Regex> = OnceLock::new();

fn location_re() -> &'static Regex {
    LOCATION.get_or_init(|| Regex::new(r":(\d+):(\d+)").expect("invalid location regex"))
}

/// Runs an external checker once per file (e.g. `cue vet`), with the file path appended
/// as the last argument.
///
/// Exit status 0 means success; every non-empty stderr line becomes a diagnostic, an
/// error when the command failed and a warning otherwise. At most
/// `parallel_validations` processes run at once.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    program: String,
    args: Vec<String>,
    permits: Semaphore,
    enable_contracts: bool,
}

impl CommandValidator {
    pub fn new(argv: &[String], settings: &ValidationSettings) -> Result<Self> {
        let Some((program, args)) = argv.split_first() else {
            return Err(WatchError::Configuration(
                "validation.command must name a program".into(),
            ));
        };
        Ok(Self {
            inner: Arc::new(Inner {
                program: program.clone(),
                args: args.to_vec(),
                permits: Semaphore::new(settings.parallel_validations.max(1)),
                enable_contracts: settings.enable_contracts,
            }),
        })
    }

    /// Build from `validation.command`; a missing command is a configuration error.
    pub fn from_settings(settings: &ValidationSettings) -> Result<Self> {
        let argv = settings.command.as_deref().ok_or_else(|| {
            WatchError::Configuration("validation.command is required to run validations".into())
        })?;
        Self::new(argv, settings)
    }
}

impl Inner {
    async fn validate_one(&self, file: &Path, dependencies: Vec<PathBuf>) -> ValidationResult {
        let kind = ValidationKind::Schema;
        let Ok(_permit) = self.permits.acquire().await else {
            return ValidationResult::failure(file, kind, "validator has been shut down");
        };

        let started = Instant::now();
        debug!(program = %self.program, file = %file.display(), "running validation command");
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        let mut result = match output {
            Ok(output) => {
                let severity = if output.status.success() {
                    Severity::Warning
                } else {
                    Severity::Error
                };
                let mut result = ValidationResult::success(file, kind);
                let stderr = String::from_utf8_lossy(&output.stderr);
                for line in stderr.lines().map(str::trim).filter(|l| !l.is_empty()) {
                    result.push(diagnostic(kind, severity, line));
                }
                if !output.status.success() && result.errors.is_empty() {
                    let code = output.status.code().unwrap_or(-1);
                    result.push(ValidationError::new(
                        kind.as_str(),
                        Severity::Error,
                        format!("`{}` exited with status {code}", self.program),
                    ));
                }
                result.metadata = Some(json!({
                    "command": self.program,
                    "exitCode": output.status.code(),
                    "contracts": self.enable_contracts,
                }));
                result
            }
            Err(err) => {
                warn!(program = %self.program, error = %err, "failed to run validation command");
                ValidationResult::failure(
                    file,
                    kind,
                    format!("failed to run `{}`: {err}", self.program),
                )
            }
        };

        result.duration = started.elapsed().as_millis() as u64;
        result.dependencies = Some(dependencies);
        result
    }
}

fn diagnostic(kind: ValidationKind, severity: Severity, line: &str) -> ValidationError {
    let err = ValidationError::new(kind.as_str(), severity, line);
    match location_re().captures(line) {
        Some(caps) => match (caps[1].parse(), caps[2].parse()) {
            (Ok(l), Ok(c)) => err.at(l, c),
            _ => err,
        },
        None => err,
    }
}

#[async_trait]
impl Validator for CommandValidator {
    async fn validate_batch(
        &self,
        files: &[PathBuf],
        dependency_map: &DependencyMap,
    ) -> Result<Vec<ValidationResult>> {
        let mut tasks = JoinSet::new();
        for (position, file) in files.iter().enumerate() {
            let inner = Arc::clone(&self.inner);
            let file = file.clone();
            let deps = dependency_map.get(&file).cloned().unwrap_or_default();
            tasks.spawn(async move { (position, inner.validate_one(&file, deps).await) });
        }

        let mut results = Vec::with_capacity(files.len());
        while let Some(joined) = tasks.join_next().await {
            let (position, result) = joined
                .map_err(|err| WatchError::engine(format!("validation task failed: {err}")))?;
            results.push((position, result));
        }
        results.sort_by_key(|(position, _)| *position);
        Ok(results.into_iter().map(|(_, r)| r).collect())
    }

    async fn shutdown(&self) {
        self.inner.permits.close();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::validator::ValidationStatus;

    fn validator(script: &str) -> CommandValidator {
        let argv = vec!["sh".into(), "-c".into(), script.into(), "sh".into()];
        CommandValidator::new(&argv, &ValidationSettings::default()).unwrap()
    }

    #[tokio::test]
    async fn test_success_and_failure_mapped_per_file() {
        let v = validator(r#"case "$1" in *bad*) echo "$1:2:5: conflicting values" >&2; exit 1;; esac"#);
        let files = vec![PathBuf::from("good.cue"), PathBuf::from("bad.cue")];
        let mut deps = DependencyMap::new();
        deps.insert(PathBuf::from("bad.cue"), vec![PathBuf::from("base.cue")]);

        let results = v.validate_batch(&files, &deps).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].file_path, PathBuf::from("good.cue"), "input order kept");
        assert_eq!(results[0].status, ValidationStatus::Success);

        let bad = &results[1];
        assert_eq!(bad.status, ValidationStatus::Error);
        assert_eq!(bad.errors.len(), 1);
        assert_eq!(bad.errors[0].line, Some(2));
        assert_eq!(bad.errors[0].column, Some(5));
        assert_eq!(bad.dependencies.as_deref(), Some(&[PathBuf::from("base.cue")][..]));
        assert_eq!(bad.metadata.as_ref().unwrap()["exitCode"], 1);
    }

    #[tokio::test]
    async fn test_stderr_on_success_is_warning() {
        let v = validator("echo 'field is deprecated' >&2");
        let results = v
            .validate_batch(&[PathBuf::from("a.cue")], &DependencyMap::new())
            .await
            .unwrap();
        assert_eq!(results[0].status, ValidationStatus::Warning);
        assert_eq!(results[0].warnings[0].message, "field is deprecated");
    }

    #[tokio::test]
    async fn test_silent_failure_still_reports_an_error() {
        let v = validator("exit 3");
        let results = v
            .validate_batch(&[PathBuf::from("a.cue")], &DependencyMap::new())
            .await
            .unwrap();
        assert_eq!(results[0].status, ValidationStatus::Error);
        assert!(results[0].errors[0].message.contains("status 3"));
    }

    #[tokio::test]
    async fn test_missing_program_yields_error_result() {
        let argv = vec!["definitely-not-a-real-binary-4d1f".to_owned()];
        let v = CommandValidator::new(&argv, &ValidationSettings::default()).unwrap();
        let results = v
            .validate_batch(&[PathBuf::from("a.cue")], &DependencyMap::new())
            .await
            .unwrap();
        assert_eq!(results[0].status, ValidationStatus::Error);
        assert!(results[0].errors[0].message.contains("failed to run"));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let v = validator("true");
        v.shutdown().await;
        let results = v
            .validate_batch(&[PathBuf::from("a.cue")], &DependencyMap::new())
            .await
            .unwrap();
        assert_eq!(results[0].status, ValidationStatus::Error);
    }

    #[test]
    fn test_from_settings_requires_command() {
        let err = CommandValidator::from_settings(&ValidationSettings::default()).unwrap_err();
        assert!(matches!(err, WatchError::Configuration(_)));
    }
}
