use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::detector::resolve::normalize_path;
use crate::error::{Result, WatchError};
use crate::reporter::EventFilter;

/// Default config file name looked up in the working directory by the CLI.
pub const CONFIG_FILE: &str = "arbiter-watch.toml";

/// Dependency-reference statement forms recognised out of the box.
/// Capture group 1 is the raw reference.
const DEFAULT_DEPENDENCY_PATTERNS: &[&str] = &[
    // `import "./schemas/base"` / `import x from './x'`
    r#"(?:from|import)\s+["']([^"']+)["']"#,
    // entries of a CUE import block: `    base "./base"`
    r#"(?m)^\s*(?:[A-Za-z_][A-Za-z0-9_]*\s+)?"(\.{1,2}/[^"]+)"\s*$"#,
    // JSON schema references
    r##""\$ref"\s*:\s*"([^"#]+)"##,
    // YAML references
    r#"\$ref:\s*["']?([^"'#\s]+)"#,
];

const DEFAULT_EXTENSIONS: &[&str] = &["cue", "json", "yaml", "yml"];

/// Full configuration of one watcher instance, loaded from `arbiter-watch.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatcherConfig {
    /// Root directories (or files) to watch. The first root is the base for relative paths.
    pub watch_paths: Vec<PathBuf>,
    pub watch_options: WatchOptions,
    pub validation: ValidationSettings,
    pub output: OutputSettings,
    pub heartbeat: HeartbeatSettings,
    pub metrics: MetricsSettings,
    pub detection: DetectionConfig,
    /// How long `stop()` waits for in-flight validations before tearing down.
    pub shutdown_grace_ms: u64,
    /// Where to write the final watcher state on shutdown. Best-effort.
    pub state_file: Option<PathBuf>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            watch_paths: vec![PathBuf::from(".")],
            watch_options: WatchOptions::default(),
            validation: ValidationSettings::default(),
            output: OutputSettings::default(),
            heartbeat: HeartbeatSettings::default(),
            metrics: MetricsSettings::default(),
            detection: DetectionConfig::default(),
            shutdown_grace_ms: 10_000,
            state_file: None,
        }
    }
}

/// Options forwarded to the filesystem event source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchOptions {
    /// Glob patterns the event source never reports.
    pub ignored: Vec<String>,
    /// Skip `add` events for files present before the watcher started.
    pub ignore_initial: bool,
    pub follow_symlinks: bool,
    /// Maximum directory depth below each root. `None` means unlimited.
    pub depth: Option<usize>,
    /// Hold add/change events until the file size stops changing.
    pub await_write_finish: Option<AwaitWriteFinish>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AwaitWriteFinish {
    pub stability_threshold_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for AwaitWriteFinish {
    fn default() -> Self {
        Self {
            stability_threshold_ms: 200,
            poll_interval_ms: 50,
        }
    }
}

/// Debounce, batching and validator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidationSettings {
    /// Quiescent interval per path before a change is processed.
    pub debounce_ms: u64,
    /// Maximum number of files handed to the validator in one call.
    pub batch_size: usize,
    /// Upper bound for one `validate_batch` call.
    pub timeout_ms: u64,
    pub enable_contracts: bool,
    /// Compute per-file dependency chains for the validator.
    pub enable_dependency_check: bool,
    /// Concurrency cap honoured by the validator itself.
    pub parallel_validations: usize,
    /// External command (argv) run by the command validator, the file path is appended.
    pub command: Option<Vec<String>>,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 300,
            batch_size: 10,
            timeout_ms: 30_000,
            enable_contracts: true,
            enable_dependency_check: true,
            parallel_validations: 4,
            command: None,
        }
    }
}

impl ValidationSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Wire format of the output stream. Only newline-delimited JSON is supported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    #[serde(alias = "jsonl", alias = "json")]
    Ndjson,
}

/// Where the output stream goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputDestination {
    Stdout,
    Stderr,
    File(PathBuf),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputSettings {
    pub format: OutputFormat,
    /// `"stdout"`, `"stderr"`, or a file path (appended to).
    pub destination: String,
    /// Number of buffered events that triggers a synchronous flush.
    pub buffer_size: usize,
    pub flush_interval_ms: u64,
    /// Include filters: `/regex/` or a plain substring, matched against the serialized line.
    pub include: Vec<String>,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            format: OutputFormat::Ndjson,
            destination: "stdout".to_owned(),
            buffer_size: 10,
            flush_interval_ms: 100,
            include: Vec::new(),
        }
    }
}

impl OutputSettings {
    pub fn destination(&self) -> OutputDestination {
        match self.destination.as_str() {
            "stdout" | "-" => OutputDestination::Stdout,
            "stderr" => OutputDestination::Stderr,
            other => OutputDestination::File(PathBuf::from(other)),
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeartbeatSettings {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
        }
    }
}

impl HeartbeatSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 60_000,
        }
    }
}

impl MetricsSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Settings of the change detector: what is tracked and how dependencies are found.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectionConfig {
    /// File extensions (without the dot) that are tracked.
    pub extensions: Vec<String>,
    /// Glob patterns excluded from tracking.
    pub exclude: Vec<String>,
    /// Ordered regexes locating dependency references; capture group 1 is the reference.
    pub dependency_patterns: Vec<String>,
    /// Extensions tried when a reference has none.
    pub resolve_extensions: Vec<String>,
    /// Hash file contents; otherwise mtime + size decide whether a file changed.
    pub track_content: bool,
    /// Maximum number of cached file states.
    pub cache_size: usize,
    /// Treat every content change as a full validation, even with an unchanged dependency set.
    pub full_on_content_change: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            extensions: DEFAULT_EXTENSIONS.iter().map(|s| (*s).to_owned()).collect(),
            exclude: vec!["**/node_modules/**".to_owned(), "**/.git/**".to_owned()],
            dependency_patterns: DEFAULT_DEPENDENCY_PATTERNS
                .iter()
                .map(|s| (*s).to_owned())
                .collect(),
            resolve_extensions: DEFAULT_EXTENSIONS.iter().map(|s| (*s).to_owned()).collect(),
            track_content: true,
            cache_size: 10_000,
            full_on_content_change: false,
        }
    }
}

impl WatcherConfig {
    /// Load configuration from a TOML file and validate it.
    ///
    /// Unlike the default lookup in the CLI, an explicitly named file that is missing or
    /// malformed is a [`WatchError::Configuration`].
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|err| {
            WatchError::Configuration(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&contents)
            .map_err(|err| WatchError::Configuration(format!("{}: {err}", path.display())))
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|err| WatchError::Configuration(format!("failed to parse config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every setting. All problems are reported together.
    pub fn validate(&self) -> Result<()> {
        let mut problems: Vec<String> = Vec::new();

        if self.watch_paths.is_empty() {
            problems.push("watch_paths must not be empty".into());
        }
        if self.watch_paths.iter().any(|p| p.as_os_str().is_empty()) {
            problems.push("watch_paths must not contain empty paths".into());
        }

        check_globs("watch_options.ignored", &self.watch_options.ignored, &mut problems);
        if let Some(awf) = &self.watch_options.await_write_finish {
            if awf.stability_threshold_ms == 0 || awf.poll_interval_ms == 0 {
                problems.push(
                    "watch_options.await_write_finish intervals must be greater than zero".into(),
                );
            }
        }

        let v = &self.validation;
        if v.batch_size == 0 {
            problems.push("validation.batch_size must be at least 1".into());
        }
        if v.timeout_ms == 0 {
            problems.push("validation.timeout_ms must be greater than zero".into());
        }
        if v.parallel_validations == 0 {
            problems.push("validation.parallel_validations must be at least 1".into());
        }
        if let Some(cmd) = &v.command {
            if cmd.first().is_none_or(|program| program.trim().is_empty()) {
                problems.push("validation.command must name a program".into());
            }
        }

        let o = &self.output;
        if o.buffer_size == 0 {
            problems.push("output.buffer_size must be at least 1".into());
        }
        if o.flush_interval_ms == 0 {
            problems.push("output.flush_interval_ms must be greater than zero".into());
        }
        if o.destination.trim().is_empty() {
            problems.push("output.destination must not be empty".into());
        }
        for pattern in &o.include {
            if let Err(err) = EventFilter::parse(pattern) {
                problems.push(format!("output.include: {err}"));
            }
        }

        if self.heartbeat.enabled && self.heartbeat.interval_ms == 0 {
            problems.push("heartbeat.interval_ms must be greater than zero".into());
        }
        if self.metrics.enabled && self.metrics.interval_ms == 0 {
            problems.push("metrics.interval_ms must be greater than zero".into());
        }

        let d = &self.detection;
        if d.extensions.is_empty() {
            problems.push("detection.extensions must not be empty".into());
        }
        if d.cache_size == 0 {
            problems.push("detection.cache_size must be at least 1".into());
        }
        check_globs("detection.exclude", &d.exclude, &mut problems);
        for pattern in &d.dependency_patterns {
            match Regex::new(pattern) {
                Ok(re) if re.captures_len() < 2 => problems.push(format!(
                    "detection.dependency_patterns: `{pattern}` has no capture group"
                )),
                Ok(_) => {}
                Err(err) => problems.push(format!("detection.dependency_patterns: {err}")),
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(WatchError::Configuration(problems.join("; ")))
        }
    }

    /// The directory every emitted path is relativized against: the first
    /// watch path made absolute, or its parent when it names a single file.
    pub fn base_path(&self) -> PathBuf {
        let first = self
            .watch_paths
            .first()
            .map(PathBuf::as_path)
            .unwrap_or_else(|| Path::new("."));
        let root = normalize_path(&std::path::absolute(first).unwrap_or_else(|_| first.to_path_buf()));
        if root.is_file() {
            if let Some(parent) = root.parent() {
                return parent.to_path_buf();
            }
        }
        root
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn check_globs(field: &str, patterns: &[String], problems: &mut Vec<String>) {
    for pattern in patterns {
        if let Err(err) = glob::Pattern::new(pattern) {
            problems.push(format!("{field}: `{pattern}`: {err}"));
        }
    }
}
