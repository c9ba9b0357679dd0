//! Orchestrator tests: a scripted event source and validator drive a real `Watcher`
//! on paused time, and the NDJSON stream is captured in memory.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use arbiter_watch::validator::{DependencyMap, ValidationKind};
use arbiter_watch::{
    EventSource, FileEvent, FileEventKind, SourceMessage, StreamReporter, ValidationResult,
    Validator, WatchError, Watcher, WatcherConfig, WatcherStatus,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Capture {
    fn events(&self) -> Vec<Value> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn of_type(&self, kind: &str) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter(|e| e["type"] == kind)
            .collect()
    }

    fn types(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|e| e["type"].as_str().unwrap().to_owned())
            .collect()
    }
}

/// Sends the scripted initial events and `Ready` on subscribe; live events are pushed
/// through [`SourceControl`].
struct FakeSource {
    initial: Vec<SourceMessage>,
    control: SourceControl,
}

#[derive(Clone, Default)]
struct SourceControl {
    tx: Arc<Mutex<Option<mpsc::Sender<SourceMessage>>>>,
    closed: Arc<Mutex<bool>>,
}

impl SourceControl {
    fn send(&self, kind: FileEventKind, path: &Path) {
        let tx = self.tx.lock().unwrap().clone().expect("source subscribed");
        tx.try_send(SourceMessage::Event(FileEvent::new(kind, path)))
            .unwrap();
    }

    fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

impl EventSource for FakeSource {
    fn subscribe(
        &mut self,
        _roots: &[PathBuf],
        tx: mpsc::Sender<SourceMessage>,
    ) -> arbiter_watch::Result<()> {
        for message in self.initial.drain(..) {
            tx.try_send(message).unwrap();
        }
        tx.try_send(SourceMessage::Ready).unwrap();
        *self.control.tx.lock().unwrap() = Some(tx);
        Ok(())
    }

    fn close(&mut self) {
        *self.control.closed.lock().unwrap() = true;
        self.control.tx.lock().unwrap().take();
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    Succeed,
    Hang,
    /// Return results for every file except those named `skip.cue`.
    OmitSkipped,
}

#[derive(Clone)]
struct ScriptedValidator {
    mode: Mode,
    calls: Arc<Mutex<Vec<(Vec<PathBuf>, DependencyMap)>>>,
}

impl ScriptedValidator {
    fn new(mode: Mode) -> Self {
        Self {
            mode,
            calls: Arc::default(),
        }
    }

    fn batches(&self) -> Vec<BTreeSet<PathBuf>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(files, _)| files.iter().cloned().collect())
            .collect()
    }
}

#[async_trait]
impl Validator for ScriptedValidator {
    async fn validate_batch(
        &self,
        files: &[PathBuf],
        dependency_map: &DependencyMap,
    ) -> arbiter_watch::Result<Vec<ValidationResult>> {
        self.calls
            .lock()
            .unwrap()
            .push((files.to_vec(), dependency_map.clone()));
        match self.mode {
            Mode::Hang => std::future::pending().await,
            Mode::Succeed => Ok(files
                .iter()
                .map(|f| ValidationResult::success(f, ValidationKind::Schema))
                .collect()),
            Mode::OmitSkipped => Ok(files
                .iter()
                .filter(|f| !f.ends_with("skip.cue"))
                .map(|f| ValidationResult::success(f, ValidationKind::Schema))
                .collect()),
        }
    }
}

struct Harness {
    dir: tempfile::TempDir,
    config: WatcherConfig,
    capture: Capture,
    control: SourceControl,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = WatcherConfig::default();
        config.watch_paths = vec![dir.path().to_path_buf()];
        config.heartbeat.enabled = false;
        config.output.buffer_size = 1;
        config.shutdown_grace_ms = 500;
        Self {
            dir,
            config,
            capture: Capture::default(),
            control: SourceControl::default(),
        }
    }

    fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    fn watcher(&self, validator: &ScriptedValidator, initial: Vec<PathBuf>) -> Watcher {
        let initial = initial
            .into_iter()
            .map(|p| SourceMessage::Event(FileEvent::new(FileEventKind::Add, p)))
            .collect();
        self.watcher_with(validator, initial)
    }

    fn watcher_with(&self, validator: &ScriptedValidator, initial: Vec<SourceMessage>) -> Watcher {
        let source = FakeSource {
            initial,
            control: self.control.clone(),
        };
        let reporter =
            StreamReporter::new(Box::new(self.capture.clone()), &self.config.output).unwrap();
        Watcher::new(
            self.config.clone(),
            Arc::new(validator.clone()),
            Box::new(source),
            reporter,
        )
        .unwrap()
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_secs(2)).await;
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_lifecycle_statuses_in_order() {
    let h = Harness::new();
    let validator = ScriptedValidator::new(Mode::Succeed);
    let handle = h.watcher(&validator, Vec::new()).start().await.unwrap();
    assert_eq!(handle.state().status, WatcherStatus::Running);

    let final_state = handle.stop().await.unwrap();
    assert_eq!(final_state.status, WatcherStatus::Stopped);
    assert!(h.control.is_closed(), "source closed on shutdown");

    let statuses: Vec<String> = h
        .capture
        .of_type("status")
        .iter()
        .map(|e| e["data"]["status"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(statuses, vec!["starting", "running", "stopping", "stopped"]);
}

#[tokio::test(start_paused = true)]
async fn test_missing_root_fails_start() {
    let mut h = Harness::new();
    h.config.watch_paths = vec![h.dir.path().join("missing")];
    let validator = ScriptedValidator::new(Mode::Succeed);

    let err = h.watcher(&validator, Vec::new()).start().await.unwrap_err();
    assert_eq!(err.kind(), "FilesystemError");

    let statuses: Vec<String> = h
        .capture
        .of_type("status")
        .iter()
        .map(|e| e["data"]["status"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(statuses, vec!["starting", "error"]);
    assert_eq!(h.capture.of_type("error")[0]["data"]["error"], "FilesystemError");
    assert!(validator.batches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_source_error_before_ready_fails_start() {
    let h = Harness::new();
    let validator = ScriptedValidator::new(Mode::Succeed);
    let watcher = h.watcher_with(
        &validator,
        vec![SourceMessage::Error(WatchError::Source("inotify limit".into()))],
    );

    let err = watcher.start().await.unwrap_err();
    assert_eq!(err.kind(), "SourceError");
    assert!(h.control.is_closed());
}

#[test]
fn test_invalid_config_rejected_by_new() {
    let h = Harness::new();
    let mut config = h.config.clone();
    config.validation.batch_size = 0;
    let reporter = StreamReporter::new(Box::new(h.capture.clone()), &config.output).unwrap();
    let source = FakeSource {
        initial: Vec::new(),
        control: h.control.clone(),
    };

    let result = Watcher::new(
        config,
        Arc::new(ScriptedValidator::new(Mode::Succeed)),
        Box::new(source),
        reporter,
    );
    let Err(err) = result else {
        panic!("batch_size = 0 must be rejected");
    };
    assert_eq!(err.kind(), "ConfigurationError");
}

// ---------------------------------------------------------------------------
// Initial pass and change handling
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_initial_pass_validates_existing_files_once() {
    let h = Harness::new();
    let base = h.write("base.cue", "base: 1\n");
    let app = h.write("app.cue", "import \"./base.cue\"\n");
    let validator = ScriptedValidator::new(Mode::Succeed);

    let handle = h
        .watcher(&validator, vec![base.clone(), app.clone()])
        .start()
        .await
        .unwrap();
    settle().await;

    let batches = validator.batches();
    assert_eq!(batches.len(), 1, "one initial batch: {batches:?}");
    assert_eq!(batches[0], BTreeSet::from([base.clone(), app.clone()]));
    assert!(h.capture.of_type("file-event").is_empty(), "initial adds are not streamed");

    let calls = validator.calls.lock().unwrap().clone();
    assert_eq!(calls[0].1[&app], vec![base.clone()], "dependency chain handed over");

    let state = handle.stop().await.unwrap();
    assert_eq!(state.validations_run, 2);
    assert_eq!(state.files_watched, 2);
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_changes_debounced_to_one_validation() {
    let h = Harness::new();
    let file = h.write("a.cue", "a: 1\n");
    let validator = ScriptedValidator::new(Mode::Succeed);
    let handle = h.watcher(&validator, Vec::new()).start().await.unwrap();

    for _ in 0..5 {
        h.control.send(FileEventKind::Change, &file);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    settle().await;

    assert_eq!(validator.batches(), vec![BTreeSet::from([file.clone()])]);
    let file_events = h.capture.of_type("file-event");
    assert_eq!(file_events.len(), 1);
    assert_eq!(file_events[0]["data"]["path"], "a.cue");
    assert_eq!(file_events[0]["data"]["type"], "change");

    handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_change_revalidates_dependents() {
    let h = Harness::new();
    let base = h.write("base.cue", "base: 1\n");
    let app = h.write("app.cue", "import \"./base.cue\"\n");
    let lone = h.write("lone.cue", "lone: 1\n");
    let validator = ScriptedValidator::new(Mode::Succeed);
    let handle = h
        .watcher(&validator, vec![base.clone(), app.clone(), lone])
        .start()
        .await
        .unwrap();
    settle().await;

    fs::write(&base, "base: 2\n").unwrap();
    h.control.send(FileEventKind::Change, &base);
    settle().await;

    let batches = validator.batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[1], BTreeSet::from([base, app]));

    handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_content_is_not_revalidated() {
    let h = Harness::new();
    let file = h.write("a.cue", "a: 1\n");
    let validator = ScriptedValidator::new(Mode::Succeed);
    let handle = h
        .watcher(&validator, vec![file.clone()])
        .start()
        .await
        .unwrap();
    settle().await;

    h.control.send(FileEventKind::Change, &file);
    settle().await;

    assert_eq!(validator.batches().len(), 1, "only the initial pass ran");
    assert_eq!(h.capture.of_type("file-event").len(), 1);
    handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_batches_split_by_batch_size() {
    let mut h = Harness::new();
    h.config.validation.batch_size = 2;
    let files: Vec<PathBuf> = (0..5)
        .map(|i| h.write(&format!("f{i}.cue"), "x: 1\n"))
        .collect();
    let validator = ScriptedValidator::new(Mode::Succeed);
    let handle = h.watcher(&validator, files).start().await.unwrap();
    settle().await;

    let mut sizes: Vec<usize> = validator.batches().iter().map(BTreeSet::len).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![1, 2, 2]);
    assert_eq!(h.capture.of_type("batch-result").len(), 3);
    handle.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_results_then_batch_summary_then_stats() {
    let h = Harness::new();
    let files: Vec<PathBuf> = ["a.cue", "b.cue", "c.cue"]
        .iter()
        .map(|name| h.write(name, "x: 1\n"))
        .collect();
    let validator = ScriptedValidator::new(Mode::Succeed);
    let handle = h.watcher(&validator, files).start().await.unwrap();
    settle().await;

    let sequence: Vec<String> = h
        .capture
        .types()
        .into_iter()
        .filter(|t| {
            matches!(
                t.as_str(),
                "validation-result" | "batch-result" | "aggregated-stats"
            )
        })
        .collect();
    assert_eq!(
        sequence,
        vec![
            "validation-result",
            "validation-result",
            "validation-result",
            "batch-result",
            "aggregated-stats"
        ]
    );

    let summary = &h.capture.of_type("batch-result")[0]["data"];
    assert_eq!(summary["filesProcessed"], 3);
    assert_eq!(summary["successCount"], 3);
    let stats = &h.capture.of_type("aggregated-stats")[0]["data"];
    assert_eq!(stats["totalValidations"], 3);

    handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_missing_result_reported_as_engine_error() {
    let h = Harness::new();
    let ok = h.write("ok.cue", "x: 1\n");
    let skipped = h.write("skip.cue", "x: 1\n");
    let validator = ScriptedValidator::new(Mode::OmitSkipped);
    let handle = h
        .watcher(&validator, vec![ok, skipped.clone()])
        .start()
        .await
        .unwrap();
    settle().await;

    let errors = h.capture.of_type("error");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["data"]["error"], "ValidationEngineError");
    assert_eq!(
        errors[0]["data"]["context"]["filePath"],
        skipped.display().to_string()
    );
    assert_eq!(h.capture.of_type("validation-result").len(), 1);

    let state = handle.stop().await.unwrap();
    assert_eq!(state.errors_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_validator_timeout_reported() {
    let mut h = Harness::new();
    h.config.validation.timeout_ms = 200;
    let file = h.write("a.cue", "a: 1\n");
    let validator = ScriptedValidator::new(Mode::Hang);
    let handle = h
        .watcher(&validator, vec![file])
        .start()
        .await
        .unwrap();
    let mut errors = handle.subscribe_errors();

    let err = errors.recv().await.unwrap();
    assert_eq!(err.kind(), "ValidationEngineError");
    assert!(err.to_string().contains("timed out after 200ms"), "{err}");

    let state = handle.stop().await.unwrap();
    assert_eq!(state.active_validations, 0);
    assert_eq!(state.validations_run, 0);
    assert_eq!(h.capture.of_type("error").len(), 1);
}

#[cfg(unix)]
#[tokio::test(start_paused = true)]
async fn test_non_utf8_path_error_keeps_watcher_running() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let h = Harness::new();
    let validator = ScriptedValidator::new(Mode::Succeed);
    let handle = h.watcher(&validator, Vec::new()).start().await.unwrap();

    let gone = h.dir.path().join(OsStr::from_bytes(b"\xffgone.cue"));
    h.control.send(FileEventKind::Change, &gone);
    settle().await;

    assert!(!handle.is_finished());
    assert_eq!(handle.state().status, WatcherStatus::Running);
    assert_eq!(handle.state().errors_count, 1);
    let fs_errors: Vec<Value> = h
        .capture
        .of_type("error")
        .into_iter()
        .filter(|e| e["data"]["error"] == "FilesystemError")
        .collect();
    assert_eq!(fs_errors.len(), 1);
    let context = &fs_errors[0]["data"]["context"];
    assert_eq!(context["operation"], "stat");
    assert!(
        context["filePath"]
            .as_str()
            .unwrap()
            .ends_with("\u{FFFD}gone.cue"),
        "{context}"
    );

    let file = h.write("a.cue", "a: 1\n");
    h.control.send(FileEventKind::Change, &file);
    settle().await;
    assert_eq!(validator.batches(), vec![BTreeSet::from([file])]);

    let state = handle.stop().await.unwrap();
    assert_eq!(state.status, WatcherStatus::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_and_metrics_cadence() {
    let mut h = Harness::new();
    h.config.heartbeat.enabled = true;
    h.config.heartbeat.interval_ms = 1_000;
    h.config.metrics.enabled = true;
    h.config.metrics.interval_ms = 1_500;
    let file = h.write("a.cue", "a: 1\n");
    let validator = ScriptedValidator::new(Mode::Succeed);
    let handle = h.watcher(&validator, vec![file]).start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(3_100)).await;

    let heartbeats = h.capture.of_type("heartbeat");
    assert_eq!(heartbeats.len(), 3, "ticks at 1s, 2s and 3s");
    let beat = &heartbeats[2]["data"];
    assert_eq!(beat["filesWatched"], 1);
    assert_eq!(beat["validationsRun"], 1);
    assert_eq!(beat["errorsCount"], 0);
    assert!(beat["uptime"].is_u64());
    assert!(handle.state().last_heartbeat.is_some());

    let metrics = h.capture.of_type("metrics");
    assert_eq!(metrics.len(), 2, "ticks at 1.5s and 3s");
    let data = &metrics[1]["data"];
    assert_eq!(data["totalValidations"], 1);
    assert_eq!(data["validationsByType"]["schema"], 1);
    assert_eq!(data["errorRate"], 0.0);
    assert!(data["throughput"].is_number());
    assert!(data["averageValidationTime"].is_number());
    assert!(data["memoryUsage"]["used"].is_u64());

    handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_buffered_events_written_on_flush_interval() {
    let mut h = Harness::new();
    h.config.output.buffer_size = 10;
    h.config.output.flush_interval_ms = 100;
    let validator = ScriptedValidator::new(Mode::Succeed);
    let handle = h.watcher(&validator, Vec::new()).start().await.unwrap();
    assert!(h.capture.events().is_empty(), "below buffer_size nothing is written");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.capture.events().is_empty());

    tokio::time::sleep(Duration::from_millis(60)).await;
    let statuses: Vec<String> = h
        .capture
        .of_type("status")
        .iter()
        .map(|e| e["data"]["status"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(statuses, vec!["starting", "running"]);

    handle.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_stop_bounded_by_grace_with_hung_validator() {
    let h = Harness::new();
    let file = h.write("a.cue", "a: 1\n");
    let validator = ScriptedValidator::new(Mode::Hang);
    let handle = h
        .watcher(&validator, vec![file])
        .start()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(handle.state().active_validations, 1);

    let started = tokio::time::Instant::now();
    let state = handle.stop().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(state.status, WatcherStatus::Stopped);
    assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");
    assert!(h.capture.of_type("validation-result").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_pending_debounce_dropped_on_stop() {
    let h = Harness::new();
    let file = h.write("a.cue", "a: 1\n");
    let validator = ScriptedValidator::new(Mode::Succeed);
    let handle = h.watcher(&validator, Vec::new()).start().await.unwrap();

    h.control.send(FileEventKind::Change, &file);
    tokio::time::sleep(Duration::from_millis(10)).await;
    handle.stop().await.unwrap();

    assert!(validator.batches().is_empty());
    assert!(h.capture.of_type("file-event").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_state_snapshot_written_on_stop() {
    let mut h = Harness::new();
    let target = h.dir.path().join("state/watcher.json");
    h.config.state_file = Some(target.clone());
    let file = h.write("a.cue", "a: 1\n");
    let validator = ScriptedValidator::new(Mode::Succeed);
    let handle = h
        .watcher(&validator, vec![file])
        .start()
        .await
        .unwrap();
    settle().await;
    handle.stop().await.unwrap();

    let snapshot: Value = serde_json::from_str(&fs::read_to_string(target).unwrap()).unwrap();
    assert_eq!(snapshot["state"]["status"], "stopped");
    assert_eq!(snapshot["state"]["validationsRun"], 1);
    assert_eq!(snapshot["trackedFiles"], 1);
}
