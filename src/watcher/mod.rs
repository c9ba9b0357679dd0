//! The watch orchestrator: lifecycle, debouncing, batching and periodic reporting.
//!
//! One control task owns the detector, debouncer, aggregator and reporter and runs a
//! single `select!` loop over source messages, debounce expiries, batch completions,
//! timers and the shutdown signal. Validator calls run as tasks in a `JoinSet`.

pub mod debounce;
pub mod state;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{self, JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WatcherConfig;
use crate::detector::ChangeDetector;
use crate::detector::resolve::normalize_path;
use crate::error::{Result, WatchError};
use crate::event::FileEvent;
use crate::persist::{SNAPSHOT_VERSION, StateSnapshot, save_snapshot};
use crate::reporter::protocol::{BatchResultData, HeartbeatData, StatusData};
use crate::reporter::{Aggregator, EventType, StreamReporter};
use crate::source::{EventSource, SourceMessage};
use crate::validator::{DependencyMap, ValidationResult, Validator};

use debounce::Debouncer;
pub use state::{MetricsTracker, WatcherState, WatcherStatus};

/// Capacity of the channel between the event source and the control task.
const SOURCE_CHANNEL_CAPACITY: usize = 256;
const ERROR_CHANNEL_CAPACITY: usize = 64;

/// A configured, not yet started watcher.
pub struct Watcher {
    config: WatcherConfig,
    validator: Arc<dyn Validator>,
    source: Box<dyn EventSource>,
    reporter: StreamReporter,
}

impl Watcher {
    /// Validate `config` and assemble a watcher. Nothing is watched until [`Watcher::start`].
    pub fn new(
        config: WatcherConfig,
        validator: Arc<dyn Validator>,
        source: Box<dyn EventSource>,
        reporter: StreamReporter,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            validator,
            source,
            reporter,
        })
    }

    /// Start watching. Resolves once the source has finished its initial scan and the
    /// watcher is `running`; setup failures leave it in `error` and are returned.
    pub async fn start(self) -> Result<WatcherHandle> {
        let mut roots = Vec::with_capacity(self.config.watch_paths.len());
        for path in &self.config.watch_paths {
            let absolute =
                std::path::absolute(path).map_err(|e| WatchError::filesystem("stat", path, e))?;
            roots.push(normalize_path(&absolute));
        }
        let detector = ChangeDetector::new(&self.config.detection)?;

        let mut ctl = Controller::new(self, roots, detector);
        ctl.emit_status(None);
        info!(roots = ?ctl.roots, "starting watcher");

        for root in ctl.roots.clone() {
            if let Err(err) = std::fs::metadata(&root) {
                return Err(ctl.fail_start(WatchError::filesystem("stat", root, err)));
            }
        }

        let (tx, rx) = mpsc::channel(SOURCE_CHANNEL_CAPACITY);
        let roots = ctl.roots.clone();
        if let Err(err) = ctl.source.subscribe(&roots, tx) {
            return Err(ctl.fail_start(err));
        }

        let token = ctl.token.clone();
        let state = ctl.state_tx.subscribe();
        let errors = ctl.errors_tx.clone();
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(ctl.run(rx, ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => Ok(WatcherHandle {
                token,
                task,
                state,
                errors,
            }),
            Ok(Err(err)) => {
                let _ = task.await;
                Err(err)
            }
            Err(_) => Err(match task.await {
                Err(join_err) => WatchError::Fault(format!("watcher task failed: {join_err}")),
                Ok(_) => WatchError::Fault("watcher stopped before becoming ready".into()),
            }),
        }
    }
}

/// Handle to a running watcher.
#[derive(Debug)]
pub struct WatcherHandle {
    token: CancellationToken,
    task: JoinHandle<WatcherState>,
    state: watch::Receiver<WatcherState>,
    errors: broadcast::Sender<Arc<WatchError>>,
}

impl WatcherHandle {
    /// Request shutdown and wait for it: pending debounces are dropped, in-flight
    /// validations get up to `shutdown_grace_ms` to finish. Returns the final state.
    pub async fn stop(self) -> Result<WatcherState> {
        self.token.cancel();
        self.task
            .await
            .map_err(|err| WatchError::Fault(format!("watcher task failed: {err}")))
    }

    /// Latest published state.
    pub fn state(&self) -> WatcherState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WatcherState> {
        self.state.clone()
    }

    /// Every error the watcher handles locally, as it is reported.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<Arc<WatchError>> {
        self.errors.subscribe()
    }

    /// True once the control task has exited, e.g. after a fatal source failure.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

// ---------------------------------------------------------------------------
// Control task
// ---------------------------------------------------------------------------

struct PendingBatch {
    batch_id: String,
    files: Vec<PathBuf>,
}

struct BatchOutcome {
    result: Result<Vec<ValidationResult>>,
    elapsed: Duration,
}

enum Exit {
    Stop,
    Failed,
}

struct Controller {
    config: WatcherConfig,
    roots: Vec<PathBuf>,
    /// Directory every relative path is resolved against and reported relative to.
    base: PathBuf,
    validator: Arc<dyn Validator>,
    source: Box<dyn EventSource>,
    reporter: StreamReporter,
    detector: ChangeDetector,
    debouncer: Debouncer,
    aggregator: Aggregator,
    metrics: MetricsTracker,
    state: WatcherState,
    state_tx: watch::Sender<WatcherState>,
    errors_tx: broadcast::Sender<Arc<WatchError>>,
    token: CancellationToken,
    tasks: JoinSet<BatchOutcome>,
    batches: HashMap<task::Id, PendingBatch>,
    /// Files affected by events seen before the source was ready.
    initial: Vec<PathBuf>,
    initial_seen: HashSet<PathBuf>,
    heartbeat: Option<Interval>,
    metrics_tick: Option<Interval>,
    flush_tick: Option<Interval>,
}

impl Controller {
    fn new(watcher: Watcher, roots: Vec<PathBuf>, detector: ChangeDetector) -> Self {
        let Watcher {
            config,
            validator,
            source,
            reporter,
        } = watcher;
        let base = config.base_path();
        let state = WatcherState::new(roots.clone());
        let (state_tx, _) = watch::channel(state.clone());
        let (errors_tx, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        let debouncer = Debouncer::new(config.validation.debounce());

        Self {
            config,
            roots,
            base,
            validator,
            source,
            reporter,
            detector,
            debouncer,
            aggregator: Aggregator::new(),
            metrics: MetricsTracker::default(),
            state,
            state_tx,
            errors_tx,
            token: CancellationToken::new(),
            tasks: JoinSet::new(),
            batches: HashMap::new(),
            initial: Vec::new(),
            initial_seen: HashSet::new(),
            heartbeat: None,
            metrics_tick: None,
            flush_tick: None,
        }
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<SourceMessage>,
        ready_tx: oneshot::Sender<Result<()>>,
    ) -> WatcherState {
        let mut ready_tx = Some(ready_tx);

        let exit = loop {
            tokio::select! {
                _ = self.token.cancelled() => break Exit::Stop,
                message = rx.recv() => {
                    if let Some(exit) = self.on_message(message, &mut ready_tx) {
                        break exit;
                    }
                }
                Some(event) = self.debouncer.next_expired(), if !self.debouncer.is_empty() => {
                    self.on_debounced(event);
                }
                Some(joined) = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                    self.on_batch_done(joined);
                }
                _ = tick(&mut self.heartbeat) => self.emit_heartbeat(),
                _ = tick(&mut self.metrics_tick) => self.emit_metrics(),
                _ = tick(&mut self.flush_tick) => self.flush(),
            }
        };

        match exit {
            Exit::Stop => self.shutdown(rx).await,
            Exit::Failed => {
                rx.close();
                self.state.clone()
            }
        }
    }

    fn on_message(
        &mut self,
        message: Option<SourceMessage>,
        ready_tx: &mut Option<oneshot::Sender<Result<()>>>,
    ) -> Option<Exit> {
        let starting = self.state.status == WatcherStatus::Starting;
        match message {
            Some(SourceMessage::Event(event)) if starting => self.on_initial_event(&event),
            Some(SourceMessage::Event(event)) => {
                if self.state.status == WatcherStatus::Running {
                    self.debouncer.push(event);
                }
            }
            Some(SourceMessage::Ready) if starting => self.on_ready(ready_tx),
            Some(SourceMessage::Ready) => debug!("ignoring repeated ready signal"),
            Some(SourceMessage::Error(err)) if starting => {
                let err = self.fail_start(err);
                self.source.close();
                send_ready(ready_tx, Err(err));
                return Some(Exit::Failed);
            }
            Some(SourceMessage::Error(err)) => self.report_error(err),
            None if starting => {
                let err = self.fail_start(WatchError::Source(
                    "event source closed before the initial scan completed".into(),
                ));
                send_ready(ready_tx, Err(err));
                return Some(Exit::Failed);
            }
            None => {
                self.report_error(WatchError::Fault("event source closed unexpectedly".into()));
                return Some(Exit::Stop);
            }
        }
        None
    }

    /// Initial-scan events bypass the debouncer and are validated together once ready.
    fn on_initial_event(&mut self, event: &FileEvent) {
        match self.detector.process_event(event, &self.base) {
            Ok(changes) => {
                for file in changes.files {
                    if self.initial_seen.insert(file.clone()) {
                        self.initial.push(file);
                    }
                }
            }
            Err(err) => self.report_error(err),
        }
        self.state.files_watched = self.detector.tracked_files();
    }

    fn on_ready(&mut self, ready_tx: &mut Option<oneshot::Sender<Result<()>>>) {
        self.set_status(WatcherStatus::Running, None);
        self.start_timers();
        info!(
            files = self.detector.tracked_files(),
            initial = self.initial.len(),
            "watcher running"
        );

        let initial = std::mem::take(&mut self.initial);
        self.initial_seen.clear();
        if !initial.is_empty() {
            self.schedule(initial);
        }
        self.publish();
        send_ready(ready_tx, Ok(()));
    }

    fn on_debounced(&mut self, event: FileEvent) {
        self.reporter
            .emit(EventType::FileEvent, &event.relative_to(&self.base));
        match self.detector.process_event(&event, &self.base) {
            Ok(changes) => {
                debug!(
                    path = %event.path.display(),
                    reason = %changes.reason,
                    scope = ?changes.validation_type,
                    files = changes.files.len(),
                    "change detected"
                );
                self.state.files_watched = self.detector.tracked_files();
                if !changes.is_empty() {
                    self.schedule(changes.files);
                }
            }
            Err(err) => self.report_error(err),
        }
        self.publish();
    }

    /// Split `files` into batches and hand each to the validator on its own task.
    fn schedule(&mut self, files: Vec<PathBuf>) {
        let settings = &self.config.validation;
        let timeout = settings.timeout();
        for chunk in files.chunks(settings.batch_size.max(1)) {
            let files = chunk.to_vec();
            let dependency_map: DependencyMap = files
                .iter()
                .map(|f| {
                    let chain = if settings.enable_dependency_check {
                        self.detector.dependency_chain(f)
                    } else {
                        Vec::new()
                    };
                    (f.clone(), chain)
                })
                .collect();
            let batch_id = Uuid::new_v4().to_string();
            debug!(batch_id = %batch_id, files = files.len(), "dispatching validation batch");

            let validator = Arc::clone(&self.validator);
            let task_files = files.clone();
            let task_batch_id = batch_id.clone();
            self.state.active_validations += 1;
            let handle = self.tasks.spawn(async move {
                let started = Instant::now();
                let result = tokio::time::timeout(
                    timeout,
                    validator.validate_batch(&task_files, &dependency_map),
                )
                .await
                .unwrap_or_else(|_| {
                    Err(WatchError::engine(format!(
                        "batch {task_batch_id} timed out after {}ms",
                        timeout.as_millis()
                    )))
                });
                BatchOutcome {
                    result,
                    elapsed: started.elapsed(),
                }
            });
            self.batches
                .insert(handle.id(), PendingBatch { batch_id, files });
        }
    }

    fn on_batch_done(&mut self, joined: std::result::Result<(task::Id, BatchOutcome), JoinError>) {
        self.state.active_validations = self.state.active_validations.saturating_sub(1);
        let (id, outcome) = match joined {
            Ok((id, outcome)) => (id, Ok(outcome)),
            Err(err) => (err.id(), Err(err)),
        };
        let Some(batch) = self.batches.remove(&id) else {
            warn!(task = %id, "completion for unknown validation batch");
            self.publish();
            return;
        };

        match outcome {
            Ok(BatchOutcome {
                result: Ok(results),
                elapsed,
            }) => self.publish_results(batch, results, elapsed),
            Ok(BatchOutcome {
                result: Err(err), ..
            }) => self.report_error(err),
            Err(join_err) => {
                let what = if join_err.is_panic() {
                    "panicked"
                } else {
                    "was cancelled"
                };
                self.report_error(WatchError::Fault(format!(
                    "validation batch {} {what}",
                    batch.batch_id
                )));
            }
        }
        self.publish();
    }

    /// Results first, then the batch summary, then the updated rollup.
    fn publish_results(&mut self, batch: PendingBatch, results: Vec<ValidationResult>, elapsed: Duration) {
        for result in &results {
            self.reporter.emit(EventType::ValidationResult, result);
            self.metrics.record(result);
        }
        self.state.validations_run += results.len() as u64;

        self.reporter.emit(
            EventType::BatchResult,
            &BatchResultData::summarize(
                batch.batch_id.clone(),
                &results,
                elapsed.as_millis() as u64,
            ),
        );
        let stats = self.aggregator.record_batch(&results);
        self.reporter.emit(EventType::AggregatedStats, &stats);

        for file in batch.files {
            if !results.iter().any(|r| r.is_for(&file)) {
                let message = format!("no result returned in batch {}", batch.batch_id);
                self.report_error(WatchError::engine_for(file, message));
            }
        }
    }

    async fn shutdown(mut self, mut rx: mpsc::Receiver<SourceMessage>) -> WatcherState {
        self.set_status(WatcherStatus::Stopping, None);
        self.debouncer.clear();
        self.heartbeat = None;
        self.metrics_tick = None;
        self.flush_tick = None;

        let grace = self.config.shutdown_grace();
        let deadline = Instant::now() + grace;
        while !self.tasks.is_empty() {
            match tokio::time::timeout_at(deadline, self.tasks.join_next_with_id()).await {
                Ok(Some(joined)) => self.on_batch_done(joined),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        outstanding = self.tasks.len(),
                        "shutdown grace period elapsed with validations in flight"
                    );
                    self.tasks.detach_all();
                    break;
                }
            }
        }

        self.source.close();
        rx.close();
        if tokio::time::timeout(grace, self.validator.shutdown())
            .await
            .is_err()
        {
            warn!("validator did not release its resources in time");
        }

        self.set_status(WatcherStatus::Stopped, None);
        self.persist();
        self.flush();
        info!(
            validations = self.state.validations_run,
            errors = self.state.errors_count,
            "watcher stopped"
        );
        self.state.clone()
    }

    fn start_timers(&mut self) {
        if self.config.heartbeat.enabled {
            self.heartbeat = Some(periodic(self.config.heartbeat.interval()));
        }
        if self.config.metrics.enabled {
            self.metrics_tick = Some(periodic(self.config.metrics.interval()));
        }
        self.flush_tick = Some(periodic(self.config.output.flush_interval()));
    }

    fn emit_heartbeat(&mut self) {
        self.state.last_heartbeat = Some(Utc::now());
        self.reporter.emit(
            EventType::Heartbeat,
            &HeartbeatData {
                uptime: self.state.uptime_ms(),
                files_watched: self.state.files_watched,
                validations_run: self.state.validations_run,
                errors_count: self.state.errors_count,
            },
        );
        self.publish();
    }

    fn emit_metrics(&mut self) {
        let metrics = self.metrics.snapshot(self.state.uptime_ms());
        self.reporter.emit(EventType::Metrics, &metrics);
    }

    fn emit_status(&self, message: Option<String>) {
        self.reporter.emit(
            EventType::Status,
            &StatusData {
                status: self.state.status,
                message,
                watched_paths: self.roots.clone(),
                active_validations: self.state.active_validations,
            },
        );
    }

    /// Move the lifecycle forward and announce it. Rejected transitions are reported.
    fn set_status(&mut self, next: WatcherStatus, message: Option<String>) {
        if let Err(err) = self.state.transition(next) {
            self.report_error(err);
            return;
        }
        info!(status = %next, "watcher status changed");
        self.emit_status(message);
        self.publish();
    }

    /// Log, count and emit `err`, move to `error`, and hand the error back.
    fn fail_start(&mut self, err: WatchError) -> WatchError {
        self.record_error(&err);
        self.set_status(WatcherStatus::Error, Some(err.to_string()));
        self.flush();
        err
    }

    fn record_error(&mut self, err: &WatchError) {
        match err {
            WatchError::Fault(_) | WatchError::Source(_) => {
                error!(kind = err.kind(), error = %err, "watcher error");
            }
            _ => warn!(kind = err.kind(), error = %err, "watcher error"),
        }
        self.state.errors_count += 1;
        self.reporter.emit_error(err);
    }

    fn report_error(&mut self, err: WatchError) {
        self.record_error(&err);
        // No listeners is fine.
        let _ = self.errors_tx.send(Arc::new(err));
        self.publish();
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }

    fn flush(&self) {
        if let Err(err) = self.reporter.flush() {
            warn!(error = %err, "failed to flush event stream");
        }
    }

    fn persist(&self) {
        let Some(path) = &self.config.state_file else {
            return;
        };
        let snapshot = StateSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            state: &self.state,
            tracked_files: self.detector.tracked_files(),
            dependency_edges: self.detector.graph().edge_count(),
        };
        if let Err(err) = save_snapshot(path, &snapshot) {
            debug!(error = %err, "state snapshot not written");
        }
    }
}

fn send_ready(ready_tx: &mut Option<oneshot::Sender<Result<()>>>, result: Result<()>) {
    if let Some(tx) = ready_tx.take() {
        let _ = tx.send(result);
    }
}

fn periodic(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Next tick of an optional timer; never resolves for a disabled one.
async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
