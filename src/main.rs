mod cli;
mod output;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use arbiter_watch::config::{CONFIG_FILE, WatcherConfig};
use arbiter_watch::detector::ChangeDetector;
use arbiter_watch::detector::resolve::normalize_path;
use arbiter_watch::source::scan::{RootFilter, scan};
use arbiter_watch::{
    CommandValidator, FileEvent, FileEventKind, NotifySource, StreamReporter, Watcher,
    WatcherStatus,
};

use cli::{Cli, Commands, OutputFormat};

/// Command-line settings layered over the config file.
struct WatchOverrides {
    paths: Vec<PathBuf>,
    debounce_ms: Option<u64>,
    batch_size: Option<usize>,
    heartbeat_ms: Option<u64>,
    no_initial: bool,
    output: Option<String>,
    command: Vec<String>,
}

impl WatchOverrides {
    fn apply(self, config: &mut WatcherConfig) {
        if !self.paths.is_empty() {
            config.watch_paths = self.paths;
        }
        if let Some(ms) = self.debounce_ms {
            config.validation.debounce_ms = ms;
        }
        if let Some(size) = self.batch_size {
            config.validation.batch_size = size;
        }
        match self.heartbeat_ms {
            Some(0) => config.heartbeat.enabled = false,
            Some(ms) => {
                config.heartbeat.enabled = true;
                config.heartbeat.interval_ms = ms;
            }
            None => {}
        }
        if self.no_initial {
            config.watch_options.ignore_initial = true;
        }
        if let Some(output) = self.output {
            config.output.destination = output;
        }
        if !self.command.is_empty() {
            config.validation.command = Some(self.command);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the event stream; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Watch {
            paths,
            debounce_ms,
            batch_size,
            heartbeat_ms,
            no_initial,
            output,
            command,
        } => {
            let overrides = WatchOverrides {
                paths,
                debounce_ms,
                batch_size,
                heartbeat_ms,
                no_initial,
                output,
                command,
            };
            run_watch(config, overrides).await
        }
        Commands::Cycles { root, format } => run_cycles(&root, &config, &format),
    }
}

/// An explicit `--config` must load; the default file is optional.
fn load_config(explicit: Option<&Path>) -> Result<WatcherConfig> {
    let config = match explicit {
        Some(path) => WatcherConfig::load(path)?,
        None if Path::new(CONFIG_FILE).is_file() => WatcherConfig::load(Path::new(CONFIG_FILE))?,
        None => WatcherConfig::default(),
    };
    Ok(config)
}

async fn run_watch(mut config: WatcherConfig, overrides: WatchOverrides) -> Result<()> {
    overrides.apply(&mut config);
    config.validate()?;

    let validator = Arc::new(CommandValidator::from_settings(&config.validation)?);
    let reporter = StreamReporter::from_settings(&config.output)?;
    let source = Box::new(NotifySource::new(config.watch_options.clone()));
    let handle = Watcher::new(config, validator, source, reporter)?
        .start()
        .await
        .context("failed to start watcher")?;

    let mut state = handle.subscribe_state();
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("interrupt received, stopping");
        }
        _ = state.wait_for(|s| s.status != WatcherStatus::Running) => {
            warn!("watcher stopped on its own");
        }
    }

    let final_state = handle.stop().await?;
    info!(
        validations = final_state.validations_run,
        errors = final_state.errors_count,
        "shutdown complete"
    );
    Ok(())
}

fn run_cycles(root: &Path, config: &WatcherConfig, format: &OutputFormat) -> Result<()> {
    let root = normalize_path(
        &std::path::absolute(root).with_context(|| format!("invalid path {}", root.display()))?,
    );
    anyhow::ensure!(root.is_dir(), "{} is not a directory", root.display());

    let mut detector = ChangeDetector::new(&config.detection)?;
    let filter = RootFilter::new(&root, &config.watch_options);
    for entry in scan(&filter, config.watch_options.follow_symlinks) {
        if entry.is_dir {
            continue;
        }
        let event = FileEvent::new(FileEventKind::Add, entry.path);
        if let Err(err) = detector.process_event(&event, &root) {
            warn!(error = %err, "skipping file");
        }
    }

    let cycles = detector.detect_cycles();
    output::format_cycles(&cycles, format, &root);
    Ok(())
}
