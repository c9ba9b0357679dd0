use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Incremental revalidation watcher for declarative source trees.
///
/// arbiter-watch tracks the dependency graph between schema and config files and
/// re-runs a validator on every changed file plus everything that depends on it,
/// streaming the results to stdout as newline-delimited JSON.
#[derive(Parser, Debug)]
#[command(
    name = "arbiter-watch",
    version,
    about,
    long_about = None,
    propagate_version = true,
)]
pub struct Cli {
    /// Configuration file. Defaults to ./arbiter-watch.toml when it exists.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for the `cycles` report.
#[derive(Clone, Debug, ValueEnum, Default)]
pub enum OutputFormat {
    /// One `cycle a -> b -> a` line per cycle followed by a count (default).
    #[default]
    Compact,
    /// JSON array of `{ "files": [...] }` objects.
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch one or more directories and revalidate changed files until interrupted.
    ///
    /// Everything after `--` is the validator command; each file path is appended to it.
    Watch {
        /// Paths to watch. Overrides `watch_paths` from the config file.
        paths: Vec<PathBuf>,

        /// Quiescent interval per path before a change is processed.
        #[arg(long)]
        debounce_ms: Option<u64>,

        /// Maximum number of files per validator call.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Heartbeat interval; 0 disables heartbeats.
        #[arg(long)]
        heartbeat_ms: Option<u64>,

        /// Do not validate files that exist before watching starts.
        #[arg(long)]
        no_initial: bool,

        /// Output destination: stdout, stderr or a file path.
        #[arg(long)]
        output: Option<String>,

        /// Validator command, e.g. `-- cue vet`.
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Scan a tree once and report dependency cycles between tracked files.
    Cycles {
        /// Root directory to scan.
        root: PathBuf,

        /// Output format.
        #[arg(long, value_enum, default_value_t = OutputFormat::Compact)]
        format: OutputFormat,
    },
}
