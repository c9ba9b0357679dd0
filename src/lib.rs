//! Incremental, dependency-aware revalidation of declarative source trees.
//!
//! A [`watcher::Watcher`] turns filesystem events into debounced, dependency-scoped
//! validation batches and streams every outcome as NDJSON through a
//! [`reporter::StreamReporter`].

pub mod config;
pub mod detector;
pub mod error;
pub mod event;
pub mod persist;
pub mod reporter;
pub mod source;
pub mod validator;
pub mod watcher;

pub use config::WatcherConfig;
pub use detector::{ChangeDetector, ChangeReason, ChangeSet, ValidationScope};
pub use error::{Result, WatchError};
pub use event::{FileEvent, FileEventKind};
pub use reporter::StreamReporter;
pub use source::{EventSource, NotifySource, SourceMessage};
pub use validator::{CommandValidator, ValidationResult, Validator};
pub use watcher::{Watcher, WatcherHandle, WatcherState, WatcherStatus};
