//! NDJSON event stream writer with buffering, filtering and child reporters.

pub mod aggregate;
pub mod protocol;

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::config::{OutputDestination, OutputSettings};
use crate::error::{Result, WatchError};

pub use aggregate::Aggregator;
pub use protocol::{Envelope, ErrorData, EventType};

/// An include filter applied to a serialized event line.
#[derive(Debug, Clone)]
pub enum EventFilter {
    Substring(String),
    Regex(Regex),
}

impl EventFilter {
    /// `/pattern/` is a regular expression, anything else a plain substring.
    pub fn parse(pattern: &str) -> std::result::Result<Self, regex::Error> {
        match pattern
            .strip_prefix('/')
            .and_then(|rest| rest.strip_suffix('/'))
        {
            Some(re) if pattern.len() >= 2 => Ok(Self::Regex(Regex::new(re)?)),
            _ => Ok(Self::Substring(pattern.to_owned())),
        }
    }

    pub fn matches(&self, line: &str) -> bool {
        match self {
            Self::Substring(s) => line.contains(s.as_str()),
            Self::Regex(re) => re.is_match(line),
        }
    }
}

struct Shared {
    sink: Box<dyn Write + Send>,
    buffer: Vec<String>,
    buffer_size: usize,
}

impl Shared {
    fn flush(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let mut chunk = String::with_capacity(self.buffer.iter().map(|l| l.len() + 1).sum());
        for line in self.buffer.drain(..) {
            chunk.push_str(&line);
            chunk.push('\n');
        }
        self.sink.write_all(chunk.as_bytes())?;
        self.sink.flush()
    }
}

/// Serializes typed events as one JSON object per line.
///
/// Lines are buffered in emission order and written with a single `write_all` once
/// `buffer_size` lines are pending or [`StreamReporter::flush`] is called. Children made
/// with [`StreamReporter::child`] share the buffer and sink; their filters add to the
/// parent's.
#[derive(Clone)]
pub struct StreamReporter {
    shared: Arc<Mutex<Shared>>,
    filters: Vec<EventFilter>,
}

impl std::fmt::Debug for StreamReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReporter")
            .field("filters", &self.filters)
            .field("buffered", &self.buffered())
            .finish()
    }
}

impl StreamReporter {
    pub fn new(sink: Box<dyn Write + Send>, settings: &OutputSettings) -> Result<Self> {
        let filters = parse_filters(&settings.include)?;
        Ok(Self {
            shared: Arc::new(Mutex::new(Shared {
                sink,
                buffer: Vec::with_capacity(settings.buffer_size),
                buffer_size: settings.buffer_size.max(1),
            })),
            filters,
        })
    }

    /// Open the configured destination. Files are created if needed and appended to.
    pub fn from_settings(settings: &OutputSettings) -> Result<Self> {
        let sink: Box<dyn Write + Send> = match settings.destination() {
            OutputDestination::Stdout => Box::new(io::stdout()),
            OutputDestination::Stderr => Box::new(io::stderr()),
            OutputDestination::File(path) => Box::new(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|e| WatchError::filesystem("open", path, e))?,
            ),
        };
        Self::new(sink, settings)
    }

    /// A reporter writing to the same buffer whose events must also match `patterns`.
    pub fn child(&self, patterns: &[String]) -> Result<Self> {
        let mut filters = self.filters.clone();
        filters.extend(parse_filters(patterns)?);
        Ok(Self {
            shared: Arc::clone(&self.shared),
            filters,
        })
    }

    /// Serialize and buffer one event. A payload that cannot be encoded is replaced by
    /// an `error` event, so every line stays parseable.
    pub fn emit<T: Serialize>(&self, kind: EventType, data: &T) {
        let envelope = Envelope {
            kind,
            timestamp: Utc::now(),
            data,
        };
        let line = match serde_json::to_string(&envelope) {
            Ok(line) => {
                if !self.filters.iter().all(|f| f.matches(&line)) {
                    return;
                }
                line
            }
            Err(err) => {
                warn!(event = %kind, error = %err, "event payload failed to serialize");
                let substitute = ErrorData {
                    message: format!("failed to serialize {kind} event: {err}"),
                    error: Some("SerializationError".to_owned()),
                    context: Some(json!({ "originalType": kind })),
                };
                let fallback = Envelope {
                    kind: EventType::Error,
                    timestamp: envelope.timestamp,
                    data: &substitute,
                };
                match serde_json::to_string(&fallback) {
                    Ok(line) => line,
                    Err(_) => return,
                }
            }
        };

        let mut shared = self.lock();
        shared.buffer.push(line);
        if shared.buffer.len() >= shared.buffer_size {
            if let Err(err) = shared.flush() {
                warn!(error = %err, "failed to write event stream");
            }
        }
    }

    /// Emit `err` as an `error` event.
    pub fn emit_error(&self, err: &WatchError) {
        self.emit(EventType::Error, &ErrorData::from(err));
    }

    /// Write every buffered line to the sink.
    pub fn flush(&self) -> io::Result<()> {
        self.lock().flush()
    }

    /// Number of lines waiting for the next flush.
    pub fn buffered(&self) -> usize {
        self.lock().buffer.len()
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_filters(patterns: &[String]) -> Result<Vec<EventFilter>> {
    patterns
        .iter()
        .map(|p| {
            EventFilter::parse(p).map_err(|err| {
                WatchError::Configuration(format!("invalid output filter `{p}`: {err}"))
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
