//! Diagnostic sink capability and structured log records.
//!
//! Supervision code never talks to a concrete logger. It writes [`Record`]s
//! to a [`Sink`], which has one method per [`Level`]:
//!
//! - [`TracingSink`]: the real sink, forwards to `tracing`
//! - [`RelaySink`]: worker-side sink, ships records to the coordinator
//! - [`MemorySink`]: captures records, for tests and embedding
//!
//! ## Module Structure
//!
//! - [`relay`]: worker-side relay sink, tracing layer and wire frames
//! - [`tracing_sink`]: `tracing` backed sink and subscriber bootstrap

use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod relay;
pub mod tracing_sink;

pub use relay::{RelayLayer, RelaySink, decode_frame, encode_frame};
pub use tracing_sink::{JsonRecords, TracingSink, init_coordinator_logging, init_worker_logging};

/// Severity of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Silly,
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub const ALL: [Self; 5] = [
        Self::Silly,
        Self::Debug,
        Self::Info,
        Self::Warn,
        Self::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Silly => "silly",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a level name is not one of the five severities.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown log level: {0}")]
pub struct UnknownLevel(pub String);

impl FromStr for Level {
    type Err = UnknownLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| level.as_str() == s)
            .ok_or_else(|| UnknownLevel(s.to_string()))
    }
}

/// An immutable structured log record.
///
/// `message` is always present; any other keys live in `fields` and are
/// flattened next to it on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub message: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fields: Map::new(),
        }
    }

    /// Attach an additional field.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// The diagnostic sink capability set.
pub trait Sink: Send + Sync {
    fn silly(&self, record: Record);
    fn debug(&self, record: Record);
    fn info(&self, record: Record);
    fn warn(&self, record: Record);
    fn error(&self, record: Record);
}

/// Dispatch a record to the sink method matching `level`.
pub fn emit<S: Sink + ?Sized>(sink: &S, level: Level, record: Record) {
    match level {
        Level::Silly => sink.silly(record),
        Level::Debug => sink.debug(record),
        Level::Info => sink.info(record),
        Level::Warn => sink.warn(record),
        Level::Error => sink.error(record),
    }
}

/// Sink that keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<(Level, Record)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything logged so far, in order.
    pub fn records(&self) -> Vec<(Level, Record)> {
        self.records.lock().clone()
    }

    /// Records whose message equals `message`.
    pub fn with_message(&self, message: &str) -> Vec<(Level, Record)> {
        self.records
            .lock()
            .iter()
            .filter(|(_, record)| record.message == message)
            .cloned()
            .collect()
    }

    fn push(&self, level: Level, record: Record) {
        self.records.lock().push((level, record));
    }
}

impl Sink for MemorySink {
    fn silly(&self, record: Record) {
        self.push(Level::Silly, record);
    }

    fn debug(&self, record: Record) {
        self.push(Level::Debug, record);
    }

    fn info(&self, record: Record) {
        self.push(Level::Info, record);
    }

    fn warn(&self, record: Record) {
        self.push(Level::Warn, record);
    }

    fn error(&self, record: Record) {
        self.push(Level::Error, record);
    }
}
