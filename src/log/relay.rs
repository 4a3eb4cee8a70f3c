//! Worker-side log relay.
//!
//! Workers do not write diagnostics themselves. Every record is framed as a
//! single JSON line `{"level": ..., "message": ..., ...fields}` and written to
//! the coordinator channel, where the pool supervisor decodes it with
//! [`decode_frame`] and re-emits it through the real sink.
//!
//! Sends are synchronous and unacknowledged. Ordering follows the channel.

use std::fmt;
use std::io::Write;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use super::{Level, Record, Sink};

#[derive(Serialize)]
struct OutgoingFrame<'a> {
    level: Level,
    #[serde(flatten)]
    record: &'a Record,
}

#[derive(Deserialize)]
struct IncomingFrame {
    level: String,
    #[serde(flatten)]
    record: Record,
}

/// Encode a record as one newline-terminated frame.
pub fn encode_frame(level: Level, record: &Record) -> serde_json::Result<Vec<u8>> {
    let mut line = serde_json::to_vec(&OutgoingFrame { level, record })?;
    line.push(b'\n');
    Ok(line)
}

/// Decode one frame received from a worker.
///
/// Returns `Ok(None)` when the level is not one of the five severities; such
/// frames are dropped rather than mapped onto a default level.
pub fn decode_frame(line: &str) -> serde_json::Result<Option<(Level, Record)>> {
    let frame: IncomingFrame = serde_json::from_str(line)?;
    Ok(frame
        .level
        .parse::<Level>()
        .ok()
        .map(|level| (level, frame.record)))
}

/// Sink that forwards every record over the coordinator channel.
pub struct RelaySink {
    channel: Mutex<Box<dyn Write + Send>>,
}

impl RelaySink {
    pub fn new<W>(channel: W) -> Self
    where
        W: Write + Send + 'static,
    {
        Self {
            channel: Mutex::new(Box::new(channel)),
        }
    }

    fn send(&self, level: Level, record: Record) {
        let Ok(frame) = encode_frame(level, &record) else {
            return;
        };
        // A closed channel means the coordinator is gone; nobody is left to tell.
        let mut channel = self.channel.lock();
        let _ = channel.write_all(&frame).and_then(|()| channel.flush());
    }
}

impl fmt::Debug for RelaySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySink").finish_non_exhaustive()
    }
}

impl Sink for RelaySink {
    fn silly(&self, record: Record) {
        self.send(Level::Silly, record);
    }

    fn debug(&self, record: Record) {
        self.send(Level::Debug, record);
    }

    fn info(&self, record: Record) {
        self.send(Level::Info, record);
    }

    fn warn(&self, record: Record) {
        self.send(Level::Warn, record);
    }

    fn error(&self, record: Record) {
        self.send(Level::Error, record);
    }
}

/// `tracing` layer that turns events into records on a [`Sink`].
///
/// Installed in workers so that plain `tracing` macros in the application
/// payload reach the coordinator too.
pub struct RelayLayer<S> {
    sink: S,
}

impl<S> RelayLayer<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }
}

impl<S, T> Layer<T> for RelayLayer<S>
where
    S: std::ops::Deref + Send + Sync + 'static,
    S::Target: Sink,
    T: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, T>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let level = severity(event.metadata().level());
        let record = Record {
            message: visitor.message.unwrap_or_default(),
            fields: visitor.fields,
        };
        super::emit(&*self.sink, level, record);
    }
}

fn severity(level: &tracing::Level) -> Level {
    if *level == tracing::Level::ERROR {
        Level::Error
    } else if *level == tracing::Level::WARN {
        Level::Warn
    } else if *level == tracing::Level::INFO {
        Level::Info
    } else if *level == tracing::Level::DEBUG {
        Level::Debug
    } else {
        Level::Silly
    }
}

/// Collects event fields as JSON values, splitting out `message`.
#[derive(Default)]
pub(super) struct FieldVisitor {
    pub(super) message: Option<String>,
    pub(super) fields: Map<String, Value>,
}

impl FieldVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, Value::from(format!("{value:?}")));
    }
}
