//! `tracing` backed sink and subscriber setup.

use std::fmt::Write as _;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, JsonFields, Writer};
use tracing_subscriber::fmt::time::{FormatTime, SystemTime};
use tracing_subscriber::fmt::{FmtContext, FormattedFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use super::relay::FieldVisitor;
use super::{Record, RelayLayer, RelaySink, Sink};
use crate::config::LogFormat;

/// Event field carrying a record's extra fields as a JSON object.
const RECORD_FIELDS: &str = "fields";

/// The real diagnostic sink. `silly` maps onto `TRACE`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

macro_rules! forward {
    ($level:expr, $record:expr) => {{
        let Record { message, fields } = $record;
        if fields.is_empty() {
            tracing::event!($level, "{message}");
        } else {
            let fields = Value::Object(fields);
            tracing::event!($level, fields = %fields, "{message}");
        }
    }};
}

impl Sink for TracingSink {
    fn silly(&self, record: Record) {
        forward!(tracing::Level::TRACE, record);
    }

    fn debug(&self, record: Record) {
        forward!(tracing::Level::DEBUG, record);
    }

    fn info(&self, record: Record) {
        forward!(tracing::Level::INFO, record);
    }

    fn warn(&self, record: Record) {
        forward!(tracing::Level::WARN, record);
    }

    fn error(&self, record: Record) {
        forward!(tracing::Level::ERROR, record);
    }
}

/// JSON event format that keeps record fields structured.
///
/// Produces the same shape as `fmt::layer().json()`, except that the
/// record fields forwarded by [`TracingSink`] are merged into `fields` as
/// JSON values instead of one encoded string. Span fields must be formatted
/// with [`JsonFields`].
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRecords;

impl<S, N> FormatEvent<S, N> for JsonRecords
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let mut timestamp = String::new();
        SystemTime.format_time(&mut Writer::new(&mut timestamp))?;

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let mut fields = Map::new();
        if let Some(message) = visitor.message {
            fields.insert("message".to_string(), Value::String(message));
        }
        for (key, value) in visitor.fields {
            if key == RECORD_FIELDS
                && let Value::String(raw) = &value
                && let Ok(Value::Object(record)) = serde_json::from_str::<Value>(raw)
            {
                fields.extend(record);
                continue;
            }
            fields.insert(key, value);
        }

        let metadata = event.metadata();
        let mut line = Map::new();
        line.insert("timestamp".to_string(), Value::String(timestamp));
        line.insert("level".to_string(), Value::from(metadata.level().as_str()));
        line.insert("fields".to_string(), Value::Object(fields));
        line.insert("target".to_string(), Value::from(metadata.target()));

        if let Some(span) = ctx.lookup_current() {
            let mut current = Map::new();
            current.insert("name".to_string(), Value::from(span.name()));
            let extensions = span.extensions();
            if let Some(formatted) = extensions.get::<FormattedFields<N>>()
                && let Ok(Value::Object(span_fields)) = serde_json::from_str::<Value>(&formatted.fields)
            {
                current.extend(span_fields);
            }
            line.insert("span".to_string(), Value::Object(current));
        }

        let json = serde_json::to_string(&line).map_err(|_| std::fmt::Error)?;
        writeln!(writer, "{json}")
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize stdout logging for the coordinator.
///
/// Filtering follows `RUST_LOG` (default `info`). Does nothing if a global
/// subscriber is already installed.
pub fn init_coordinator_logging(format: LogFormat) {
    let (pretty, json) = match format {
        LogFormat::Pretty => (Some(fmt::layer()), None),
        LogFormat::Json => (
            None,
            Some(fmt::layer().event_format(JsonRecords).fmt_fields(JsonFields::new())),
        ),
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(pretty)
        .with(json)
        .try_init();
}

/// Initialize worker logging: `tracing` events are relayed to the coordinator.
pub fn init_worker_logging(relay: Arc<RelaySink>) {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(RelayLayer::new(relay))
        .try_init();
}
