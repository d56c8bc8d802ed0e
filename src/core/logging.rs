/// Structured log records and the process-wide log relay
///
/// Every log line that crosses a process boundary (control socket,
/// runner stdout) is one record serialized as `LEVEL:source:message`.
/// The relay layer mirrors every tracing event to the sinks registered
/// by active control sessions; the runner formatter writes the same
/// line format to stdout so the parent can decode records by field.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// One structured log record: `{level, source, message}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: Level,
    pub source: String,
    pub message: String,
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.level, self.source, self.message)
    }
}

/// Parse one relayed line back into a record.
///
/// Returns None for anything that does not carry all three fields with
/// a recognizable level; callers re-emit such lines verbatim.
pub fn parse_line(line: &str) -> Option<LogRecord> {
    let mut parts = line.trim_end_matches('\r').splitn(3, ':');
    let level = Level::from_str(parts.next()?).ok()?;
    let source = parts.next()?;
    let message = parts.next()?;
    Some(LogRecord {
        level,
        source: source.to_string(),
        message: message.to_string(),
    })
}

/// Re-emit a decoded record into this process's logging hierarchy under
/// the embedded source name.
pub fn reemit(record: &LogRecord) {
    let source = record.source.as_str();
    let message = record.message.as_str();
    match record.level {
        Level::TRACE => tracing::trace!(source, "{message}"),
        Level::DEBUG => tracing::debug!(source, "{message}"),
        Level::INFO => tracing::info!(source, "{message}"),
        Level::WARN => tracing::warn!(source, "{message}"),
        _ => tracing::error!(source, "{message}"),
    }
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    source: Option<String>,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "source" => self.source = Some(value.to_string()),
            _ => {}
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = Some(format!("{value:?}")),
            "source" => self.source = Some(format!("{value:?}")),
            _ => {}
        }
    }
}

/// Build a record from a tracing event. An explicit `source` field
/// overrides the event's module path (used when relaying runner logs).
///
/// Module paths are dotted (`volback.core.engine`): the wire format is
/// colon-separated, so the source must not contain colons itself.
fn record_from_event(event: &Event<'_>) -> LogRecord {
    let mut fields = FieldCollector::default();
    event.record(&mut fields);
    LogRecord {
        level: *event.metadata().level(),
        source: fields
            .source
            .unwrap_or_else(|| event.metadata().target().replace("::", ".")),
        message: fields.message.unwrap_or_default(),
    }
}

#[derive(Default)]
struct RelayInner {
    next_id: u64,
    sinks: HashMap<u64, mpsc::UnboundedSender<String>>,
}

/// Registry of per-session log sinks.
///
/// Each control session registers a sink for its duration and receives
/// every record emitted process-wide, mirroring the daemon's log stream
/// back to the caller.
#[derive(Clone, Default)]
pub struct LogRelay {
    inner: Arc<Mutex<RelayInner>>,
}

impl LogRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.sinks.insert(id, tx);
        (id, rx)
    }

    pub fn unregister(&self, id: u64) {
        self.inner.lock().unwrap().sinks.remove(&id);
    }

    pub fn layer(&self) -> RelayLayer {
        RelayLayer {
            relay: self.clone(),
        }
    }

    fn broadcast(&self, line: &str) {
        let inner = self.inner.lock().unwrap();
        for sink in inner.sinks.values() {
            // A sink whose session died is cleaned up on unregister.
            let _ = sink.send(line.to_string());
        }
    }
}

/// tracing layer feeding the relay.
pub struct RelayLayer {
    relay: LogRelay,
}

impl<S: Subscriber> Layer<S> for RelayLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let record = record_from_event(event);
        self.relay.broadcast(&record.to_string());
    }
}

/// Event formatter for the runner process: one parseable record per
/// line on stdout, nothing else.
pub struct RunnerFormat;

impl<S, N> FormatEvent<S, N> for RunnerFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        writeln!(writer, "{}", record_from_event(event))
    }
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Control process: human-readable log on stderr plus the session relay.
pub fn init_control(relay: &LogRelay) {
    tracing_subscriber::registry()
        .with(default_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(relay.layer())
        .init();
}

/// Runner process: record lines on stdout for the parent to decode.
pub fn init_runner() {
    tracing_subscriber::fmt()
        .event_format(RunnerFormat)
        .with_env_filter(default_filter())
        .init();
}

/// Client process: plain log on stderr, stdout stays reserved for the
/// relayed server stream.
pub fn init_client() {
    tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_well_formed_line() {
        let record = parse_line("INFO:volback.core.engine:Backing up volume db_data").unwrap();
        assert_eq!(record.level, Level::INFO);
        assert_eq!(record.source, "volback.core.engine");
        assert_eq!(record.message, "Backing up volume db_data");
    }

    #[test]
    fn test_parse_keeps_colons_in_message() {
        let record = parse_line("ERROR:engine:upload failed: timeout: retry").unwrap();
        assert_eq!(record.message, "upload failed: timeout: retry");
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        assert!(parse_line("duplicity wrote something raw").is_none());
        assert!(parse_line("NOTALEVEL:engine:message").is_none());
        assert!(parse_line("ERROR:missing message part").is_none());
        assert!(parse_line("").is_none());
    }

    #[test]
    fn test_format_parse_round_trip() {
        let record = LogRecord {
            level: Level::WARN,
            source: "runner.engine".to_string(),
            message: "watch out".to_string(),
        };
        assert_eq!(parse_line(&record.to_string()).unwrap(), record);
    }
}
