// Console logging. Every line is rendered as
// `[YYYY-MM-DD HH:MM:SS] LEVEL: message key=value...` with four severities:
// INFO, SUCCESS, WARN and ERROR. SUCCESS is an info event carrying
// `success = true`; use the `success!` macro instead of writing the field by
// hand. Colors are only emitted when the writer supports ANSI escapes.
use chrono::Local;
use std::fmt::{self, Write as _};
use std::io::IsTerminal;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Log an info event rendered with the `SUCCESS` label.
#[macro_export]
macro_rules! success {
    ($($arg:tt)+) => {
        ::tracing::info!(success = true, $($arg)+)
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Debug,
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    fn of(level: &Level, success: bool) -> Self {
        match *level {
            Level::ERROR => Severity::Error,
            Level::WARN => Severity::Warning,
            Level::INFO if success => Severity::Success,
            Level::INFO => Severity::Info,
            _ => Severity::Debug,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Success => "SUCCESS",
            Severity::Warning => "WARN",
            Severity::Error => "ERROR",
        }
    }

    fn color(self) -> Option<&'static str> {
        match self {
            Severity::Success => Some(GREEN),
            Severity::Warning => Some(YELLOW),
            Severity::Error => Some(RED),
            Severity::Debug | Severity::Info => None,
        }
    }
}

/// Event formatter producing the timestamped console line.
pub struct ConsoleFormat;

impl<S, N> FormatEvent<S, N> for ConsoleFormat
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
        let mut line = LineVisitor::default();
        event.record(&mut line);

        let severity = Severity::of(event.metadata().level(), line.success);
        let color = severity.color().filter(|_| writer.has_ansi_escapes());

        if let Some(color) = color {
            writer.write_str(color)?;
        }
        write!(
            writer,
            "[{}] {}: {}{}",
            Local::now().format(TIMESTAMP_FORMAT),
            severity.label(),
            line.message,
            line.fields
        )?;
        if color.is_some() {
            writer.write_str(RESET)?;
        }
        writeln!(writer)
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
    success: bool,
}

impl Visit for LineVisitor {
    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == "success" {
            self.success = value;
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" | "warning" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Install the console subscriber as the global default.
///
/// Uses `try_init` so a second call (tests, embedding) is a no-op.
pub fn init(default_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(parse_level(default_level))
        .with_ansi(std::io::stdout().is_terminal())
        .event_format(ConsoleFormat)
        .try_init();
}
