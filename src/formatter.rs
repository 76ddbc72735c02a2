//! Custom tracing event formatters.
//!
//! Two formatters, selected by `--tracing pretty|json`: a colorized
//! human-readable one for local development, and a JSON one that flattens
//! event fields to the root object (rather than nesting them under
//! `"fields"`) so log shippers can index them directly.

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use yansi::Paint;

const TIMESTAMP_FORMAT: &[FormatItem<'static>] =
    format_description!("[hour]:[minute]:[second].[subsecond digits:3]");

/// Collects event fields into an ordered list for pretty-printing.
#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    fields: Vec<(String, String)>,
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{value:?}");
        if field.name() == "message" {
            self.message = Some(rendered);
        } else {
            self.fields.push((field.name().to_owned(), rendered));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_owned());
        } else {
            self.fields.push((field.name().to_owned(), value.to_owned()));
        }
    }
}

fn write_colored_level(writer: &mut Writer<'_>, level: &Level) -> fmt::Result {
    if writer.has_ansi_escapes() {
        let painted = match *level {
            Level::TRACE => Paint::new("TRACE").magenta(),
            Level::DEBUG => Paint::new("DEBUG").blue(),
            Level::INFO => Paint::new(" INFO").green(),
            Level::WARN => Paint::new(" WARN").yellow(),
            Level::ERROR => Paint::new("ERROR").red(),
        };
        write!(writer, "{painted}")
    } else {
        match *level {
            Level::TRACE => write!(writer, "{:>5}", "TRACE"),
            Level::DEBUG => write!(writer, "{:>5}", "DEBUG"),
            Level::INFO => write!(writer, "{:>5}", " INFO"),
            Level::WARN => write!(writer, "{:>5}", " WARN"),
            Level::ERROR => write!(writer, "{:>5}", "ERROR"),
        }
    }
}

/// Human-readable formatter: `HH:MM:SS.mmm LEVEL span1:span2: target: message key=value ...`.
pub struct CustomPrettyFormatter;

impl<S, N> FormatEvent<S, N> for CustomPrettyFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        let ansi = writer.has_ansi_escapes();

        let now = OffsetDateTime::now_utc();
        let timestamp = now
            .format(&TIMESTAMP_FORMAT)
            .map_err(|_| fmt::Error)?;
        if ansi {
            write!(writer, "{}", Paint::new(&timestamp).dim())?;
        } else {
            write!(writer, "{timestamp}")?;
        }
        writer.write_char(' ')?;

        write_colored_level(&mut writer, meta.level())?;
        writer.write_char(' ')?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                if ansi {
                    write!(writer, "{}", Paint::new(span.metadata().name()).bold())?;
                } else {
                    write!(writer, "{}", span.metadata().name())?;
                }
                writer.write_char(':')?;
            }
            writer.write_char(' ')?;
        }

        if ansi {
            write!(writer, "{}: ", Paint::new(meta.target()).dim())?;
        } else {
            write!(writer, "{}: ", meta.target())?;
        }

        let mut collector = FieldCollector::default();
        event.record(&mut collector);

        if let Some(msg) = &collector.message {
            write!(writer, "{msg}")?;
        }

        for (key, value) in &collector.fields {
            writer.write_char(' ')?;
            if ansi {
                write!(writer, "{}", Paint::new(key).cyan())?;
                write!(writer, "{}", Paint::new("=").dim())?;
            } else {
                write!(writer, "{key}=")?;
            }
            write!(writer, "{value}")?;
        }

        writeln!(writer)
    }
}

/// JSON formatter that flattens event fields to the root object instead of
/// nesting them under a `"fields"` key.
pub struct CustomJsonFormatter;

#[derive(Serialize)]
struct JsonEvent {
    message: String,
    level: String,
    target: String,
    #[serde(flatten)]
    spans: Map<String, Value>,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

struct JsonFieldVisitor<'a> {
    message: &'a mut Option<String>,
    fields: &'a mut Map<String, Value>,
}

impl Visit for JsonFieldVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let key = field.name();
        if key == "message" {
            *self.message = Some(format!("{value:?}"));
        } else {
            self.fields.insert(key.to_owned(), Value::String(format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        let key = field.name();
        if key == "message" {
            *self.message = Some(value.to_owned());
        } else {
            self.fields.insert(key.to_owned(), Value::String(value.to_owned()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        if field.name() != "message" {
            self.fields
                .insert(field.name().to_owned(), Value::Number(value.into()));
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() != "message" {
            self.fields
                .insert(field.name().to_owned(), Value::Number(value.into()));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() != "message" {
            self.fields.insert(field.name().to_owned(), Value::Bool(value));
        }
    }
}

impl<S, N> FormatEvent<S, N> for CustomJsonFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();

        let mut message = None;
        let mut fields = Map::new();
        let mut visitor = JsonFieldVisitor {
            message: &mut message,
            fields: &mut fields,
        };
        event.record(&mut visitor);

        let mut spans = Map::new();
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                spans.insert(span.metadata().name().to_owned(), Value::Object(Map::new()));
            }
        }

        let json = JsonEvent {
            message: message.unwrap_or_default(),
            level: meta.level().to_string(),
            target: meta.target().to_owned(),
            spans,
            fields,
        };

        writeln!(
            writer,
            "{}",
            serde_json::to_string(&json).unwrap_or_else(|_| "{}".to_owned())
        )
    }
}
