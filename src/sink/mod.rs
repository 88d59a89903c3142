use crate::config::OutputFormat;
use crate::device::event::RawEvent;
use crate::device::GrabStatus;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;

/// Everything the monitor reports, in the order it happens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    Opened {
        path: PathBuf,
        name: String,
        grab: GrabStatus,
    },
    Closed {
        path: PathBuf,
        name: String,
    },
    Reading {
        name: String,
        #[serde(flatten)]
        record: RawEvent,
    },
}

/// Consumer of monitor events. Implementations must not reorder.
pub trait EventSink {
    fn emit(&mut self, event: MonitorEvent);
}

impl EventSink for Vec<MonitorEvent> {
    fn emit(&mut self, event: MonitorEvent) {
        self.push(event);
    }
}

impl<S: EventSink + ?Sized> EventSink for &mut S {
    fn emit(&mut self, event: MonitorEvent) {
        (**self).emit(event);
    }
}

/// Line-oriented sink: one event per line, flushed immediately.
pub struct WriterSink<W: Write> {
    out: W,
    format: OutputFormat,
    write_failed: bool,
}

impl WriterSink<std::io::Stdout> {
    pub fn stdout(format: OutputFormat) -> Self {
        Self::new(std::io::stdout(), format)
    }
}

impl<W: Write> WriterSink<W> {
    pub fn new(out: W, format: OutputFormat) -> Self {
        Self {
            out,
            format,
            write_failed: false,
        }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_event(&mut self, event: &MonitorEvent) -> std::io::Result<()> {
        match self.format {
            OutputFormat::Text => writeln!(self.out, "{}", format_text(event))?,
            OutputFormat::Json => {
                serde_json::to_writer(&mut self.out, event)?;
                self.out.write_all(b"\n")?;
            }
        }
        self.out.flush()
    }
}

impl<W: Write> EventSink for WriterSink<W> {
    fn emit(&mut self, event: MonitorEvent) {
        match self.write_event(&event) {
            Ok(()) => self.write_failed = false,
            Err(e) => {
                // Only report the first failure of a run of failures
                if !self.write_failed {
                    tracing::warn!("Failed to write monitor output: {}", e);
                }
                self.write_failed = true;
            }
        }
    }
}

pub fn format_text(event: &MonitorEvent) -> String {
    match event {
        MonitorEvent::Opened { path, name, grab } => {
            format!("Opened {} ({}) grab={}", path.display(), name, grab)
        }
        MonitorEvent::Closed { path, name } => format!("Closed {} ({})", path.display(), name),
        MonitorEvent::Reading { name, record } => match type_label(record.kind) {
            Some(label) => format!(
                "{}: type {} ({}) code {} value {}",
                name, record.kind, label, record.code, record.value
            ),
            None => format!(
                "{}: type {} code {} value {}",
                name, record.kind, record.code, record.value
            ),
        },
    }
}

/// Name of the event type as evdev knows it, if it knows it.
fn type_label(kind: u16) -> Option<String> {
    let label = format!("{:?}", evdev::EventType(kind));
    if label.starts_with("unknown") {
        None
    } else {
        Some(label)
    }
}
