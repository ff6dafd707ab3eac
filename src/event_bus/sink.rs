//! Output targets for lifecycle events.

use parking_lot::Mutex;
use std::io::{self, Result as IoResult, Stdout, Write};
use std::sync::Arc;

use super::event::Event;
use crate::telemetry::{PlainFormatter, TelemetryFormatter};

/// Abstraction over an output target that consumes full [`Event`] objects.
pub trait EventSink: Send + Sync {
    /// Handle a structured event. The sink decides how to serialize or
    /// format it.
    fn handle(&mut self, event: &Event) -> IoResult<()>;
}

/// Stdout sink with pluggable formatting.
pub struct StdOutSink<F: TelemetryFormatter = PlainFormatter> {
    handle: Stdout,
    formatter: F,
}

impl Default for StdOutSink {
    fn default() -> Self {
        Self {
            handle: io::stdout(),
            formatter: PlainFormatter::new(),
        }
    }
}

impl<F: TelemetryFormatter> StdOutSink<F> {
    pub fn with_formatter(formatter: F) -> Self {
        Self {
            handle: io::stdout(),
            formatter,
        }
    }
}

impl<F: TelemetryFormatter> EventSink for StdOutSink<F> {
    fn handle(&mut self, event: &Event) -> IoResult<()> {
        let rendered = self.formatter.render_event(event);
        self.handle.write_all(rendered.as_bytes())?;
        self.handle.flush()
    }
}

/// In-memory sink for tests and snapshots.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<Event>>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All captured events so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Event> {
        self.entries.lock().clone()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn handle(&mut self, event: &Event) -> IoResult<()> {
        self.entries.lock().push(event.clone());
        Ok(())
    }
}

/// Channel sink for pull-style consumers (subscriptions).
///
/// Events are forwarded into a flume channel without blocking; the receiver
/// side works from both sync and async contexts.
pub struct ChannelSink {
    tx: flume::Sender<Event>,
}

impl ChannelSink {
    pub fn new(tx: flume::Sender<Event>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn handle(&mut self, event: &Event) -> IoResult<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "subscriber dropped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::event::WorkflowPhase;

    #[test]
    fn memory_sink_accumulates() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer
            .handle(&Event::workflow("wf-1", WorkflowPhase::Started))
            .unwrap();
        writer
            .handle(&Event::diagnostic("scheduler", "pass complete"))
            .unwrap();
        assert_eq!(sink.snapshot().len(), 2);
        sink.clear();
        assert!(sink.snapshot().is_empty());
    }

    #[test]
    fn channel_sink_reports_dropped_subscriber() {
        let (tx, rx) = flume::unbounded();
        let mut sink = ChannelSink::new(tx);
        sink.handle(&Event::diagnostic("s", "m")).unwrap();
        assert_eq!(rx.len(), 1);
        drop(rx);
        assert!(sink.handle(&Event::diagnostic("s", "m")).is_err());
    }
}
