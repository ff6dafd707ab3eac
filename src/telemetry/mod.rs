//! Event formatting and tracing-subscriber setup.

use std::io::IsTerminal;
use tracing_subscriber::EnvFilter;

use crate::event_bus::{Event, NodePhase};

const LINE_COLOR: &str = "\x1b[35m"; // magenta
const ERROR_COLOR: &str = "\x1b[31m"; // red
const RESET_COLOR: &str = "\x1b[0m";

/// Color mode for formatted output.
///
/// - [`FormatterMode::Auto`] detects TTY capability via `stderr`
/// - [`FormatterMode::Colored`] always emits ANSI codes
/// - [`FormatterMode::Plain`] never does (log files, CI)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatterMode {
    #[default]
    Auto,
    Colored,
    Plain,
}

impl FormatterMode {
    #[must_use]
    pub fn auto_detect() -> Self {
        if std::io::stderr().is_terminal() {
            FormatterMode::Colored
        } else {
            FormatterMode::Plain
        }
    }

    /// For `Auto`, performs TTY detection on each call.
    #[must_use]
    pub fn is_colored(&self) -> bool {
        match self {
            FormatterMode::Auto => std::io::stderr().is_terminal(),
            FormatterMode::Colored => true,
            FormatterMode::Plain => false,
        }
    }
}

/// Renders events for a sink. Implementations must be cheap: the bus calls
/// this on its broadcast task for every event.
pub trait TelemetryFormatter: Send + Sync {
    /// Render one event, newline-terminated.
    fn render_event(&self, event: &Event) -> String;
}

/// Plain text formatter with optional ANSI colors; failures render in red.
pub struct PlainFormatter {
    mode: FormatterMode,
}

impl PlainFormatter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            mode: FormatterMode::Auto,
        }
    }

    #[must_use]
    pub fn with_mode(mode: FormatterMode) -> Self {
        Self { mode }
    }

    fn is_failure(event: &Event) -> bool {
        match event {
            Event::Node(node) => matches!(node.phase, NodePhase::Failed { .. }),
            Event::Workflow(wf) => matches!(
                wf.phase,
                crate::event_bus::WorkflowPhase::Failed | crate::event_bus::WorkflowPhase::Cancelled
            ),
            Event::Diagnostic(_) => false,
        }
    }
}

impl Default for PlainFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryFormatter for PlainFormatter {
    fn render_event(&self, event: &Event) -> String {
        if self.mode.is_colored() {
            let color = if Self::is_failure(event) {
                ERROR_COLOR
            } else {
                LINE_COLOR
            };
            format!("{color}{event}{RESET_COLOR}\n")
        } else {
            format!("{event}\n")
        }
    }
}

/// Install a global tracing subscriber honoring `RUST_LOG` (default `info`).
///
/// Safe to call more than once; later calls are no-ops. Binaries call this
/// at startup; tests call it to surface scheduler diagnostics.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::WorkflowPhase;

    #[test]
    fn plain_mode_has_no_ansi_codes() {
        let formatter = PlainFormatter::with_mode(FormatterMode::Plain);
        let rendered = formatter.render_event(&Event::workflow("wf-1", WorkflowPhase::Started));
        assert!(!rendered.contains('\x1b'));
        assert!(rendered.ends_with('\n'));
    }

    #[test]
    fn colored_mode_marks_failures_red() {
        let formatter = PlainFormatter::with_mode(FormatterMode::Colored);
        let rendered = formatter.render_event(&Event::workflow("wf-1", WorkflowPhase::Failed));
        assert!(rendered.starts_with(ERROR_COLOR));
    }
}
