//! Lifecycle event fan-out.
//!
//! The orchestrator emits a closed union of lifecycle events
//! ([`Event`]) into an [`EventBus`]; a background task broadcasts each
//! event to every registered [`EventSink`]. Sinks cover the common
//! consumption styles: stdout logging, in-memory capture for tests, and
//! channel forwarding for subscriptions.

pub mod bus;
pub mod event;
pub mod sink;

pub use bus::EventBus;
pub use event::{DiagnosticEvent, Event, NodeEvent, NodePhase, WorkflowEvent, WorkflowPhase};
pub use sink::{ChannelSink, EventSink, MemorySink, StdOutSink};
