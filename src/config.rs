//! Runtime configuration for the orchestrator.
//!
//! Defaults resolve once from the environment (via `dotenvy`) with sane
//! fallbacks; everything is overridable through the builder-style `with_*`
//! methods.

use rustc_hash::FxHashMap;
use std::time::Duration;

use crate::event_bus::{EventBus, MemorySink, StdOutSink};
use crate::types::RunnerKind;

/// Environment variable overriding the reconciliation interval (millis).
pub const POLL_INTERVAL_ENV: &str = "FLOWSMITH_POLL_INTERVAL_MS";
/// Environment variable overriding the default per-slot capacity.
pub const DEFAULT_SLOTS_ENV: &str = "FLOWSMITH_DEFAULT_SLOTS";

const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_SLOTS: usize = 4;

/// Per-backend admission capacity.
///
/// Capacity is tracked per `(RunnerKind, cluster)` slot; slots without an
/// explicit entry use `default_slots`.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub default_slots: usize,
    pub slots: FxHashMap<(RunnerKind, Option<String>), usize>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        dotenvy::dotenv().ok();
        let default_slots = std::env::var(DEFAULT_SLOTS_ENV)
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_SLOTS);
        Self {
            default_slots,
            slots: FxHashMap::default(),
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub fn with_default_slots(mut self, slots: usize) -> Self {
        self.default_slots = slots;
        self
    }

    /// Override capacity for one `(runner, cluster)` slot.
    #[must_use]
    pub fn with_slot(
        mut self,
        runner: RunnerKind,
        cluster: Option<String>,
        slots: usize,
    ) -> Self {
        self.slots.insert((runner, cluster), slots);
        self
    }

    #[must_use]
    pub fn capacity_for(&self, runner: RunnerKind, cluster: Option<&str>) -> usize {
        self.slots
            .get(&(runner, cluster.map(str::to_string)))
            .copied()
            .unwrap_or(self.default_slots)
    }
}

/// Which sinks the orchestrator's event bus starts with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkConfig {
    StdOut,
    Memory,
}

#[derive(Clone, Debug)]
pub struct EventBusConfig {
    pub sinks: Vec<SinkConfig>,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            sinks: vec![SinkConfig::StdOut],
        }
    }
}

impl EventBusConfig {
    /// No initial sinks; subscribers attach their own.
    #[must_use]
    pub fn silent() -> Self {
        Self { sinks: Vec::new() }
    }

    #[must_use]
    pub fn add_sink(mut self, sink: SinkConfig) -> Self {
        if !self.sinks.contains(&sink) {
            self.sinks.push(sink);
        }
        self
    }

    #[must_use]
    pub fn build_event_bus(&self) -> EventBus {
        let bus = EventBus::with_sinks(Vec::new());
        for sink in &self.sinks {
            match sink {
                SinkConfig::StdOut => bus.add_sink(StdOutSink::default()),
                SinkConfig::Memory => bus.add_sink(MemorySink::new()),
            }
        }
        bus
    }
}

/// Top-level orchestrator configuration.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Interval between reconciliation passes of the background scheduler.
    pub poll_interval: Duration,
    pub queue: QueueConfig,
    pub event_bus: EventBusConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        dotenvy::dotenv().ok();
        let poll_ms = std::env::var(POLL_INTERVAL_ENV)
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        Self {
            poll_interval: Duration::from_millis(poll_ms),
            queue: QueueConfig::default(),
            event_bus: EventBusConfig::default(),
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    #[must_use]
    pub fn with_event_bus(mut self, event_bus: EventBusConfig) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Convenience for tests: no stdout noise.
    #[must_use]
    pub fn silent() -> Self {
        Self::default().with_event_bus(EventBusConfig::silent())
    }
}
