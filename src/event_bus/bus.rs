//! Broadcast plumbing between the orchestrator and its sinks.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{sync::oneshot, task};

use super::event::Event;
use super::sink::{EventSink, StdOutSink};

/// Receives lifecycle events on a flume channel and broadcasts each one to
/// every registered sink from a background task.
pub struct EventBus {
    sinks: Arc<Mutex<Vec<Box<dyn EventSink>>>>,
    event_channel: (flume::Sender<Event>, flume::Receiver<Event>),
    listener: Mutex<Option<ListenerState>>,
}

struct ListenerState {
    shutdown_tx: oneshot::Sender<()>,
    handle: task::JoinHandle<()>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_sink(StdOutSink::default())
    }
}

impl EventBus {
    pub fn with_sink<T>(sink: T) -> Self
    where
        T: EventSink + 'static,
    {
        Self::with_sinks(vec![Box::new(sink)])
    }

    pub fn with_sinks(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self {
            sinks: Arc::new(Mutex::new(sinks)),
            event_channel: flume::unbounded(),
            listener: Mutex::new(None),
        }
    }

    /// Dynamically add a sink (subscriptions, per-request streaming).
    pub fn add_sink<T: EventSink + 'static>(&self, sink: T) {
        self.sinks.lock().push(Box::new(sink));
    }

    pub fn add_boxed_sink(&self, sink: Box<dyn EventSink>) {
        self.sinks.lock().push(sink);
    }

    /// Clone of the sender side so producers can emit events.
    #[must_use]
    pub fn sender(&self) -> flume::Sender<Event> {
        self.event_channel.0.clone()
    }

    /// Fire-and-forget emission. A full or disconnected channel is logged,
    /// never propagated: event delivery must not fail orchestration.
    pub fn emit(&self, event: Event) {
        if self.event_channel.0.send(event).is_err() {
            tracing::warn!("event bus channel disconnected; dropping event");
        }
    }

    /// Spawn the background task that fans events out to the sinks.
    /// Idempotent: calling it again has no effect.
    pub fn listen(&self) {
        let mut guard = self.listener.lock();
        if guard.is_some() {
            return;
        }

        let receiver = self.event_channel.1.clone();
        let sinks = self.sinks.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let handle = task::spawn(async move {
            let broadcast = |event: &Event| {
                let mut sinks = sinks.lock();
                for sink in sinks.iter_mut() {
                    if let Err(error) = sink.handle(event) {
                        tracing::warn!(%error, "event sink failed");
                    }
                }
            };
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        // Drain whatever was already enqueued before the
                        // shutdown signal, then stop.
                        while let Ok(event) = receiver.try_recv() {
                            broadcast(&event);
                        }
                        break;
                    }
                    recv = receiver.recv_async() => match recv {
                        Err(_) => break,
                        Ok(event) => broadcast(&event),
                    }
                }
            }
        });

        *guard = Some(ListenerState {
            shutdown_tx,
            handle,
        });
    }

    /// Stop the background listener and wait for it to drain.
    pub async fn stop(&self) {
        let state = self.listener.lock().take();
        if let Some(state) = state {
            let _ = state.shutdown_tx.send(());
            let _ = state.handle.await;
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if let Some(state) = self.listener.lock().take() {
            let _ = state.shutdown_tx.send(());
            state.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::event::WorkflowPhase;
    use crate::event_bus::sink::MemorySink;

    #[tokio::test]
    async fn events_reach_every_sink() {
        let first = MemorySink::new();
        let second = MemorySink::new();
        let bus = EventBus::with_sink(first.clone());
        bus.add_sink(second.clone());
        bus.listen();

        bus.emit(Event::workflow("wf-1", WorkflowPhase::Started));
        bus.emit(Event::diagnostic("scheduler", "tick"));
        bus.stop().await;

        assert_eq!(first.snapshot().len(), 2);
        assert_eq!(second.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn listen_is_idempotent() {
        let sink = MemorySink::new();
        let bus = EventBus::with_sink(sink.clone());
        bus.listen();
        bus.listen();
        bus.emit(Event::diagnostic("s", "once"));
        bus.stop().await;
        assert_eq!(sink.snapshot().len(), 1);
    }
}
