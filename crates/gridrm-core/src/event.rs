//! Lifecycle events and their delivery to monitors.
//!
//! The core publishes into a bounded queue with `try_send` and never waits
//! for monitors. An [`EventDispatcher`] task drains the queue and hands each
//! event to every registered [`RmMonitor`]. When the queue is full the
//! event is dropped and the mutation that produced it stands.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::node::{NodeState, NodeView};

/// Something that happened to the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RmEvent {
    NodeSourceAdded {
        node_source: String,
    },
    NodeAdded {
        node: NodeView,
    },
    /// The lifecycle state of a node changed.
    NodeStateChanged {
        node: NodeView,
        previous: NodeState,
    },
    /// A node was locked or unlocked; `node.locked` is the new status.
    NodeLockChanged {
        node: NodeView,
    },
    NodeRemoved {
        node: NodeView,
    },
    NodeSourceRemoved {
        node_source: String,
    },
}

impl RmEvent {
    /// URL of the node concerned, for node events.
    pub fn node_url(&self) -> Option<&str> {
        match self {
            RmEvent::NodeAdded { node }
            | RmEvent::NodeStateChanged { node, .. }
            | RmEvent::NodeLockChanged { node }
            | RmEvent::NodeRemoved { node } => Some(&node.url),
            RmEvent::NodeSourceAdded { .. } | RmEvent::NodeSourceRemoved { .. } => None,
        }
    }
}

/// Receives lifecycle events.
pub trait RmMonitor: Send + Sync {
    fn on_event(&self, event: &RmEvent);
}

/// Publishing side of the event queue.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::Sender<RmEvent>,
}

impl EventBus {
    /// Create a bus with room for `capacity` undelivered events.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<RmEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue an event without waiting.
    pub fn publish(&self, event: RmEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(?event, "event queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("event dispatcher gone, event discarded");
            }
        }
    }
}

/// Background task delivering queued events to monitors.
pub struct EventDispatcher {
    rx: mpsc::Receiver<RmEvent>,
    monitors: Vec<Arc<dyn RmMonitor>>,
}

impl EventDispatcher {
    pub fn new(rx: mpsc::Receiver<RmEvent>) -> Self {
        Self {
            rx,
            monitors: Vec::new(),
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn RmMonitor>) -> Self {
        self.monitors.push(monitor);
        self
    }

    /// Deliver events until every publisher is gone.
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            for monitor in &self.monitors {
                monitor.on_event(&event);
            }
        }
        debug!("event dispatcher stopped");
    }
}

/// Monitor that writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMonitor;

impl RmMonitor for LoggingMonitor {
    fn on_event(&self, event: &RmEvent) {
        match event {
            RmEvent::NodeSourceAdded { node_source } => {
                debug!(%node_source, "event: node source added");
            }
            RmEvent::NodeAdded { node } => {
                debug!(node_url = %node.url, state = %node.state, "event: node added");
            }
            RmEvent::NodeStateChanged { node, previous } => {
                debug!(
                    node_url = %node.url,
                    %previous,
                    state = %node.state,
                    locked = node.locked,
                    "event: node state changed"
                );
            }
            RmEvent::NodeLockChanged { node } => {
                debug!(
                    node_url = %node.url,
                    locked = node.locked,
                    lock_owner = ?node.lock_owner,
                    "event: node lock changed"
                );
            }
            RmEvent::NodeRemoved { node } => {
                debug!(node_url = %node.url, "event: node removed");
            }
            RmEvent::NodeSourceRemoved { node_source } => {
                debug!(%node_source, "event: node source removed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<RmEvent>>,
    }

    impl RmMonitor for Recorder {
        fn on_event(&self, event: &RmEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn source_added(name: &str) -> RmEvent {
        RmEvent::NodeSourceAdded {
            node_source: name.to_string(),
        }
    }

    #[tokio::test]
    async fn dispatcher_delivers_to_every_monitor() {
        let (bus, rx) = EventBus::new(8);
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let dispatcher = EventDispatcher::new(rx)
            .with_monitor(first.clone())
            .with_monitor(second.clone());
        let handle = tokio::spawn(dispatcher.run());

        bus.publish(source_added("a"));
        bus.publish(source_added("b"));
        drop(bus);
        handle.await.unwrap();

        assert_eq!(first.events.lock().unwrap().len(), 2);
        assert_eq!(*second.events.lock().unwrap(), vec![source_added("a"), source_added("b")]);
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let (bus, mut rx) = EventBus::new(1);
        bus.publish(source_added("kept"));
        bus.publish(source_added("dropped"));

        assert_eq!(rx.try_recv().unwrap(), source_added("kept"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn publishing_without_dispatcher_is_harmless() {
        let (bus, rx) = EventBus::new(1);
        drop(rx);
        bus.publish(source_added("nobody"));
    }

    #[test]
    fn source_events_have_no_node_url() {
        assert!(source_added("a").node_url().is_none());
    }

    #[test]
    fn events_serialize_with_a_type_tag() {
        let json = serde_json::to_value(source_added("static")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "type": "node_source_added", "node_source": "static" })
        );
    }
}
