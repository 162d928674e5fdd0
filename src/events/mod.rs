// Lifecycle events for the worklet bridge
//
// Runtimes being created, destroyed and the bridge being installed or torn
// down are published on a broadcast bus so embedders can observe them without
// polling the registry.

use crate::runtime::{RuntimeId, RuntimeKind};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tokio::sync::broadcast;

/// Default number of events buffered per subscriber
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum RuntimeEvent {
    Installed {
        runtime_id: RuntimeId,
        name: String,
    },

    RuntimeCreated {
        runtime_id: RuntimeId,
        name: String,
        kind: RuntimeKind,
    },

    RuntimeDestroyed {
        runtime_id: RuntimeId,
        name: String,
        cancelled_tasks: usize,
    },

    TornDown,
}

impl RuntimeEvent {
    pub fn name(&self) -> Cow<'static, str> {
        match self {
            RuntimeEvent::Installed { .. } => Cow::Borrowed("bridge.installed"),
            RuntimeEvent::RuntimeCreated { .. } => Cow::Borrowed("runtime.created"),
            RuntimeEvent::RuntimeDestroyed { .. } => Cow::Borrowed("runtime.destroyed"),
            RuntimeEvent::TornDown => Cow::Borrowed("bridge.torn-down"),
        }
    }
}

/// Broadcast bus for [`RuntimeEvent`]s
///
/// Emitting never blocks and never fails; events sent while nobody is
/// subscribed are dropped (fire-and-forget semantics).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all current subscribers
    pub fn emit(&self, event: RuntimeEvent) {
        tracing::trace!(event = %event.name(), "emitting runtime event");
        let _ = self.sender.send(event);
    }

    /// Receive every event emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
