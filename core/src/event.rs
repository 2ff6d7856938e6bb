use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Event key type
pub type EventKey = String;

/// Engine event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    /// Event key (e.g., "container.start", "image.build")
    pub key: EventKey,

    /// ID of the container or image the event is about
    pub subject: String,

    /// Extra attributes (exit code, reference, ...)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl EngineEvent {
    /// Create a new event
    pub fn new(key: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            subject: subject.into(),
            attributes: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    /// Attach an attribute
    pub fn with(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.attributes.insert(name.into(), value.to_string());
        self
    }
}

/// Event emitter
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<EngineEvent>>,
}

impl EventEmitter {
    /// Create a new event emitter
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit an event
    pub fn emit(&self, event: EngineEvent) {
        tracing::trace!(key = %event.key, subject = %event.subject, "event");
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Event catalog - predefined event keys
pub mod events {
    // Container events
    pub const CONTAINER_CREATE: &str = "container.create";
    pub const CONTAINER_START: &str = "container.start";
    pub const CONTAINER_STOP: &str = "container.stop";
    pub const CONTAINER_DIE: &str = "container.die";
    pub const CONTAINER_DESTROY: &str = "container.destroy";
    pub const CONTAINER_COMMIT: &str = "container.commit";

    // Image events
    pub const IMAGE_BUILD: &str = "image.build";
    pub const IMAGE_TAG: &str = "image.tag";
    pub const IMAGE_UNTAG: &str = "image.untag";
    pub const IMAGE_DELETE: &str = "image.delete";
    pub const IMAGE_PULL: &str = "image.pull";
    pub const IMAGE_PUSH: &str = "image.push";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_receives_emitted_event() {
        let emitter = EventEmitter::new(8);
        let mut rx = emitter.subscribe();

        emitter.emit(EngineEvent::new(events::CONTAINER_DIE, "abc").with("exit_code", 137));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.key, "container.die");
        assert_eq!(event.subject, "abc");
        assert_eq!(event.attributes.get("exit_code").unwrap(), "137");
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let emitter = EventEmitter::default();
        emitter.emit(EngineEvent::new(events::IMAGE_BUILD, "sha256:00"));
    }
}
