use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::DeliberationId;

/// Signals for downstream consumers such as graph building.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data", rename_all = "kebab-case")]
pub enum DedupEvent {
    DeduplicateFinished {
        deliberation_id: DeliberationId,
        canonicals_created: usize,
        cards_linked: u64,
    },
}

impl DedupEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DedupEvent::DeduplicateFinished { .. } => "deduplicate-finished",
        }
    }

    pub fn deliberation_id(&self) -> DeliberationId {
        match self {
            DedupEvent::DeduplicateFinished { deliberation_id, .. } => *deliberation_id,
        }
    }
}

/// In-process fan-out of pipeline events. Publishing never fails; events
/// sent while nobody listens are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DedupEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DedupEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: DedupEvent) {
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => debug!(event = name, receivers, "Published event"),
            Err(_) => debug!(event = name, "No subscribers for event"),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(DedupEvent::DeduplicateFinished {
            deliberation_id: 7,
            canonicals_created: 1,
            cards_linked: 3,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "deduplicate-finished");
        assert_eq!(event.deliberation_id(), 7);
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new(0);
        bus.publish(DedupEvent::DeduplicateFinished {
            deliberation_id: 1,
            canonicals_created: 0,
            cards_linked: 0,
        });
    }

    #[test]
    fn test_event_wire_format() {
        let event = DedupEvent::DeduplicateFinished {
            deliberation_id: 3,
            canonicals_created: 2,
            cards_linked: 5,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["name"], "deduplicate-finished");
        assert_eq!(json["data"]["deliberation_id"], 3);
    }
}
