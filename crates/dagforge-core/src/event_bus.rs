use tokio::sync::broadcast;

use dagforge_types::DagEvent;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DagEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DagEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: DagEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(DagEvent::DagCreated {
            dag_id: "dag-1".to_string(),
            timestamp_ms: DagEvent::now_ms(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.subject_id(), "dag-1");
    }
}
