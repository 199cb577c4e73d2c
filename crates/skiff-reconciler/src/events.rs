use serde::Serialize;
use skiff_domain::{AppId, ServiceId};
use tokio::sync::broadcast;

/// In-process lifecycle events. Consumed by the logger, the anomaly
/// recorder, and cloud sync; producers never block on slow consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEvent {
    ServiceStarted { app_id: AppId, service_id: ServiceId },
    ServiceStopped { app_id: AppId, service_id: ServiceId },
    ServicePaused { app_id: AppId, service_id: ServiceId },
    ServiceUnpaused { app_id: AppId, service_id: ServiceId },
    ServiceRecreated { app_id: AppId, service_id: ServiceId },
    ServiceRemoved { app_id: AppId, service_id: ServiceId },
    ServiceFailed {
        app_id: AppId,
        service_id: ServiceId,
        error: String,
    },
    ImagePulled { image: String },
    TargetStateChanged { version: u64, hash: String },
    ReconcilePassCompleted {
        changed: usize,
        failed: usize,
        partial: bool,
    },
    ConnectionHealthChanged {
        from: skiff_domain::ConnectionHealth,
        to: skiff_domain::ConnectionHealth,
    },
}

/// Bounded multi-producer multi-consumer bus. Slow subscribers lose the
/// oldest events; tokio's broadcast channel reports the lag count on the
/// receiver side.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishing with no subscribers is not an error.
    pub fn publish(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_domain::ServiceId;

    fn started(n: u32) -> AgentEvent {
        AgentEvent::ServiceStarted {
            app_id: AppId(n),
            service_id: ServiceId::new("s1"),
        }
    }

    #[tokio::test]
    async fn fan_out_to_multiple_subscribers() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(started(1));
        assert_eq!(a.recv().await.unwrap(), started(1));
        assert_eq!(b.recv().await.unwrap(), started(1));
    }

    #[tokio::test]
    async fn slow_subscriber_loses_oldest_with_count() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.publish(started(i));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert_eq!(n, 3),
            other => panic!("expected lag, got {other:?}"),
        }
        // after the lag, the oldest retained event is delivered
        assert_eq!(rx.recv().await.unwrap(), started(3));
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(2);
        bus.publish(started(1));
    }
}
