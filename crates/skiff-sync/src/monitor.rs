use std::sync::atomic::{AtomicU32, Ordering};

use skiff_domain::ConnectionHealth;
use skiff_reconciler::{AgentEvent, EventBus};
use tokio::sync::watch;
use tracing::info;

const DEGRADED_AFTER: u32 = 2;
const OFFLINE_AFTER: u32 = 3;

/// Three-state view of cloud reachability, fed by both sync loops.
/// Transitions go out on the event bus and through a watch channel other
/// components (the log uploader) read without polling.
pub struct ConnectionMonitor {
    state: watch::Sender<ConnectionHealth>,
    consecutive_failures: AtomicU32,
    events: EventBus,
}

impl ConnectionMonitor {
    pub fn new(events: EventBus) -> Self {
        let (state, _) = watch::channel(ConnectionHealth::Online);
        Self {
            state,
            consecutive_failures: AtomicU32::new(0),
            events,
        }
    }

    pub fn health(&self) -> ConnectionHealth {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionHealth> {
        self.state.subscribe()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.transition(ConnectionHealth::Online);
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= OFFLINE_AFTER {
            self.transition(ConnectionHealth::Offline);
        } else if failures >= DEGRADED_AFTER {
            self.transition(ConnectionHealth::Degraded);
        }
    }

    fn transition(&self, to: ConnectionHealth) {
        let from = *self.state.borrow();
        if from == to {
            return;
        }
        info!(%from, %to, "connection health changed");
        self.state.send_replace(to);
        self.events
            .publish(AgentEvent::ConnectionHealthChanged { from, to });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degrades_then_goes_offline() {
        let monitor = ConnectionMonitor::new(EventBus::new(16));
        assert_eq!(monitor.health(), ConnectionHealth::Online);

        monitor.record_failure();
        assert_eq!(monitor.health(), ConnectionHealth::Online);
        monitor.record_failure();
        assert_eq!(monitor.health(), ConnectionHealth::Degraded);
        monitor.record_failure();
        assert_eq!(monitor.health(), ConnectionHealth::Offline);
        monitor.record_failure();
        assert_eq!(monitor.health(), ConnectionHealth::Offline);
    }

    #[test]
    fn success_resets_to_online() {
        let monitor = ConnectionMonitor::new(EventBus::new(16));
        for _ in 0..5 {
            monitor.record_failure();
        }
        monitor.record_success();
        assert_eq!(monitor.health(), ConnectionHealth::Online);
        assert_eq!(monitor.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn transitions_are_published() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let monitor = ConnectionMonitor::new(bus);
        monitor.record_failure();
        monitor.record_failure();
        monitor.record_failure();
        monitor.record_success();

        let mut transitions = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let AgentEvent::ConnectionHealthChanged { from, to } = event {
                transitions.push((from, to));
            }
        }
        assert_eq!(
            transitions,
            vec![
                (ConnectionHealth::Online, ConnectionHealth::Degraded),
                (ConnectionHealth::Degraded, ConnectionHealth::Offline),
                (ConnectionHealth::Offline, ConnectionHealth::Online),
            ]
        );
    }

    #[test]
    fn watch_subscribers_see_the_latest_state() {
        let monitor = ConnectionMonitor::new(EventBus::new(16));
        let rx = monitor.subscribe();
        for _ in 0..3 {
            monitor.record_failure();
        }
        assert_eq!(*rx.borrow(), ConnectionHealth::Offline);
    }
}
