use std::sync::Arc;

use tokio::sync::Notify;

/// Handle used to request an immediate poll (MQTT update message, local
/// admin). Pokes coalesce: Notify stores at most one pending permit, so a
/// burst of wake-ups produces a single extra poll.
#[derive(Clone, Default)]
pub struct Wakeup(Arc<Notify>);

impl Wakeup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poke(&self) {
        self.0.notify_one();
    }

    pub async fn wait(&self) {
        self.0.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn poke_wakes_a_waiter() {
        let wakeup = Wakeup::new();
        let waiter = wakeup.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        wakeup.poke();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn pokes_coalesce() {
        let wakeup = Wakeup::new();
        wakeup.poke();
        wakeup.poke();
        wakeup.poke();
        // one stored permit
        wakeup.wait().await;
        let second = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            wakeup.wait(),
        )
        .await;
        assert!(second.is_err(), "extra pokes must coalesce into one permit");
    }
}
