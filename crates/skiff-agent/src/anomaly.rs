use std::sync::Arc;

use chrono::Utc;
use skiff_domain::AnomalyRecord;
use skiff_reconciler::AgentEvent;
use skiff_store::DeviceStore;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Consumes lifecycle events and appends the failures to the store's
/// anomaly history.
pub async fn run(
    store: Arc<dyn DeviceStore>,
    mut events: broadcast::Receiver<AgentEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(AgentEvent::ServiceFailed {
                app_id,
                service_id,
                error,
            }) => {
                let record = AnomalyRecord {
                    id: 0,
                    at: Utc::now(),
                    component: "state-reconciler".to_string(),
                    kind: "service_failed".to_string(),
                    service: Some(format!("{app_id}/{service_id}")),
                    message: error,
                };
                if let Err(e) = store.append_anomaly(&record).await {
                    warn!(target: "skiff_agent::anomaly", error = %e, "failed to record anomaly");
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(target: "skiff_agent::anomaly", dropped = n, "anomaly recorder lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
