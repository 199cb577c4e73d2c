use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Local control API. Bound to loopback by default; the surface is
/// operator-facing and unauthenticated.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::status))
        .route("/diagnostics", get(handlers::diagnostics))
        // Services
        .route("/services", get(handlers::list_services))
        .route("/services/:service_id/logs", get(handlers::service_logs))
        .route("/services/:service_id/:action", post(handlers::service_action))
        .route("/apps/:app_id/:action", post(handlers::app_action))
        // Reconciliation
        .route("/reconcile", post(handlers::trigger_reconcile))
        .route("/reconciliation/pause", post(handlers::pause_reconciliation))
        .route("/reconciliation/resume", post(handlers::resume_reconciliation))
        // Identity lifecycle
        .route("/provision", post(handlers::provision))
        .route("/deprovision", post(handlers::deprovision))
        .route("/factory-reset", post(handlers::factory_reset))
        // Config
        .route("/config", get(handlers::get_config).post(handlers::post_config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
