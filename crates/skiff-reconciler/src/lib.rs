pub mod error;
pub mod events;
pub mod plan;
pub mod reconciler;
pub mod report;

pub use error::ReconcileError;
pub use events::{AgentEvent, EventBus};
pub use plan::{plan_service, Action, ObservedContainer};
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use report::{PassSummary, ServiceFailure};
