use skiff_domain::{DesiredState, Service};
use skiff_driver::{config_fingerprint, ContainerState};

/// What the driver reports for one managed container, keyed back to its
/// service through the reserved labels.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedContainer {
    pub id: String,
    pub state: ContainerState,
    pub image: String,
    pub config_hash: Option<String>,
}

/// The single-service plan. Sequences are expanded by the executor:
/// `Create` is pull-if-needed → create [→ start [→ pause]], `Recreate` is
/// stop-if-running → remove → pull-if-needed → create → start [→ pause].
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    NoOp,
    Create { start: bool, pause: bool },
    Recreate { id: String, start: bool, pause: bool },
    Start { id: String, pause: bool },
    Unpause { id: String },
    Pause { id: String },
    Stop { id: String },
    UnpauseThenStop { id: String },
}

/// Pure diff for one `(app_id, service_id)` slot with a target present.
/// Containers whose slot vanished from the target never reach this function;
/// the pass removes them up front.
pub fn plan_service(service: &Service, observed: Option<&ObservedContainer>) -> Action {
    let desired = service.desired_state;
    let Some(obs) = observed else {
        return match desired {
            DesiredState::Running => Action::Create { start: true, pause: false },
            DesiredState::Stopped => Action::Create { start: false, pause: false },
            DesiredState::Paused => Action::Create { start: true, pause: true },
        };
    };

    // Spec drift or image change always forces a recreate; the declared
    // target is authoritative, container ids are not preserved across it.
    let fingerprint = config_fingerprint(service);
    let drifted = obs.config_hash.as_deref() != Some(fingerprint.as_str())
        || obs.image != service.image_name;
    if drifted {
        return Action::Recreate {
            id: obs.id.clone(),
            start: desired != DesiredState::Stopped,
            pause: desired == DesiredState::Paused,
        };
    }

    use ContainerState::*;
    match (desired, obs.state) {
        (DesiredState::Running, Running) => Action::NoOp,
        (DesiredState::Running, Paused) => Action::Unpause { id: obs.id.clone() },
        (DesiredState::Running, Exited | Dead) => Action::Recreate {
            id: obs.id.clone(),
            start: true,
            pause: false,
        },
        // created-but-never-started only needs a start
        (DesiredState::Running, Created) => Action::Start { id: obs.id.clone(), pause: false },

        (DesiredState::Paused, Running) => Action::Pause { id: obs.id.clone() },
        (DesiredState::Paused, Paused) => Action::NoOp,
        (DesiredState::Paused, Exited | Dead) => Action::Recreate {
            id: obs.id.clone(),
            start: true,
            pause: true,
        },
        (DesiredState::Paused, Created) => Action::Start { id: obs.id.clone(), pause: true },

        (DesiredState::Stopped, Running) => Action::Stop { id: obs.id.clone() },
        (DesiredState::Stopped, Paused) => Action::UnpauseThenStop { id: obs.id.clone() },
        (DesiredState::Stopped, Exited | Dead | Created) => Action::NoOp,

        // a container mid-removal or in an unknown state is left for the
        // next pass to observe cleanly
        (_, Removing | Unknown) => Action::NoOp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_domain::{ServiceConfig, ServiceId};
    use std::collections::BTreeMap;

    fn service(desired: DesiredState) -> Service {
        Service {
            service_id: ServiceId::new("s1"),
            service_name: "nginx".into(),
            image_name: "nginx:1.25".into(),
            desired_state: desired,
            config: ServiceConfig::default(),
            extra: BTreeMap::new(),
        }
    }

    fn observed(service: &Service, state: ContainerState) -> ObservedContainer {
        ObservedContainer {
            id: "ctr-1".into(),
            state,
            image: service.image_name.clone(),
            config_hash: Some(config_fingerprint(service)),
        }
    }

    #[test]
    fn absent_container_rows() {
        assert_eq!(
            plan_service(&service(DesiredState::Running), None),
            Action::Create { start: true, pause: false }
        );
        assert_eq!(
            plan_service(&service(DesiredState::Stopped), None),
            Action::Create { start: false, pause: false }
        );
        assert_eq!(
            plan_service(&service(DesiredState::Paused), None),
            Action::Create { start: true, pause: true }
        );
    }

    #[test]
    fn running_desired_rows() {
        let svc = service(DesiredState::Running);
        assert_eq!(
            plan_service(&svc, Some(&observed(&svc, ContainerState::Running))),
            Action::NoOp
        );
        assert_eq!(
            plan_service(&svc, Some(&observed(&svc, ContainerState::Paused))),
            Action::Unpause { id: "ctr-1".into() }
        );
        assert_eq!(
            plan_service(&svc, Some(&observed(&svc, ContainerState::Exited))),
            Action::Recreate { id: "ctr-1".into(), start: true, pause: false }
        );
    }

    #[test]
    fn paused_desired_rows() {
        let svc = service(DesiredState::Paused);
        assert_eq!(
            plan_service(&svc, Some(&observed(&svc, ContainerState::Running))),
            Action::Pause { id: "ctr-1".into() }
        );
        assert_eq!(
            plan_service(&svc, Some(&observed(&svc, ContainerState::Paused))),
            Action::NoOp
        );
        assert_eq!(
            plan_service(&svc, Some(&observed(&svc, ContainerState::Exited))),
            Action::Recreate { id: "ctr-1".into(), start: true, pause: true }
        );
    }

    #[test]
    fn stopped_desired_rows() {
        let svc = service(DesiredState::Stopped);
        assert_eq!(
            plan_service(&svc, Some(&observed(&svc, ContainerState::Running))),
            Action::Stop { id: "ctr-1".into() }
        );
        assert_eq!(
            plan_service(&svc, Some(&observed(&svc, ContainerState::Paused))),
            Action::UnpauseThenStop { id: "ctr-1".into() }
        );
        assert_eq!(
            plan_service(&svc, Some(&observed(&svc, ContainerState::Exited))),
            Action::NoOp
        );
    }

    #[test]
    fn config_drift_forces_recreate() {
        let svc = service(DesiredState::Running);
        let mut obs = observed(&svc, ContainerState::Running);
        obs.config_hash = Some("stale".into());
        assert_eq!(
            plan_service(&svc, Some(&obs)),
            Action::Recreate { id: "ctr-1".into(), start: true, pause: false }
        );
    }

    #[test]
    fn image_change_forces_recreate() {
        let mut svc = service(DesiredState::Running);
        let obs = observed(&svc, ContainerState::Running);
        svc.image_name = "nginx:1.27".into();
        assert!(matches!(
            plan_service(&svc, Some(&obs)),
            Action::Recreate { .. }
        ));
    }

    #[test]
    fn drift_with_stopped_target_recreates_without_start() {
        let svc = service(DesiredState::Stopped);
        let mut obs = observed(&svc, ContainerState::Exited);
        obs.config_hash = Some("stale".into());
        assert_eq!(
            plan_service(&svc, Some(&obs)),
            Action::Recreate { id: "ctr-1".into(), start: false, pause: false }
        );
    }

    #[test]
    fn missing_fingerprint_label_counts_as_drift() {
        let svc = service(DesiredState::Running);
        let mut obs = observed(&svc, ContainerState::Running);
        obs.config_hash = None;
        assert!(matches!(plan_service(&svc, Some(&obs)), Action::Recreate { .. }));
    }
}
