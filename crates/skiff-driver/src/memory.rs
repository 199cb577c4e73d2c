use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::driver::ContainerDriver;
use crate::error::DriverError;
use crate::types::{ContainerDetail, ContainerState, ContainerSummary, CreateSpec};

/// Every mutation the driver performed, in order. Reconciler tests assert on
/// this journal (idempotence: a second pass adds nothing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverOp {
    Pull(String),
    Create(String),
    Start(String),
    Stop(String),
    Pause(String),
    Unpause(String),
    Remove(String),
}

struct FakeContainer {
    id: String,
    name: String,
    image: String,
    state: ContainerState,
    exit_code: Option<i64>,
    labels: BTreeMap<String, String>,
    logs: Vec<String>,
    created_at: chrono::DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    containers: HashMap<String, FakeContainer>,
    images: HashSet<String>,
    journal: Vec<DriverOp>,
    fail_next: HashMap<&'static str, VecDeque<DriverError>>,
    runtime_down: bool,
    next_id: u64,
}

/// In-memory container runtime. Used by the agent when no runtime socket is
/// configured and by every reconciler test; failures and crashes are
/// scriptable.
#[derive(Default)]
pub struct MemoryDriver {
    inner: Mutex<Inner>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed an image so the next pull is a no-op.
    pub fn seed_image(&self, reference: &str) {
        self.inner.lock().unwrap().images.insert(reference.to_string());
    }

    /// Queue an error for the next invocation of `op`
    /// (`"pull" | "create" | "start" | "stop" | "pause" | "unpause" | "remove" | "list" | "inspect"`).
    pub fn fail_next(&self, op: &'static str, error: DriverError) {
        self.inner
            .lock()
            .unwrap()
            .fail_next
            .entry(op)
            .or_default()
            .push_back(error);
    }

    pub fn set_runtime_down(&self, down: bool) {
        self.inner.lock().unwrap().runtime_down = down;
    }

    /// Simulate a container crashing out from under the agent.
    pub fn exit_container(&self, id: &str, code: i64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(c) = inner.containers.get_mut(id) {
            c.state = ContainerState::Exited;
            c.exit_code = Some(code);
        }
    }

    pub fn push_log(&self, id: &str, line: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(c) = inner.containers.get_mut(id) {
            c.logs.push(line.into());
        }
    }

    pub fn journal(&self) -> Vec<DriverOp> {
        self.inner.lock().unwrap().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.inner.lock().unwrap().journal.clear();
    }

    pub fn container_count(&self) -> usize {
        self.inner.lock().unwrap().containers.len()
    }
}

impl Inner {
    fn gate(&mut self, op: &'static str) -> Result<(), DriverError> {
        if self.runtime_down {
            return Err(DriverError::RuntimeDown("runtime is down".into()));
        }
        if let Some(queue) = self.fail_next.get_mut(op) {
            if let Some(err) = queue.pop_front() {
                return Err(err);
            }
        }
        Ok(())
    }

    fn get(&self, id: &str) -> Result<&FakeContainer, DriverError> {
        self.containers
            .get(id)
            .ok_or_else(|| DriverError::NotFound(format!("no such container: {id}")))
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut FakeContainer, DriverError> {
        self.containers
            .get_mut(id)
            .ok_or_else(|| DriverError::NotFound(format!("no such container: {id}")))
    }
}

#[async_trait]
impl ContainerDriver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn list_containers(
        &self,
        label_filter: &[(String, String)],
    ) -> Result<Vec<ContainerSummary>, DriverError> {
        let mut inner = self.inner.lock().unwrap();
        inner.gate("list")?;
        let mut out: Vec<ContainerSummary> = inner
            .containers
            .values()
            .filter(|c| {
                label_filter
                    .iter()
                    .all(|(k, v)| c.labels.get(k) == Some(v))
            })
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.name.clone(),
                image: c.image.clone(),
                state: c.state,
                labels: c.labels.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetail, DriverError> {
        let mut inner = self.inner.lock().unwrap();
        inner.gate("inspect")?;
        let c = inner.get(id)?;
        Ok(ContainerDetail {
            id: c.id.clone(),
            name: c.name.clone(),
            image: c.image.clone(),
            image_digest: Some(format!("sha256:{:016x}", fxhash(&c.image))),
            state: c.state,
            exit_code: c.exit_code,
            labels: c.labels.clone(),
            created_at: c.created_at,
        })
    }

    async fn pull_image(&self, reference: &str) -> Result<(), DriverError> {
        let mut inner = self.inner.lock().unwrap();
        inner.gate("pull")?;
        if inner.images.insert(reference.to_string()) {
            debug!(image = reference, "MemoryDriver: image pulled");
            inner.journal.push(DriverOp::Pull(reference.to_string()));
        }
        Ok(())
    }

    async fn create(&self, spec: &CreateSpec) -> Result<String, DriverError> {
        let mut inner = self.inner.lock().unwrap();
        inner.gate("create")?;
        if !inner.images.contains(&spec.image) {
            return Err(DriverError::ImageUnavailable(spec.image.clone()));
        }
        if inner.containers.values().any(|c| c.name == spec.name) {
            return Err(DriverError::Conflict(format!(
                "container name '{}' already in use",
                spec.name
            )));
        }
        inner.next_id += 1;
        let id = format!("ctr-{:08x}", inner.next_id);
        debug!(id = %id, name = %spec.name, "MemoryDriver: container created");
        inner.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                state: ContainerState::Created,
                exit_code: None,
                labels: spec.labels.clone(),
                logs: Vec::new(),
                created_at: Utc::now(),
            },
        );
        inner.journal.push(DriverOp::Create(spec.name.clone()));
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), DriverError> {
        let mut inner = self.inner.lock().unwrap();
        inner.gate("start")?;
        let c = inner.get_mut(id)?;
        match c.state {
            // already started: runtime treats this as success
            ContainerState::Running => Ok(()),
            ContainerState::Paused => Err(DriverError::Conflict(
                "cannot start a paused container, unpause it".into(),
            )),
            _ => {
                c.state = ContainerState::Running;
                c.exit_code = None;
                let id = id.to_string();
                inner.journal.push(DriverOp::Start(id));
                Ok(())
            }
        }
    }

    async fn stop(&self, id: &str, _timeout: Duration) -> Result<(), DriverError> {
        let mut inner = self.inner.lock().unwrap();
        inner.gate("stop")?;
        let c = inner.get_mut(id)?;
        match c.state {
            ContainerState::Exited | ContainerState::Created => Ok(()),
            _ => {
                c.state = ContainerState::Exited;
                c.exit_code = Some(0);
                let id = id.to_string();
                inner.journal.push(DriverOp::Stop(id));
                Ok(())
            }
        }
    }

    async fn pause(&self, id: &str) -> Result<(), DriverError> {
        let mut inner = self.inner.lock().unwrap();
        inner.gate("pause")?;
        let c = inner.get_mut(id)?;
        match c.state {
            ContainerState::Paused => Ok(()),
            ContainerState::Running => {
                c.state = ContainerState::Paused;
                let id = id.to_string();
                inner.journal.push(DriverOp::Pause(id));
                Ok(())
            }
            other => Err(DriverError::Conflict(format!(
                "cannot pause container in state {other}"
            ))),
        }
    }

    async fn unpause(&self, id: &str) -> Result<(), DriverError> {
        let mut inner = self.inner.lock().unwrap();
        inner.gate("unpause")?;
        let c = inner.get_mut(id)?;
        match c.state {
            ContainerState::Running => Ok(()),
            ContainerState::Paused => {
                c.state = ContainerState::Running;
                let id = id.to_string();
                inner.journal.push(DriverOp::Unpause(id));
                Ok(())
            }
            other => Err(DriverError::Conflict(format!(
                "cannot unpause container in state {other}"
            ))),
        }
    }

    async fn remove(&self, id: &str, force: bool) -> Result<(), DriverError> {
        let mut inner = self.inner.lock().unwrap();
        inner.gate("remove")?;
        let state = inner.get(id)?.state;
        if state == ContainerState::Running && !force {
            return Err(DriverError::Conflict(
                "cannot remove a running container without force".into(),
            ));
        }
        inner.containers.remove(id);
        inner.journal.push(DriverOp::Remove(id.to_string()));
        Ok(())
    }

    async fn container_logs(
        &self,
        id: &str,
        tail: Option<usize>,
    ) -> Result<Vec<String>, DriverError> {
        let mut inner = self.inner.lock().unwrap();
        inner.gate("logs")?;
        let c = inner.get(id)?;
        let logs = &c.logs;
        let start = tail.map(|n| logs.len().saturating_sub(n)).unwrap_or(0);
        Ok(logs[start..].to_vec())
    }
}

fn fxhash(s: &str) -> u64 {
    // tiny stable hash for synthetic image digests
    s.bytes().fold(0xcbf29ce484222325u64, |acc, b| {
        (acc ^ b as u64).wrapping_mul(0x100000001b3)
    })
}
