use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

const MAX_CONSECUTIVE_PANICS: u32 = 3;

/// Spawns long-running tasks behind a panic barrier. A panicked task is
/// logged and restarted with exponential backoff; repeated panics in the
/// same task escalate through `fatal_tx`, which the orchestrator turns into
/// process exit code 2.
pub struct TaskSupervisor {
    fatal_tx: mpsc::Sender<String>,
}

impl TaskSupervisor {
    pub fn new() -> (Self, mpsc::Receiver<String>) {
        let (fatal_tx, fatal_rx) = mpsc::channel(8);
        (Self { fatal_tx }, fatal_rx)
    }

    /// `factory` is invoked for the initial run and once per restart; it
    /// receives the task's cancellation token each time.
    pub fn spawn<F, Fut>(
        &self,
        name: &'static str,
        cancel: CancellationToken,
        mut factory: F,
    ) -> JoinHandle<()>
    where
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let fatal_tx = self.fatal_tx.clone();
        tokio::spawn(async move {
            let mut consecutive_panics = 0u32;
            let mut backoff = Duration::from_millis(500);
            loop {
                let run = tokio::spawn(factory(cancel.clone()));
                match run.await {
                    // clean return: the task observed cancellation
                    Ok(()) => return,
                    Err(e) if e.is_panic() => {
                        consecutive_panics += 1;
                        error!(
                            task = name,
                            panics = consecutive_panics,
                            "task panicked"
                        );
                        if consecutive_panics >= MAX_CONSECUTIVE_PANICS {
                            let _ = fatal_tx
                                .send(format!("task '{name}' panicked {consecutive_panics} times"))
                                .await;
                            return;
                        }
                    }
                    Err(_) => return,
                }
                if cancel.is_cancelled() {
                    return;
                }
                warn!(task = name, backoff_ms = backoff.as_millis() as u64, "restarting task");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(Duration::from_secs(30));
            }
        })
    }
}
