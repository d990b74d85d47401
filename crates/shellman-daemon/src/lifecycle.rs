//! Ordered startup/shutdown of background tasks.
//!
//! Stages are registered in teardown order: WS writers, pane ticks,
//! realtime subscriptions, control-mode children, status and task-state
//! pumps, then the store. Shutdown cancels each stage's token in order
//! and waits (bounded) for the task to finish before moving on.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const STAGE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

struct Stage {
    name: &'static str,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

pub struct Lifecycle {
    root: CancellationToken,
    stages: Vec<Stage>,
}

impl Lifecycle {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            stages: Vec::new(),
        }
    }

    pub fn root(&self) -> &CancellationToken {
        &self.root
    }

    /// A child token for a stage, registered in teardown order.
    pub fn stage(&mut self, name: &'static str) -> CancellationToken {
        let cancel = self.root.child_token();
        self.stages.push(Stage {
            name,
            cancel: cancel.clone(),
            handle: None,
        });
        cancel
    }

    /// Attach the stage's task handle so shutdown can await it.
    pub fn attach(&mut self, name: &'static str, handle: JoinHandle<()>) {
        if let Some(stage) = self.stages.iter_mut().rev().find(|s| s.name == name) {
            stage.handle = Some(handle);
        } else {
            tracing::warn!(name, "lifecycle: attach for unknown stage");
        }
    }

    /// Cancel and await every stage in registration order, then the root.
    pub async fn shutdown(mut self) {
        for stage in &mut self.stages {
            tracing::info!(stage = stage.name, "lifecycle: stopping");
            stage.cancel.cancel();
            if let Some(handle) = stage.handle.take() {
                if tokio::time::timeout(STAGE_SHUTDOWN_TIMEOUT, handle)
                    .await
                    .is_err()
                {
                    tracing::warn!(stage = stage.name, "lifecycle: stage did not stop in time");
                }
            }
        }
        self.root.cancel();
    }
}
