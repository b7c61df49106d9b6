use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::{Error, Result};

/// Lifecycle of a fetch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    StopRequested,
    Stopped,
}

/// The loop's view of the lifecycle: observes stop requests.
#[derive(Debug, Clone)]
pub struct StopSignal {
    state: watch::Receiver<LoopState>,
}

impl StopSignal {
    pub fn is_requested(&self) -> bool {
        *self.state.borrow() != LoopState::Running
    }

    /// Resolves once a stop has been requested. Also resolves if the
    /// controller is gone, since nobody can stop the loop any more.
    pub async fn requested(&mut self) {
        let _ = self
            .state
            .wait_for(|state| *state != LoopState::Running)
            .await;
    }
}

/// Runs the fetch loop task and coordinates its shutdown.
///
/// `Running` → `StopRequested` → `Stopped`. The task publishes `Stopped`
/// only after its own cleanup has finished, so [`stop`](Self::stop)
/// returning means connections are closed and the change channel is closed.
pub struct LifecycleController {
    state: Arc<watch::Sender<LoopState>>,
    task: Option<JoinHandle<Result<()>>>,
}

impl LifecycleController {
    /// Spawns `run` with a [`StopSignal`]. Its result becomes the loop's
    /// terminal result.
    pub fn spawn<F, Fut>(run: F) -> Self
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, rx) = watch::channel(LoopState::Running);
        let state = Arc::new(tx);
        let done = state.clone();

        let fut = run(StopSignal { state: rx });
        let task = tokio::spawn(async move {
            let result = fut.await;
            done.send_replace(LoopState::Stopped);
            debug!("Fetch loop reported stopped");
            result
        });

        Self {
            state,
            task: Some(task),
        }
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Watch the loop state, e.g. to notice a fatal exit without stopping.
    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    /// Requests a stop and waits until the loop has fully shut down.
    ///
    /// Returns the loop's terminal result: `Ok(())` for a requested stop,
    /// or the fatal error that ended it. Later calls return `Ok(())`.
    pub async fn stop(&mut self) -> Result<()> {
        let requested = self.state.send_if_modified(|state| {
            if *state == LoopState::Running {
                *state = LoopState::StopRequested;
                true
            } else {
                false
            }
        });
        if requested {
            info!("Stop requested, waiting for fetch loop to exit");
        }
        self.join().await
    }

    /// Waits for the loop to end on its own and returns its terminal result.
    pub async fn wait_stopped(&mut self) -> Result<()> {
        self.join().await
    }

    async fn join(&mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Ok(result) => result,
            Err(e) => Err(Error::Replication {
                message: format!("fetch loop task failed: {}", e),
            }),
        }
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        // Let a detached loop wind down at its next report tick.
        self.state.send_if_modified(|state| {
            if *state == LoopState::Running {
                *state = LoopState::StopRequested;
                true
            } else {
                false
            }
        });
    }
}
