//! One supervised worker: its handle and the monitor task that keeps it up

use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::spawner::{WorkerSpawner, WorkerSpec};
use super::SupervisorEvent;

/// Lifecycle state of a worker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Not running; torn down or not yet started
    Stopped,
    /// Waiting out the start delay or spawning
    Starting,
    /// Process is up
    Running,
    /// Process exited; a respawn follows immediately
    Exited,
    /// Spawn failed; waits for the next reconcile
    Failed,
}

/// Status snapshot of one worker
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    /// Bridge id
    pub bridge_id: String,
    /// Accessory protocol port
    pub port: u16,
    /// Current process id
    pub pid: Option<u32>,
    /// Lifecycle state
    pub state: WorkerState,
    /// Respawns since launch
    pub restarts: u32,
}

#[derive(Debug)]
struct Shared {
    pid: Option<u32>,
    state: WorkerState,
    restarts: u32,
    killed: bool,
}

/// Runtime handle for one worker, owned by the supervisor
pub struct WorkerHandle {
    spec: WorkerSpec,
    shared: Arc<Mutex<Shared>>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Start the monitor task for `spec`
    pub(super) fn start(
        spec: WorkerSpec,
        spawner: Arc<dyn WorkerSpawner>,
        events: broadcast::Sender<SupervisorEvent>,
        kill_grace: Duration,
    ) -> Self {
        let shared = Arc::new(Mutex::new(Shared {
            pid: None,
            state: WorkerState::Starting,
            restarts: 0,
            killed: false,
        }));
        let (stop_tx, stop_rx) = oneshot::channel();

        let monitor = Monitor {
            spec: spec.clone(),
            spawner,
            shared: Arc::clone(&shared),
            events,
            kill_grace,
        };
        let task = tokio::spawn(monitor.run(stop_rx));

        Self {
            spec,
            shared,
            stop: Some(stop_tx),
            task,
        }
    }

    /// What this handle launches
    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    /// Whether the monitor has given up (spawn failure or teardown)
    pub fn is_terminated(&self) -> bool {
        self.task.is_finished()
    }

    /// Whether teardown has been requested
    pub fn killed(&self) -> bool {
        self.shared.lock().killed
    }

    /// Current status
    pub fn status(&self) -> WorkerStatus {
        let shared = self.shared.lock();
        WorkerStatus {
            bridge_id: self.spec.bridge_id.clone(),
            port: self.spec.port,
            pid: shared.pid,
            state: shared.state,
            restarts: shared.restarts,
        }
    }

    /// Disarm respawn, terminate the process and wait for it to exit
    pub(super) async fn stop(mut self) {
        self.shared.lock().killed = true;
        if let Some(stop) = self.stop.take() {
            stop.send(()).ok();
        }
        if let Err(e) = self.task.await {
            error!(bridge_id = %self.spec.bridge_id, error = %e, "Worker monitor panicked");
        }
    }
}

struct Monitor {
    spec: WorkerSpec,
    spawner: Arc<dyn WorkerSpawner>,
    shared: Arc<Mutex<Shared>>,
    events: broadcast::Sender<SupervisorEvent>,
    kill_grace: Duration,
}

impl Monitor {
    fn set_state(&self, state: WorkerState, pid: Option<u32>) {
        let mut shared = self.shared.lock();
        shared.state = state;
        shared.pid = pid;
    }

    fn emit(&self, event: SupervisorEvent) {
        // No subscribers is fine.
        self.events.send(event).ok();
    }

    async fn run(self, mut stop_rx: oneshot::Receiver<()>) {
        let bridge_id = self.spec.bridge_id.clone();

        if !self.spec.start_delay.is_zero() {
            debug!(bridge_id = %bridge_id, delay = ?self.spec.start_delay, "Delaying first launch");
            tokio::select! {
                () = tokio::time::sleep(self.spec.start_delay) => {}
                _ = &mut stop_rx => {
                    self.set_state(WorkerState::Stopped, None);
                    return;
                }
            }
        }

        let mut respawn = false;
        loop {
            self.set_state(WorkerState::Starting, None);
            let mut child = match self.spawner.spawn(&self.spec) {
                Ok(child) => child,
                Err(e) => {
                    error!(bridge_id = %bridge_id, error = %e, "Failed to spawn worker");
                    self.set_state(WorkerState::Failed, None);
                    self.emit(SupervisorEvent::SpawnFailed {
                        bridge_id,
                        error: e.to_string(),
                    });
                    return;
                }
            };

            let pid = child.id();
            self.set_state(WorkerState::Running, pid);
            if respawn {
                let restarts = {
                    let mut shared = self.shared.lock();
                    shared.restarts += 1;
                    shared.restarts
                };
                info!(bridge_id = %bridge_id, port = self.spec.port, pid = ?pid, restarts, "Worker respawned");
                self.emit(SupervisorEvent::Respawned {
                    bridge_id: bridge_id.clone(),
                    port: self.spec.port,
                    pid,
                    restarts,
                });
            } else {
                info!(bridge_id = %bridge_id, port = self.spec.port, pid = ?pid, "Worker launched");
                self.emit(SupervisorEvent::Launched {
                    bridge_id: bridge_id.clone(),
                    port: self.spec.port,
                    pid,
                });
            }

            tokio::select! {
                status = child.wait() => {
                    let code = status.as_ref().ok().and_then(std::process::ExitStatus::code);
                    warn!(bridge_id = %bridge_id, pid = ?pid, code = ?code, "Worker exited, respawning");
                    self.set_state(WorkerState::Exited, None);
                    self.emit(SupervisorEvent::Exited {
                        bridge_id: bridge_id.clone(),
                        code,
                    });
                    respawn = true;
                }
                _ = &mut stop_rx => {
                    self.terminate(&mut child, pid).await;
                    self.set_state(WorkerState::Stopped, None);
                    self.emit(SupervisorEvent::TornDown { bridge_id });
                    return;
                }
            }
        }
    }

    async fn terminate(&self, child: &mut Child, pid: Option<u32>) {
        let bridge_id = &self.spec.bridge_id;
        match pid.and_then(|p| i32::try_from(p).ok()) {
            Some(raw) => {
                if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                    warn!(bridge_id = %bridge_id, pid = raw, error = %e, "SIGTERM failed");
                }
            }
            None => debug!(bridge_id = %bridge_id, "Worker already reaped"),
        }

        match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(bridge_id = %bridge_id, status = %status, "Worker stopped");
            }
            Ok(Err(e)) => {
                warn!(bridge_id = %bridge_id, error = %e, "Failed waiting for worker");
            }
            Err(_) => {
                warn!(bridge_id = %bridge_id, grace = ?self.kill_grace, "Worker ignored SIGTERM, killing");
                if let Err(e) = child.kill().await {
                    warn!(bridge_id = %bridge_id, error = %e, "SIGKILL failed");
                }
            }
        }
    }
}
