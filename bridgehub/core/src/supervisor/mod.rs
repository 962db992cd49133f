//! Process Supervisor
//!
//! Runs one OS process per worker bridge and keeps it running.
//!
//! ```text
//!   launch ──▶ Starting ──▶ Running ──exit──▶ Exited ──▶ Starting ...
//!                 │                                  (no backoff)
//!                 └─spawn error──▶ Failed   (retried by the next reconcile)
//!   teardown ──▶ SIGTERM ──▶ wait ──▶ Stopped
//! ```
//!
//! Recovery is crash-only: any exit not caused by `teardown` respawns the
//! same id/port immediately, without backoff or a restart ceiling. A worker
//! that crashes on startup therefore busy-loops; `WorkerStatus::restarts`
//! makes that visible.

mod spawner;
mod worker;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::BridgeIdentity;

pub use spawner::{CommandSpawner, WorkerSpawner, WorkerSpec};
pub use worker::{WorkerHandle, WorkerState, WorkerStatus};

/// How long a worker gets between SIGTERM and SIGKILL
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(10);

/// Lifecycle notifications
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SupervisorEvent {
    /// First spawn of a handle
    Launched {
        /// Bridge id
        bridge_id: String,
        /// Port
        port: u16,
        /// Process id
        pid: Option<u32>,
    },
    /// Spawn after an unexpected exit
    Respawned {
        /// Bridge id
        bridge_id: String,
        /// Port
        port: u16,
        /// New process id
        pid: Option<u32>,
        /// Respawns so far
        restarts: u32,
    },
    /// Process exited on its own
    Exited {
        /// Bridge id
        bridge_id: String,
        /// Exit code, if it exited normally
        code: Option<i32>,
    },
    /// Process could not be started
    SpawnFailed {
        /// Bridge id
        bridge_id: String,
        /// OS error
        error: String,
    },
    /// Teardown finished
    TornDown {
        /// Bridge id
        bridge_id: String,
    },
}

/// What a reconcile pass changed
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Ids launched (new, relaunched after failure, or port changed)
    pub launched: Vec<String>,
    /// Ids torn down
    pub torn_down: Vec<String>,
    /// Ids left running
    pub unchanged: Vec<String>,
}

impl ReconcileReport {
    /// Whether nothing was started or stopped
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.launched.is_empty() && self.torn_down.is_empty()
    }
}

/// Owner of all worker handles
pub struct Supervisor {
    spawner: Arc<dyn WorkerSpawner>,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    events: broadcast::Sender<SupervisorEvent>,
    kill_grace: Duration,
}

impl Supervisor {
    /// Supervisor launching through `spawner`
    pub fn new(spawner: Arc<dyn WorkerSpawner>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            spawner,
            workers: Mutex::new(HashMap::new()),
            events,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    /// Override the SIGTERM grace period
    #[must_use]
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Receive lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Start supervising `spec`
    ///
    /// Returns false if the id is already tracked and its monitor is alive.
    /// A terminated handle for the id is replaced.
    pub fn launch(&self, spec: WorkerSpec) -> bool {
        let mut workers = self.workers.lock();
        if let Some(existing) = workers.get(&spec.bridge_id) {
            if !existing.is_terminated() {
                debug!(bridge_id = %spec.bridge_id, "Already supervised");
                return false;
            }
        }

        info!(bridge_id = %spec.bridge_id, port = spec.port, delay = ?spec.start_delay, "Launching worker");
        let id = spec.bridge_id.clone();
        let handle = WorkerHandle::start(
            spec,
            Arc::clone(&self.spawner),
            self.events.clone(),
            self.kill_grace,
        );
        workers.insert(id, handle);
        true
    }

    /// Stop supervising `bridge_id` and wait for its process to exit
    ///
    /// Returns false if the id was not tracked.
    pub async fn teardown(&self, bridge_id: &str) -> bool {
        let handle = self.workers.lock().remove(bridge_id);
        match handle {
            Some(handle) => {
                info!(bridge_id, "Tearing down worker");
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    /// Tear down every worker
    pub async fn teardown_all(&self) {
        let handles: Vec<WorkerHandle> = self.workers.lock().drain().map(|(_, h)| h).collect();
        futures::future::join_all(handles.into_iter().map(WorkerHandle::stop)).await;
    }

    /// Restart one worker in place, keeping its spec
    ///
    /// Returns false if the id was not tracked.
    pub async fn restart(&self, bridge_id: &str) -> bool {
        let spec = self.workers.lock().get(bridge_id).map(|h| WorkerSpec {
            start_delay: Duration::ZERO,
            ..h.spec().clone()
        });
        let Some(spec) = spec else {
            return false;
        };
        self.teardown(bridge_id).await;
        self.launch(spec)
    }

    /// Bring the running set in line with `bridges`
    ///
    /// Desired = worker bridges with a non-negative autostart delay.
    pub async fn reconcile(&self, bridges: &[BridgeIdentity]) -> ReconcileReport {
        let desired: HashMap<&str, &BridgeIdentity> = bridges
            .iter()
            .filter(|b| b.is_supervised())
            .map(|b| (b.id.as_str(), b))
            .collect();

        let mut report = ReconcileReport::default();

        let stale: Vec<String> = self
            .workers
            .lock()
            .iter()
            .filter(|(id, handle)| {
                desired
                    .get(id.as_str())
                    .map_or(true, |b| b.port != handle.spec().port)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            self.teardown(&id).await;
            report.torn_down.push(id);
        }

        let running: HashSet<String> = self
            .workers
            .lock()
            .iter()
            .filter(|(_, h)| !h.is_terminated())
            .map(|(id, _)| id.clone())
            .collect();

        let mut ids: Vec<&&str> = desired.keys().collect();
        ids.sort();
        for id in ids {
            if running.contains(*id) {
                report.unchanged.push((*id).to_string());
            } else if self.launch(WorkerSpec::from_identity(desired[*id])) {
                report.launched.push((*id).to_string());
            }
        }

        if !report.is_noop() {
            info!(
                launched = ?report.launched,
                torn_down = ?report.torn_down,
                "Reconciled workers"
            );
        }
        report
    }

    /// Status of every tracked worker, sorted by id
    pub fn status(&self) -> Vec<WorkerStatus> {
        let mut status: Vec<WorkerStatus> =
            self.workers.lock().values().map(WorkerHandle::status).collect();
        status.sort_by(|a, b| a.bridge_id.cmp(&b.bridge_id));
        status
    }

    /// Status of one worker
    pub fn worker_status(&self, bridge_id: &str) -> Option<WorkerStatus> {
        self.workers.lock().get(bridge_id).map(WorkerHandle::status)
    }

    /// Ids currently tracked
    pub fn tracked(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workers.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    use pretty_assertions::assert_eq;
    use tokio::process::{Child, Command};

    /// Runs `sleep 30` and records every spawn
    #[derive(Default)]
    struct SleepSpawner {
        spawned: Mutex<Vec<(String, u16)>>,
    }

    impl WorkerSpawner for SleepSpawner {
        fn spawn(&self, spec: &WorkerSpec) -> std::io::Result<Child> {
            self.spawned.lock().push((spec.bridge_id.clone(), spec.port));
            Command::new("sleep").arg("30").kill_on_drop(true).spawn()
        }
    }

    struct FailingSpawner;

    impl WorkerSpawner for FailingSpawner {
        fn spawn(&self, _spec: &WorkerSpec) -> std::io::Result<Child> {
            Command::new("/nonexistent/bridgehub-worker").spawn()
        }
    }

    async fn wait_for<F>(rx: &mut broadcast::Receiver<SupervisorEvent>, mut pred: F) -> SupervisorEvent
    where
        F: FnMut(&SupervisorEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    fn supervisor() -> (Arc<SleepSpawner>, Supervisor) {
        let spawner = Arc::new(SleepSpawner::default());
        let supervisor = Supervisor::new(spawner.clone()).with_kill_grace(Duration::from_secs(2));
        (spawner, supervisor)
    }

    #[tokio::test]
    async fn test_launch_is_idempotent() {
        let (spawner, supervisor) = supervisor();
        let mut rx = supervisor.subscribe();

        assert!(supervisor.launch(WorkerSpec::new("den", 51000)));
        assert!(!supervisor.launch(WorkerSpec::new("den", 51000)));
        wait_for(&mut rx, |e| matches!(e, SupervisorEvent::Launched { .. })).await;

        let status = supervisor.worker_status("den").unwrap();
        assert_eq!(status.state, WorkerState::Running);
        assert!(status.pid.is_some());
        assert_eq!(spawner.spawned.lock().len(), 1);

        supervisor.teardown_all().await;
    }

    #[tokio::test]
    async fn test_killed_worker_respawns_with_same_identity() {
        let (spawner, supervisor) = supervisor();
        let mut rx = supervisor.subscribe();

        supervisor.launch(WorkerSpec::new("den", 51000));
        let first = match wait_for(&mut rx, |e| matches!(e, SupervisorEvent::Launched { .. })).await {
            SupervisorEvent::Launched { pid, .. } => pid.unwrap(),
            _ => unreachable!(),
        };

        for round in 1..=2u32 {
            let pid = supervisor.worker_status("den").unwrap().pid.unwrap();
            kill(Pid::from_raw(i32::try_from(pid).unwrap()), Signal::SIGKILL).unwrap();

            let event = wait_for(&mut rx, |e| matches!(e, SupervisorEvent::Respawned { .. })).await;
            match event {
                SupervisorEvent::Respawned {
                    bridge_id,
                    port,
                    pid: new_pid,
                    restarts,
                } => {
                    assert_eq!(bridge_id, "den");
                    assert_eq!(port, 51000);
                    assert_eq!(restarts, round);
                    assert_ne!(new_pid, Some(first));
                }
                _ => unreachable!(),
            }
        }

        let spawned = spawner.spawned.lock().clone();
        assert_eq!(spawned, vec![("den".to_string(), 51000); 3]);
        supervisor.teardown_all().await;
    }

    #[tokio::test]
    async fn test_teardown_does_not_respawn() {
        let (spawner, supervisor) = supervisor();
        let mut rx = supervisor.subscribe();

        supervisor.launch(WorkerSpec::new("den", 51000));
        wait_for(&mut rx, |e| matches!(e, SupervisorEvent::Launched { .. })).await;
        let pid = supervisor.worker_status("den").unwrap().pid.unwrap();

        assert!(supervisor.teardown("den").await);
        assert!(supervisor.worker_status("den").is_none());
        assert!(!supervisor.teardown("den").await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(spawner.spawned.lock().len(), 1);
        // Signal 0 checks for existence; the process must be gone.
        assert!(kill(Pid::from_raw(i32::try_from(pid).unwrap()), None::<Signal>).is_err());
    }

    #[tokio::test]
    async fn test_teardown_during_start_delay() {
        let (spawner, supervisor) = supervisor();
        let spec = WorkerSpec {
            start_delay: Duration::from_secs(60),
            ..WorkerSpec::new("den", 51000)
        };
        supervisor.launch(spec);
        assert_eq!(supervisor.worker_status("den").unwrap().state, WorkerState::Starting);

        assert!(supervisor.teardown("den").await);
        assert!(spawner.spawned.lock().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile() {
        let (_, supervisor) = supervisor();
        let mut rx = supervisor.subscribe();

        let mut disabled = BridgeIdentity::worker("garage", 51002);
        disabled.autostart_delay_seconds = -1;
        let mut control = BridgeIdentity::worker("control", 51003);
        control.kind = crate::config::BridgeKind::Control;

        let bridges = vec![
            BridgeIdentity::worker("den", 51000),
            BridgeIdentity::worker("attic", 51001),
            disabled,
            control,
        ];
        let report = supervisor.reconcile(&bridges).await;
        assert_eq!(report.launched, vec!["attic".to_string(), "den".to_string()]);
        assert!(report.torn_down.is_empty());
        for _ in 0..2 {
            wait_for(&mut rx, |e| matches!(e, SupervisorEvent::Launched { .. })).await;
        }

        let again = supervisor.reconcile(&bridges).await;
        assert!(again.is_noop());
        assert_eq!(again.unchanged, vec!["attic".to_string(), "den".to_string()]);

        let moved = vec![BridgeIdentity::worker("den", 52000)];
        let report = supervisor.reconcile(&moved).await;
        assert_eq!(report.torn_down.len(), 2);
        assert_eq!(report.launched, vec!["den".to_string()]);
        assert_eq!(supervisor.tracked(), vec!["den".to_string()]);
        assert_eq!(supervisor.worker_status("den").unwrap().port, 52000);

        supervisor.teardown_all().await;
        assert!(supervisor.status().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_marks_failed_and_reconcile_retries() {
        let supervisor = Supervisor::new(Arc::new(FailingSpawner));
        let mut rx = supervisor.subscribe();

        let bridges = vec![BridgeIdentity::worker("den", 51000)];
        supervisor.reconcile(&bridges).await;
        wait_for(&mut rx, |e| matches!(e, SupervisorEvent::SpawnFailed { .. })).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(supervisor.worker_status("den").unwrap().state, WorkerState::Failed);

        let report = supervisor.reconcile(&bridges).await;
        assert_eq!(report.launched, vec!["den".to_string()]);
    }
}
