//! Supervisor against real child processes launched through `CommandSpawner`

use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;

use bridgehub_core::{
    BridgeIdentity, CommandSpawner, Supervisor, SupervisorEvent, WorkerSpec, WorkerState,
};

/// `sh -c 'sleep 30' sh bridge <id> <port>`: the positionals land in `$@` and are ignored
fn sleeper() -> Arc<CommandSpawner> {
    Arc::new(CommandSpawner::new("sh").with_args(["-c", "sleep 30", "sh"]))
}

async fn next_event(events: &mut broadcast::Receiver<SupervisorEvent>) -> SupervisorEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_crashed_worker_is_respawned() {
    let supervisor = Supervisor::new(sleeper()).with_kill_grace(Duration::from_secs(1));
    let mut events = supervisor.subscribe();

    assert!(supervisor.launch(WorkerSpec::new("den", 51000)));
    let SupervisorEvent::Launched { pid: Some(first), .. } = next_event(&mut events).await else {
        panic!("expected launch");
    };

    kill(Pid::from_raw(i32::try_from(first).unwrap()), Signal::SIGKILL).unwrap();

    assert!(matches!(
        next_event(&mut events).await,
        SupervisorEvent::Exited { .. }
    ));
    let SupervisorEvent::Respawned { pid: Some(second), restarts, port, .. } =
        next_event(&mut events).await
    else {
        panic!("expected respawn");
    };
    assert_ne!(first, second);
    assert_eq!(restarts, 1);
    assert_eq!(port, 51000);

    let status = supervisor.worker_status("den").unwrap();
    assert_eq!(status.state, WorkerState::Running);
    assert_eq!(status.pid, Some(second));

    supervisor.teardown_all().await;
}

#[tokio::test]
async fn test_teardown_does_not_respawn() {
    let supervisor = Supervisor::new(sleeper()).with_kill_grace(Duration::from_secs(1));
    let mut events = supervisor.subscribe();

    supervisor.launch(WorkerSpec::new("den", 51000));
    next_event(&mut events).await;

    assert!(supervisor.teardown("den").await);
    assert_eq!(
        next_event(&mut events).await,
        SupervisorEvent::TornDown {
            bridge_id: "den".to_string()
        }
    );
    assert!(supervisor.tracked().is_empty());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_reconcile_follows_configuration() {
    let supervisor = Supervisor::new(sleeper()).with_kill_grace(Duration::from_secs(1));

    let mut disabled = BridgeIdentity::worker("garage", 51002);
    disabled.autostart_delay_seconds = -1;
    let bridges = vec![
        BridgeIdentity::worker("den", 51000),
        BridgeIdentity::worker("attic", 51001),
        disabled,
    ];

    let report = supervisor.reconcile(&bridges).await;
    assert_eq!(report.launched, vec!["attic".to_string(), "den".to_string()]);
    assert_eq!(supervisor.tracked(), vec!["attic".to_string(), "den".to_string()]);

    let report = supervisor.reconcile(&bridges).await;
    assert!(report.is_noop());

    let report = supervisor.reconcile(&bridges[..1]).await;
    assert_eq!(report.torn_down, vec!["attic".to_string()]);
    assert_eq!(report.unchanged, vec!["den".to_string()]);

    supervisor.teardown_all().await;
    assert!(supervisor.tracked().is_empty());
}

#[tokio::test]
async fn test_missing_program_reports_spawn_failure() {
    let supervisor = Supervisor::new(Arc::new(CommandSpawner::new(
        "/nonexistent/bridgehub-daemon",
    )));
    let mut events = supervisor.subscribe();

    supervisor.launch(WorkerSpec::new("den", 51000));
    assert!(matches!(
        next_event(&mut events).await,
        SupervisorEvent::SpawnFailed { .. }
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        supervisor.worker_status("den").map(|s| s.state),
        Some(WorkerState::Failed)
    );
}
