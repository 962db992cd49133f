//! Heartbeat
//!
//! Liveness check run by the connecting side. Once per interval it opens a
//! fresh connection to its peer, sends `ping` and expects `pong` within the
//! same interval. A missed round means the peer may be dead and this
//! process may be out of sync with it, so the pooled connection is dropped
//! and the local listening endpoint is restarted in place.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::unix_socket::{IpcClient, IpcServer};

/// Shortest interval the loop will tick at
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Heartbeat settings
#[derive(Clone, Debug)]
pub struct HeartbeatConfig {
    /// Identity of the peer to ping
    pub peer: String,
    /// Time between rounds; also the deadline for one round
    pub interval: Duration,
}

impl HeartbeatConfig {
    /// Ping `peer` every `interval`
    pub fn new(peer: impl Into<String>, interval: Duration) -> Self {
        Self {
            peer: peer.into(),
            interval,
        }
    }
}

/// Outcome of one heartbeat round
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// `pong` received
    Healthy {
        /// Peer that answered
        peer: String,
    },
    /// No `pong` this round; the local endpoint was restarted
    PeerUnresponsive {
        /// Peer that did not answer
        peer: String,
        /// Consecutive missed rounds, including this one
        missed: u32,
        /// Whether the local endpoint came back up
        relistened: bool,
    },
}

/// Periodic ping/pong driver
pub struct HeartbeatTask {
    config: HeartbeatConfig,
    client: Arc<IpcClient>,
    server: Arc<IpcServer>,
    events: Option<mpsc::Sender<HeartbeatEvent>>,
    missed: u32,
}

/// Handle used to stop a running heartbeat
pub struct HeartbeatHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Stop the heartbeat and wait for its loop to exit
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            stop.send(()).ok();
        }
        self.task.await.ok();
    }
}

impl HeartbeatTask {
    /// Heartbeat for `server`'s process, pinging through `client`
    #[must_use]
    pub fn new(config: HeartbeatConfig, client: Arc<IpcClient>, server: Arc<IpcServer>) -> Self {
        Self {
            config,
            client,
            server,
            events: None,
            missed: 0,
        }
    }

    /// Report every round's outcome on `events`
    #[must_use]
    pub fn with_events(mut self, events: mpsc::Sender<HeartbeatEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Run one ping/pong round and react to the result
    pub async fn tick(&mut self) -> HeartbeatEvent {
        let peer = self.config.peer.clone();

        if self.client.ping(&peer, self.config.interval).await {
            if self.missed > 0 {
                info!(peer = %peer, missed = self.missed, "Peer answering again");
            }
            self.missed = 0;
            debug!(peer = %peer, "Heartbeat ok");
            return HeartbeatEvent::Healthy { peer };
        }

        self.missed += 1;
        warn!(peer = %peer, missed = self.missed, "Heartbeat missed, restarting local endpoint");
        self.client.disconnect(&peer);

        let relistened = match self.server.restart().await {
            Ok(()) => true,
            Err(e) => {
                warn!(identity = %self.server.identity(), error = %e, "Failed to relisten");
                false
            }
        };

        HeartbeatEvent::PeerUnresponsive {
            peer,
            missed: self.missed,
            relistened,
        }
    }

    /// Start the loop on the runtime
    ///
    /// Intervals below [`MIN_HEARTBEAT_INTERVAL`] are raised to it.
    #[must_use]
    pub fn spawn(mut self) -> HeartbeatHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        self.config.interval = self.config.interval.max(MIN_HEARTBEAT_INTERVAL);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; give the peer one interval to come up.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let event = self.tick().await;
                        if let Some(events) = &self.events {
                            events.send(event).await.ok();
                        }
                    }
                }
            }
            debug!(peer = %self.config.peer, "Heartbeat stopped");
        });

        HeartbeatHandle {
            stop: Some(stop_tx),
            task,
        }
    }
}
