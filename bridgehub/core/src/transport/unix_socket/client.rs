//! Unix Socket Client (connecting role)
//!
//! `IpcClient` is the per-process connection pool: one live connection per
//! peer identity, opened on first use and reopened after it dies. It is
//! constructed once and shared by `Arc` with whoever needs to talk to a
//! peer.
//!
//! Public calls never fail: a missing endpoint, a refused connection or a
//! peer that hangs up mid-request all resolve to `None` and are logged.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::transport::config::TransportConfig;
use crate::transport::envelope::{RpcEnvelope, SessionToken, VoidEvent, PING_PATH, PONG};
use crate::transport::frame::{encode, FrameDecoder};
use crate::transport::traits::{Params, TransportError};

type PendingReplies = DashMap<SessionToken, oneshot::Sender<Value>>;

/// One pooled connection to a peer
struct PeerConnection {
    outbound: mpsc::Sender<RpcEnvelope>,
    pending: Arc<PendingReplies>,
    alive: Arc<AtomicBool>,
    reader: AbortHandle,
    writer: AbortHandle,
}

impl PeerConnection {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.reader.abort();
        self.writer.abort();
        // Dropping the senders resolves every waiting fetch with `None`.
        self.pending.clear();
    }
}

/// Client-role connection pool
pub struct IpcClient {
    config: TransportConfig,
    peers: DashMap<String, Arc<PeerConnection>>,
    /// Serializes connection setup so concurrent callers share one socket
    connect_lock: Mutex<()>,
}

impl IpcClient {
    /// Create an empty pool
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            peers: DashMap::new(),
            connect_lock: Mutex::new(()),
        }
    }

    /// Transport settings in use
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Endpoint path for a peer
    #[must_use]
    pub fn endpoint(&self, identity: &str) -> PathBuf {
        self.config.namespace.endpoint(identity)
    }

    /// Whether the peer's endpoint file exists
    #[must_use]
    pub fn is_available(&self, identity: &str) -> bool {
        self.config.namespace.is_present(identity)
    }

    /// Identities with a live pooled connection
    #[must_use]
    pub fn connected_peers(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|r| r.value().is_alive())
            .map(|r| r.key().clone())
            .collect()
    }

    /// Call `path` on a peer and wait for its single reply
    ///
    /// Resolves `None` without connecting when the endpoint file is absent,
    /// and `None` on any transport failure. Unless a fetch timeout is
    /// configured, a live peer that never answers keeps this pending.
    pub async fn fetch(
        &self,
        identity: &str,
        path: &str,
        params: Option<Params>,
        body: Option<Value>,
    ) -> Option<Value> {
        if !self.is_available(identity) {
            debug!(peer = %identity, path = %path, "Endpoint absent, skipping fetch");
            return None;
        }

        let peer = match self.peer(identity).await {
            Ok(peer) => peer,
            Err(e) => {
                warn!(peer = %identity, path = %path, error = %e, "Connect failed");
                return None;
            }
        };

        let envelope = RpcEnvelope::request(path, params, body);
        let session = envelope.session.clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        peer.pending.insert(session.clone(), reply_tx);
        if !peer.is_alive() {
            // The reader may have drained `pending` just before our insert.
            peer.pending.remove(&session);
            self.forget(identity, &peer);
            debug!(peer = %identity, path = %path, "Connection died before send");
            return None;
        }

        if peer.outbound.send(envelope).await.is_err() {
            peer.pending.remove(&session);
            self.forget(identity, &peer);
            warn!(peer = %identity, path = %path, "Send failed, connection dropped");
            return None;
        }
        trace!(peer = %identity, path = %path, session = %session, "Request sent");

        let reply = match self.config.fetch_timeout {
            Some(limit) => match tokio::time::timeout(limit, reply_rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    peer.pending.remove(&session);
                    warn!(peer = %identity, path = %path, ?limit, "Fetch timed out");
                    return None;
                }
            },
            None => reply_rx.await,
        };

        match reply {
            Ok(value) => Some(value),
            Err(_) => {
                debug!(peer = %identity, path = %path, "Connection closed before reply");
                None
            }
        }
    }

    /// [`fetch`](Self::fetch) and deserialize the reply
    ///
    /// A reply that does not match `T` is treated like a missing reply.
    pub async fn fetch_as<T: DeserializeOwned>(
        &self,
        identity: &str,
        path: &str,
        params: Option<Params>,
        body: Option<Value>,
    ) -> Option<T> {
        let value = self.fetch(identity, path, params, body).await?;
        match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                debug!(peer = %identity, path = %path, error = %e, "Unexpected reply shape");
                None
            }
        }
    }

    /// Deliver a void event; returns once it has been queued for writing
    pub async fn emit(&self, identity: &str, event: VoidEvent, data: Value) {
        if !self.is_available(identity) {
            debug!(peer = %identity, event = %event, "Endpoint absent, dropping event");
            return;
        }

        match self.peer(identity).await {
            Ok(peer) => {
                if peer
                    .outbound
                    .send(RpcEnvelope::event(event, data))
                    .await
                    .is_err()
                {
                    self.forget(identity, &peer);
                    debug!(peer = %identity, event = %event, "Event send failed");
                }
            }
            Err(e) => debug!(peer = %identity, event = %event, error = %e, "Connect failed"),
        }
    }

    /// One heartbeat round on a fresh connection: send `ping`, expect `pong`
    ///
    /// The whole round (connect, write, read) must finish within `within`.
    pub async fn ping(&self, identity: &str, within: Duration) -> bool {
        if !self.is_available(identity) {
            return false;
        }
        let path = self.endpoint(identity);
        match tokio::time::timeout(within, ping_once(path)).await {
            Ok(Ok(pong)) => pong,
            Ok(Err(e)) => {
                debug!(peer = %identity, error = %e, "Ping failed");
                false
            }
            Err(_) => {
                debug!(peer = %identity, "Ping timed out");
                false
            }
        }
    }

    /// Close the pooled connection to `identity`, if any
    pub fn disconnect(&self, identity: &str) {
        self.drop_peer(identity);
    }

    /// Close every pooled connection
    pub fn close_all(&self) {
        let ids: Vec<String> = self.peers.iter().map(|r| r.key().clone()).collect();
        for id in ids {
            self.drop_peer(&id);
        }
    }

    fn drop_peer(&self, identity: &str) {
        if let Some((_, peer)) = self.peers.remove(identity) {
            peer.close();
        }
    }

    /// Remove `peer` from the pool unless it was already replaced
    fn forget(&self, identity: &str, peer: &Arc<PeerConnection>) {
        peer.close();
        self.peers
            .remove_if(identity, |_, current| Arc::ptr_eq(current, peer));
    }

    /// Return the live connection to `identity`, opening one if needed
    async fn peer(&self, identity: &str) -> Result<Arc<PeerConnection>, TransportError> {
        if let Some(peer) = self.live_peer(identity) {
            return Ok(peer);
        }

        let _guard = self.connect_lock.lock().await;
        if let Some(peer) = self.live_peer(identity) {
            return Ok(peer);
        }

        let path = self.endpoint(identity);
        let stream = UnixStream::connect(&path).await.map_err(|e| {
            TransportError::ConnectionFailed(format!("failed to connect to {path:?}: {e}"))
        })?;
        let peer = Arc::new(open_connection(
            identity,
            stream,
            self.config.channel_capacity,
        ));
        self.peers.insert(identity.to_string(), Arc::clone(&peer));
        debug!(peer = %identity, "Connected");
        Ok(peer)
    }

    fn live_peer(&self, identity: &str) -> Option<Arc<PeerConnection>> {
        let peer = Arc::clone(self.peers.get(identity)?.value());
        if peer.is_alive() {
            Some(peer)
        } else {
            self.forget(identity, &peer);
            None
        }
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        for entry in &self.peers {
            entry.value().close();
        }
    }
}

/// Spawn the reader and writer tasks for a freshly connected stream
fn open_connection(identity: &str, stream: UnixStream, capacity: usize) -> PeerConnection {
    let (mut read_half, mut write_half) = stream.into_split();
    let (outbound, mut outbound_rx) = mpsc::channel::<RpcEnvelope>(capacity);
    let pending: Arc<PendingReplies> = Arc::new(DashMap::new());
    let alive = Arc::new(AtomicBool::new(true));

    let writer_alive = Arc::clone(&alive);
    let writer_pending = Arc::clone(&pending);
    let writer_peer = identity.to_string();
    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            let frame = match encode(&envelope) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(peer = %writer_peer, path = %envelope.path, error = %e, "Encode error");
                    continue;
                }
            };
            if let Err(e) = write_half.write_all(&frame).await {
                debug!(peer = %writer_peer, error = %e, "Write error");
                break;
            }
        }
        writer_alive.store(false, Ordering::SeqCst);
        writer_pending.clear();
    });

    let reader_alive = Arc::clone(&alive);
    let reader_pending = Arc::clone(&pending);
    let reader_peer = identity.to_string();
    let reader = tokio::spawn(async move {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 8192];

        'read: loop {
            let n = match read_half.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(peer = %reader_peer, error = %e, "Read error");
                    break;
                }
            };
            decoder.push(&buf[..n]);

            loop {
                match decoder.next_frame::<RpcEnvelope>() {
                    Ok(Some(envelope)) if envelope.is_reply() => {
                        match reader_pending.remove(&envelope.session) {
                            Some((_, waiter)) => {
                                waiter.send(envelope.body.unwrap_or(Value::Null)).ok();
                            }
                            None => trace!(
                                peer = %reader_peer,
                                session = %envelope.session,
                                "Reply for unknown session"
                            ),
                        }
                    }
                    Ok(Some(envelope)) => {
                        trace!(peer = %reader_peer, path = %envelope.path, "Ignoring non-reply")
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(peer = %reader_peer, error = %e, "Frame decode error");
                        break 'read;
                    }
                }
            }
        }

        reader_alive.store(false, Ordering::SeqCst);
        reader_pending.clear();
        debug!(peer = %reader_peer, "Connection closed");
    });

    PeerConnection {
        outbound,
        pending,
        alive,
        reader: reader.abort_handle(),
        writer: writer.abort_handle(),
    }
}

async fn ping_once(path: PathBuf) -> Result<bool, TransportError> {
    let mut stream = UnixStream::connect(&path).await?;
    let ping = RpcEnvelope::request(PING_PATH, None, None);
    stream.write_all(&encode(&ping)?).await?;

    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 512];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(TransportError::ConnectionClosed);
        }
        decoder.push(&buf[..n]);
        if let Some(reply) = decoder.next_frame::<RpcEnvelope>()? {
            return Ok(reply.session == ping.session && reply.body == Some(Value::from(PONG)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::unix_socket::IpcServer;
    use tempfile::TempDir;

    fn client_in(dir: &TempDir) -> IpcClient {
        IpcClient::new(TransportConfig::new(dir.path()))
    }

    #[tokio::test]
    async fn test_fetch_absent_endpoint_is_none() {
        let dir = TempDir::new().unwrap();
        let client = client_in(&dir);

        assert!(client.fetch("nobody", "status:get", None, None).await.is_none());
        assert!(client.connected_peers().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_roundtrip() {
        let dir = TempDir::new().unwrap();
        let client = client_in(&dir);
        let server = IpcServer::new("den", client.endpoint("den"));
        server.route("echo", |params: Params, body: Value| async move {
            serde_json::json!({ "params": params, "body": body })
        });
        server.listen().await.unwrap();

        let mut params = Params::new();
        params.insert("uuid".to_string(), "abc".to_string());
        let reply = client
            .fetch("den", "echo", Some(params), Some(Value::from(42)))
            .await
            .unwrap();

        assert_eq!(reply["params"]["uuid"], "abc");
        assert_eq!(reply["body"], 42);
        assert_eq!(client.connected_peers(), vec!["den".to_string()]);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_socket_file_resolves_none() {
        let dir = TempDir::new().unwrap();
        let client = client_in(&dir);
        std::fs::write(client.endpoint("ghost"), b"").unwrap();

        assert!(client.fetch("ghost", "status:get", None, None).await.is_none());
    }

    #[tokio::test]
    async fn test_fetch_timeout_resolves_none() {
        let dir = TempDir::new().unwrap();
        let config = TransportConfig::new(dir.path()).with_fetch_timeout(Duration::from_millis(50));
        let client = IpcClient::new(config);
        let server = IpcServer::new("slow", client.endpoint("slow"));
        server.route("hang", |_p, _b| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Value::Null
        });
        server.listen().await.unwrap();

        assert!(client.fetch("slow", "hang", None, None).await.is_none());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_ping_live_and_dead() {
        let dir = TempDir::new().unwrap();
        let client = client_in(&dir);
        assert!(!client.ping("hub", Duration::from_millis(200)).await);

        let server = IpcServer::new("hub", client.endpoint("hub"));
        server.listen().await.unwrap();
        assert!(client.ping("hub", Duration::from_secs(1)).await);

        server.shutdown().await;
        assert!(!client.ping("hub", Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn test_reconnects_after_peer_restart() {
        let dir = TempDir::new().unwrap();
        let client = client_in(&dir);
        let server = IpcServer::new("den", client.endpoint("den"));
        server.route("status:get", |_p, _b| async { Value::from("ok") });
        server.listen().await.unwrap();

        assert_eq!(
            client.fetch("den", "status:get", None, None).await,
            Some(Value::from("ok"))
        );

        server.restart().await.unwrap();
        // The pooled connection was cut; the first call may observe that.
        let first = client.fetch("den", "status:get", None, None).await;
        let reply = match first {
            Some(reply) => reply,
            None => client.fetch("den", "status:get", None, None).await.unwrap(),
        };
        assert_eq!(reply, Value::from("ok"));
        server.shutdown().await;
    }
}
