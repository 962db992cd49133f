//! Unix Socket Server (listening role)
//!
//! Accepts connections on the process's own endpoint and answers envelopes
//! from the route table. Each connection gets a reader loop and a writer
//! task; each request is handled on its own task so a slow handler never
//! blocks other sessions multiplexed on the same connection.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn, Instrument};

use crate::transport::envelope::{RpcEnvelope, VoidEvent, PING_PATH, PONG};
use crate::transport::frame::{encode, FrameDecoder};
use crate::transport::traits::{RouteHandler, TransportError};

/// Capacity of the void-event broadcast channel
const EVENT_CAPACITY: usize = 256;

/// Outbound queue depth per connection
const WRITE_QUEUE: usize = 64;

type RouteTable = DashMap<String, Arc<dyn RouteHandler>>;

/// A void event delivered to this process
#[derive(Clone, Debug, PartialEq)]
pub struct InboundEvent {
    /// Which event
    pub event: VoidEvent,
    /// Event payload (`Null` when the sender attached none)
    pub data: Value,
}

/// Server-side endpoint of one process
///
/// All methods take `&self` so the server can be shared behind an `Arc`
/// between the accept loop, route registration and the heartbeat, which
/// may restart it in place.
pub struct IpcServer {
    /// Identity this endpoint is named after
    identity: String,
    /// Path to the socket file
    socket_path: PathBuf,
    /// Path → handler
    routes: Arc<RouteTable>,
    /// Void events received on any connection
    events: broadcast::Sender<InboundEvent>,
    /// Accept loop, present while listening
    accept_task: Mutex<Option<JoinHandle<()>>>,
    /// Live connection tasks, aborted on shutdown
    connections: Arc<DashMap<u64, AbortHandle>>,
}

impl IpcServer {
    /// Create a server for `identity` bound at `socket_path` once listening
    pub fn new(identity: impl Into<String>, socket_path: PathBuf) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            identity: identity.into(),
            socket_path,
            routes: Arc::new(DashMap::new()),
            events,
            accept_task: Mutex::new(None),
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Identity this server answers for
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Socket file path
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Register (or replace) the handler for `path`
    pub fn route<H>(&self, path: impl Into<String>, handler: H)
    where
        H: RouteHandler + 'static,
    {
        let path = path.into();
        debug!(identity = %self.identity, path = %path, "Route registered");
        self.routes.insert(path, Arc::new(handler));
    }

    /// Registered application paths
    #[must_use]
    pub fn routes(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.routes.iter().map(|r| r.key().clone()).collect();
        paths.sort();
        paths
    }

    /// Receive every void event delivered after this call
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<InboundEvent> {
        self.events.subscribe()
    }

    /// Whether the accept loop is running
    pub async fn is_listening(&self) -> bool {
        self.accept_task.lock().await.is_some()
    }

    /// Number of open connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Bind the endpoint and start accepting connections
    ///
    /// Calling this while already listening does nothing.
    pub async fn listen(&self) -> Result<(), TransportError> {
        let mut accept_task = self.accept_task.lock().await;
        if accept_task.is_some() {
            return Ok(());
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TransportError::IoError(std::io::Error::new(
                    e.kind(),
                    format!("failed to create directory {parent:?}: {e}"),
                ))
            })?;
        }

        if self.socket_path.exists() {
            warn!(path = ?self.socket_path, "Removing stale socket file");
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;

        let task = tokio::spawn(
            accept_loop(
                listener,
                Arc::clone(&self.routes),
                self.events.clone(),
                Arc::clone(&self.connections),
            )
            .instrument(tracing::info_span!("ipc_server", identity = %self.identity)),
        );
        *accept_task = Some(task);

        info!(identity = %self.identity, path = ?self.socket_path, "Listening on Unix socket");
        Ok(())
    }

    /// Stop accepting, drop every connection and remove the socket file
    pub async fn shutdown(&self) {
        let task = self.accept_task.lock().await.take();
        let Some(task) = task else {
            return;
        };
        task.abort();

        let ids: Vec<u64> = self.connections.iter().map(|r| *r.key()).collect();
        for id in ids {
            if let Some((_, handle)) = self.connections.remove(&id) {
                handle.abort();
            }
        }

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(path = ?self.socket_path, error = %e, "Failed to remove socket file");
            }
        }
        info!(identity = %self.identity, "Socket server shut down");
    }

    /// Tear the endpoint down and bind it again
    pub async fn restart(&self) -> Result<(), TransportError> {
        info!(identity = %self.identity, "Restarting socket server");
        self.shutdown().await;
        self.listen().await
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.get_mut().take() {
            task.abort();
            std::fs::remove_file(&self.socket_path).ok();
        }
    }
}

async fn accept_loop(
    listener: UnixListener,
    routes: Arc<RouteTable>,
    events: broadcast::Sender<InboundEvent>,
    connections: Arc<DashMap<u64, AbortHandle>>,
) {
    static NEXT_CONN: AtomicU64 = AtomicU64::new(1);

    loop {
        let stream = match listener.accept().await {
            Ok((stream, _addr)) => stream,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                continue;
            }
        };

        if let Err(e) = validate_peer(&stream) {
            warn!(error = %e, "Rejecting connection");
            continue;
        }

        let conn_id = NEXT_CONN.fetch_add(1, Ordering::Relaxed);
        let conn_routes = Arc::clone(&routes);
        let conn_events = events.clone();
        let connections_done = Arc::clone(&connections);
        let task = tokio::spawn(
            async move {
                serve_connection(stream, conn_routes, conn_events).await;
                connections_done.remove(&conn_id);
            }
            .instrument(tracing::debug_span!("connection", conn_id)),
        );
        connections.insert(conn_id, task.abort_handle());
    }
}

/// Read envelopes from one connection until EOF or a framing error
async fn serve_connection(
    stream: UnixStream,
    routes: Arc<RouteTable>,
    events: broadcast::Sender<InboundEvent>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<RpcEnvelope>(WRITE_QUEUE);

    let writer = tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            match encode(&reply) {
                Ok(frame) => {
                    if let Err(e) = write_half.write_all(&frame).await {
                        debug!(error = %e, "Write error");
                        break;
                    }
                }
                Err(e) => warn!(session = %reply.session, error = %e, "Encode error"),
            }
        }
    });

    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 8192];

    'read: loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => {
                debug!("Connection closed by peer");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "Read error");
                break;
            }
        };
        decoder.push(&buf[..n]);

        loop {
            match decoder.next_frame::<RpcEnvelope>() {
                Ok(Some(envelope)) => dispatch(envelope, &routes, &events, &reply_tx),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Frame decode error, dropping connection");
                    break 'read;
                }
            }
        }
    }

    drop(reply_tx);
    writer.await.ok();
}

fn dispatch(
    envelope: RpcEnvelope,
    routes: &Arc<RouteTable>,
    events: &broadcast::Sender<InboundEvent>,
    reply_tx: &mpsc::Sender<RpcEnvelope>,
) {
    if envelope.path == PING_PATH {
        let reply = envelope.reply(Value::from(PONG));
        let reply_tx = reply_tx.clone();
        tokio::spawn(async move {
            reply_tx.send(reply).await.ok();
        });
        return;
    }

    if let Some(event) = envelope.void_event() {
        debug!(event = %event, "Void event received");
        // No receivers is fine: nobody asked to hear this event.
        let _ = events.send(InboundEvent {
            event,
            data: envelope.body.unwrap_or(Value::Null),
        });
        return;
    }

    let handler = routes.get(&envelope.path).map(|r| Arc::clone(r.value()));
    let reply_tx = reply_tx.clone();
    tokio::spawn(async move {
        let result = match handler {
            Some(handler) => {
                let params = envelope.params.clone().unwrap_or_default();
                let body = envelope.body.clone().unwrap_or(Value::Null);
                handler.handle(params, body).await
            }
            None => {
                debug!(path = %envelope.path, "No route registered, sending empty reply");
                Value::Null
            }
        };
        if reply_tx.send(envelope.reply(result)).await.is_err() {
            debug!(path = %envelope.path, "Connection gone before reply was sent");
        }
    });
}

/// Validate peer credentials
///
/// On Linux, `SO_PEERCRED` must report the same uid as this process (or
/// root, which supervises system installs).
#[cfg(target_os = "linux")]
fn validate_peer(stream: &UnixStream) -> Result<(), TransportError> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();

    // SAFETY: `ucred` is plain old data; getsockopt writes at most `len` bytes into it.
    let cred = unsafe {
        let mut cred: libc::ucred = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        let result = libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            std::ptr::addr_of_mut!(cred).cast::<libc::c_void>(),
            &mut len,
        );
        if result < 0 {
            return Err(TransportError::AuthenticationFailed(
                "failed to get peer credentials".to_string(),
            ));
        }
        cred
    };

    // SAFETY: getuid has no preconditions.
    let my_uid = unsafe { libc::getuid() };
    if cred.uid != my_uid && cred.uid != 0 {
        return Err(TransportError::AuthenticationFailed(format!(
            "peer uid {} does not match server uid {my_uid}",
            cred.uid
        )));
    }

    debug!(peer_uid = cred.uid, peer_pid = cred.pid, "Peer validated");
    Ok(())
}

/// Non-Linux platforms rely on the 0600 socket file mode
#[cfg(not(target_os = "linux"))]
fn validate_peer(_stream: &UnixStream) -> Result<(), TransportError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn roundtrip(path: &Path, envelope: &RpcEnvelope) -> RpcEnvelope {
        let mut stream = UnixStream::connect(path).await.unwrap();
        exchange(&mut stream, envelope).await
    }

    async fn exchange(stream: &mut UnixStream, envelope: &RpcEnvelope) -> RpcEnvelope {
        stream.write_all(&encode(envelope).unwrap()).await.unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "server closed before replying");
            decoder.push(&buf[..n]);
            if let Some(reply) = decoder.next_frame::<RpcEnvelope>().unwrap() {
                return reply;
            }
        }
    }

    #[tokio::test]
    async fn test_listen_creates_private_socket() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("den.sock");
        let server = IpcServer::new("den", path.clone());

        server.listen().await.unwrap();
        assert!(path.exists());
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        server.shutdown().await;
        assert!(!path.exists());
        assert!(!server.is_listening().await);
    }

    #[tokio::test]
    async fn test_listen_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let server = IpcServer::new("den", dir.path().join("den.sock"));

        server.listen().await.unwrap();
        server.listen().await.unwrap();
        assert!(server.is_listening().await);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("den.sock");
        let server = IpcServer::new("den", path.clone());
        server.listen().await.unwrap();

        let ping = RpcEnvelope::request(PING_PATH, None, None);
        let reply = tokio::time::timeout(Duration::from_secs(2), roundtrip(&path, &ping))
            .await
            .unwrap();

        assert_eq!(reply.path, ping.session.as_str());
        assert_eq!(reply.body, Some(Value::from(PONG)));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_unregistered_path_gets_empty_reply() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("den.sock");
        let server = IpcServer::new("den", path.clone());
        server.listen().await.unwrap();

        let request = RpcEnvelope::request("accesories:list", None, None);
        let reply = tokio::time::timeout(Duration::from_secs(2), roundtrip(&path, &request))
            .await
            .unwrap();

        assert_eq!(reply.body, Some(Value::Null));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_void_event_published_without_reply() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hub.sock");
        let server = IpcServer::new("hub", path.clone());
        server.listen().await.unwrap();
        let mut events = server.subscribe();

        let mut stream = UnixStream::connect(&path).await.unwrap();
        let env = RpcEnvelope::event(VoidEvent::Log, Value::from("bridge started"));
        stream.write_all(&encode(&env).unwrap()).await.unwrap();

        let inbound = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.event, VoidEvent::Log);
        assert_eq!(inbound.data, Value::from("bridge started"));

        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_millis(100), stream.read(&mut buf)).await;
        assert!(read.is_err(), "void events must not be answered");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_rebinds() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("den.sock");
        let server = IpcServer::new("den", path.clone());
        server.route("status:get", |_p, _b| async { Value::from("up") });
        server.listen().await.unwrap();

        server.restart().await.unwrap();
        assert!(path.exists());

        let request = RpcEnvelope::request("status:get", None, None);
        let reply = roundtrip(&path, &request).await;
        assert_eq!(reply.body, Some(Value::from("up")));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_drops_open_connections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("den.sock");
        let server = IpcServer::new("den", path.clone());
        server.listen().await.unwrap();
        assert_eq!(server.connection_count(), 0);

        let mut stream = UnixStream::connect(&path).await.unwrap();
        let ping = RpcEnvelope::request(PING_PATH, None, None);
        exchange(&mut stream, &ping).await;
        assert_eq!(server.connection_count(), 1);

        server.restart().await.unwrap();
        assert_eq!(server.connection_count(), 0);

        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)), "old connection should be closed");

        server.shutdown().await;
    }
}
