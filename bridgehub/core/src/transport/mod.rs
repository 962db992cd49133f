//! Transport Layer for Hub-Bridge IPC
//!
//! A session-correlated request/response channel over Unix domain sockets:
//! - Every process listens on one endpoint named after its identity
//! - `fetch` sends one request and waits for exactly one correlated reply
//! - `emit` delivers fire-and-forget void events
//! - A heartbeat pings the peer and restarts the local endpoint on silence
//!
//! # Design Philosophy
//!
//! Sessions are single-shot. A dead peer simply never answers, and the
//! client checks the endpoint file before connecting at all, so most calls
//! to a downed bridge return `None` without touching a socket.
//!
//! # Security
//!
//! - Socket files are created with 0600 permissions
//! - Unix sockets use `SO_PEERCRED` to validate peer UID
//! - No network exposure

pub mod config;
pub mod envelope;
pub mod frame;
pub mod heartbeat;
pub mod traits;
pub mod unix_socket;

pub use config::{SocketNamespace, TransportConfig, DEFAULT_HEARTBEAT_INTERVAL};
pub use envelope::{RpcEnvelope, SessionToken, VoidEvent, PING_PATH, PONG};
pub use frame::{encode, FrameDecoder, MAX_FRAME_SIZE};
pub use heartbeat::{
    HeartbeatConfig, HeartbeatEvent, HeartbeatHandle, HeartbeatTask, MIN_HEARTBEAT_INTERVAL,
};
pub use traits::{Params, RouteHandler, TransportError};
pub use unix_socket::{InboundEvent, IpcClient, IpcServer};
