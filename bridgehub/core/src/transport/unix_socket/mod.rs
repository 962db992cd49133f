//! Unix Socket Transport
//!
//! Every process (the hub and each bridge) listens on exactly one socket,
//! `<storage>/<identity>.sock`, and connects to its peers on demand.
//!
//! # Security
//!
//! - Socket created with mode 0600 (owner-only access)
//! - Peer UID validated via `SO_PEERCRED` (Linux)
//! - No network exposure (Unix domain sockets only)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐                      ┌──────────────────┐
//! │       Hub        │                      │   Bridge "den"   │
//! │                  │   fetch / emit       │                  │
//! │ IpcClient (pool) ├─────────────────────►│ IpcServer        │
//! │                  │      den.sock        │  route table     │
//! │ IpcServer        │◄─────────────────────┤ IpcClient        │
//! │  (hub.sock)      │  log / accessory_    │  + HeartbeatTask │
//! └──────────────────┘  change / ping       └──────────────────┘
//! ```

mod client;
mod server;

pub use client::IpcClient;
pub use server::{InboundEvent, IpcServer};
