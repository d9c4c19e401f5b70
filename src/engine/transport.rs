//! Transport seam between the shell engine and the wire.
//!
//! A [`Connector`] produces one [`TransportLink`] per connection: an outbound
//! queue of encoded frames plus an inbound stream of [`TransportEvent`]s. The
//! outbound side is unbounded so enqueueing never blocks the caller; any
//! backpressure is the transport's business.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;
use ts_rs::TS;

use crate::core::Result;

/// What the remote end of a transport delivers
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One complete encoded frame
    Frame(Bytes),
    /// The connection ended; no further events follow
    Closed(Option<String>),
}

/// Channels of an established connection.
///
/// Dropping `outbound` asks the transport to close.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<Bytes>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish a new connection. Resolves once the handshake has finished.
    async fn connect(&self) -> Result<TransportLink>;
}

/// Lifecycle of the one transport connection a console tab owns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[serde(tag = "state", content = "reason")]
#[ts(export)]
pub enum ConnectionState {
    /// Never connected
    Idle,
    Connecting,
    Open,
    Closed(String),
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// A new session needs a fresh connection
    pub fn needs_connect(&self) -> bool {
        matches!(self, ConnectionState::Idle | ConnectionState::Closed(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => f.write_str("idle"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Open => f.write_str("open"),
            ConnectionState::Closed(reason) => write!(f, "closed ({})", reason),
        }
    }
}
