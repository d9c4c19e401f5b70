use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

use super::agent::AgentId;
use super::token::SessionToken;

/// Default terminal dimensions
pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_COLS: u16 = 80;

/// Terminal geometry in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Geometry {
    pub rows: u16,
    pub cols: u16,
}

impl Geometry {
    pub fn new(rows: u16, cols: u16) -> Self {
        Geometry { rows, cols }
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Geometry {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
        }
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Why a shell session stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "kind", content = "detail")]
#[ts(export)]
pub enum CloseReason {
    /// Closed by the operator on this console
    Local,
    /// The shared transport connection went away
    ConnectionClosed,
    /// The agent reported `ShellError`; text is surfaced verbatim
    Remote(String),
    /// Replaced by a confirmed reconnect
    Replaced,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => f.write_str("closed"),
            CloseReason::ConnectionClosed => f.write_str("connection closed"),
            CloseReason::Remote(error) => write!(f, "error: {}", error),
            CloseReason::Replaced => f.write_str("replaced by reconnect"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "state", content = "reason")]
#[ts(export)]
pub enum SessionStatus {
    /// Connect sent, nothing heard back yet
    Pending,
    /// At least one output frame arrived
    Ready,
    Closed(CloseReason),
}

impl SessionStatus {
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionStatus::Closed(_))
    }
}

/// Point-in-time view of a session, for rendering
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SessionInfo {
    #[ts(type = "string")]
    pub token: SessionToken,
    pub agent_id: AgentId,
    pub cmd: String,
    pub geometry: Geometry,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    #[ts(skip)]
    pub scrollback: Vec<u8>,
}

/// Events delivered to the terminal widget attached to a session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Bytes to write to the screen, in arrival order
    Output(Bytes),
    /// The session is over; no further output follows
    Closed(CloseReason),
}
