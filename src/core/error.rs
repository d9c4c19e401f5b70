use thiserror::Error;

use super::agent::{AgentId, AgentStatus, PassiveAgentId};
use super::codec::CodecError;
use super::token::SessionToken;

/// Error category, deciding scope and recovery.
///
/// `Transport` errors close the whole connection, `Session` errors close one
/// session, `Validation` errors never leave the process, `Protocol` errors
/// drop a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Session,
    Validation,
    Protocol,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Session => "session",
            Self::Validation => "validation",
            Self::Protocol => "protocol",
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("agent {agent_id} is {status}, shell unavailable")]
    AgentNotOnline {
        agent_id: AgentId,
        status: AgentStatus,
    },
    #[error("unknown agent: {agent_id}")]
    UnknownAgent { agent_id: AgentId },
    #[error("session not found: {token}")]
    SessionNotFound { token: SessionToken },
    #[error("shell '{cmd}' is not permitted")]
    ShellNotAllowed { cmd: String },
    #[error("invalid passive agent: {message}")]
    InvalidPassiveAgent { message: String },
    #[error("passive agent not found: {id}")]
    PassiveAgentNotFound { id: PassiveAgentId },
    #[error("activation already in flight for passive agent {id}")]
    ActivationInFlight { id: PassiveAgentId },
    #[error("passive agent {id} is already active")]
    AlreadyActive { id: PassiveAgentId },
    #[error("connection failed: {message}")]
    ConnectionFailed { message: String },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("shell engine is not running")]
    EngineStopped,
    #[error("shell error: {message}")]
    Shell { token: SessionToken, message: String },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("console api error {status}: {message}")]
    Api { status: u16, message: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AgentNotOnline { .. }
            | Self::UnknownAgent { .. }
            | Self::SessionNotFound { .. }
            | Self::ShellNotAllowed { .. }
            | Self::InvalidPassiveAgent { .. }
            | Self::PassiveAgentNotFound { .. }
            | Self::ActivationInFlight { .. }
            | Self::AlreadyActive { .. } => ErrorKind::Validation,
            Self::ConnectionFailed { .. }
            | Self::ConnectionClosed
            | Self::EngineStopped
            | Self::Api { .. }
            | Self::Http(_)
            | Self::Io(_) => ErrorKind::Transport,
            Self::Shell { .. } => ErrorKind::Session,
            Self::Codec(_) => ErrorKind::Protocol,
        }
    }

    pub fn invalid_passive(message: impl Into<String>) -> Self {
        Self::InvalidPassiveAgent {
            message: message.into(),
        }
    }

    pub fn connection_failed(message: impl ToString) -> Self {
        Self::ConnectionFailed {
            message: message.to_string(),
        }
    }
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;
