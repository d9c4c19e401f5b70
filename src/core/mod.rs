pub mod agent;
pub mod codec;
pub mod config;
pub mod error;
pub mod session;
pub mod token;

pub use agent::{Agent, AgentId, AgentStatus, PassiveAgent, PassiveAgentId, PassiveStatus, Telemetry};
pub use codec::{CodecError, Frame, Payload};
pub use config::Config;
pub use error::{ErrorKind, GatewayError, Result};
pub use session::{CloseReason, Geometry, SessionEvent, SessionInfo, SessionStatus};
pub use token::SessionToken;
