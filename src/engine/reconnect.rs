//! Connection supervision and the operator-facing reconnect policy.
//!
//! Nothing here reconnects on its own. A lost connection closes every session
//! and stays closed until the operator asks for a new shell. On a tab that has
//! already run a session, that request goes through [`ReconnectPrompt`] and
//! only a confirmed prompt can be turned into a new session.

use serde::Serialize;
use ts_rs::TS;

use super::transport::ConnectionState;
use crate::core::{AgentId, Geometry, SessionToken};

/// Which button the tab should show
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
pub enum Affordance {
    /// First session on this tab
    Connect,
    /// The tab already ran a session; starting another needs confirmation
    Reconnect,
}

impl Affordance {
    pub fn for_history(sessions_opened: usize) -> Self {
        if sessions_opened == 0 {
            Affordance::Connect
        } else {
            Affordance::Reconnect
        }
    }

    pub fn requires_confirmation(&self) -> bool {
        matches!(self, Affordance::Reconnect)
    }
}

/// A pending reconnect waiting for the operator's answer
#[derive(Debug, Clone)]
pub struct ReconnectPrompt {
    previous: SessionToken,
    agent_id: AgentId,
    cmd: String,
    geometry: Geometry,
    previous_open: bool,
}

impl ReconnectPrompt {
    pub(crate) fn new(
        previous: SessionToken,
        agent_id: AgentId,
        cmd: String,
        geometry: Geometry,
        previous_open: bool,
    ) -> Self {
        ReconnectPrompt {
            previous,
            agent_id,
            cmd,
            geometry,
            previous_open,
        }
    }

    pub fn previous(&self) -> SessionToken {
        self.previous
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    /// Text to show next to the confirm button
    pub fn message(&self) -> String {
        if self.previous_open {
            format!(
                "Session {} is still running. Reconnecting ends it and starts a new {} shell.",
                self.previous.short(),
                self.cmd
            )
        } else {
            format!(
                "Session {} cannot be resumed. Start a new {} shell ({})?",
                self.previous.short(),
                self.cmd,
                self.geometry
            )
        }
    }

    /// The operator agreed
    pub fn confirm(self) -> ConfirmedReconnect {
        ConfirmedReconnect {
            previous: self.previous,
            agent_id: self.agent_id,
            cmd: self.cmd,
            geometry: self.geometry,
        }
    }
}

/// Proof of consent. Only obtainable from [`ReconnectPrompt::confirm`].
#[derive(Debug, Clone)]
pub struct ConfirmedReconnect {
    pub(crate) previous: SessionToken,
    pub(crate) agent_id: AgentId,
    pub(crate) cmd: String,
    pub(crate) geometry: Geometry,
}

/// Tracks the transport state machine `Connecting -> Open -> Closed`.
///
/// Each connection attempt gets a generation number; events carrying an older
/// generation belong to a connection that has already been replaced and are
/// ignored.
#[derive(Debug)]
pub struct Supervisor {
    state: ConnectionState,
    generation: u64,
}

impl Default for Supervisor {
    fn default() -> Self {
        Supervisor {
            state: ConnectionState::Idle,
            generation: 0,
        }
    }
}

impl Supervisor {
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Start a new attempt and return its generation
    pub fn begin(&mut self) -> u64 {
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        self.generation
    }

    /// The attempt `generation` finished its handshake
    pub fn opened(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::Open;
        true
    }

    /// Connection `generation` ended or failed. Returns true if this closed
    /// the current connection.
    pub fn closed(&mut self, generation: u64, reason: impl Into<String>) -> bool {
        if generation != self.generation || matches!(self.state, ConnectionState::Closed(_)) {
            return false;
        }
        self.state = ConnectionState::Closed(reason.into());
        true
    }

    /// Close the current connection from this side, whatever its state
    pub fn shutdown(&mut self, reason: impl Into<String>) -> bool {
        if self.state == ConnectionState::Idle {
            return false;
        }
        let generation = self.generation;
        self.closed(generation, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affordance_follows_history() {
        assert_eq!(Affordance::for_history(0), Affordance::Connect);
        assert_eq!(Affordance::for_history(1), Affordance::Reconnect);
        assert!(Affordance::Reconnect.requires_confirmation());
        assert!(!Affordance::Connect.requires_confirmation());
    }

    #[test]
    fn test_stale_generations_are_ignored() {
        let mut supervisor = Supervisor::default();
        assert_eq!(supervisor.state(), &ConnectionState::Idle);

        let first = supervisor.begin();
        assert!(supervisor.shutdown("closed by operator"));
        let second = supervisor.begin();

        assert!(!supervisor.opened(first));
        assert_eq!(supervisor.state(), &ConnectionState::Connecting);
        assert!(supervisor.opened(second));
        assert!(!supervisor.closed(first, "late failure"));
        assert_eq!(supervisor.state(), &ConnectionState::Open);

        assert!(supervisor.closed(second, "remote hangup"));
        assert!(!supervisor.closed(second, "twice"));
        assert_eq!(
            supervisor.state(),
            &ConnectionState::Closed("remote hangup".into())
        );
    }

    #[test]
    fn test_prompt_message_mentions_running_session() {
        let token = SessionToken::generate();
        let prompt = ReconnectPrompt::new(token, AgentId::new(), "bash".into(), Geometry::default(), true);
        assert!(prompt.message().contains("still running"));
        assert!(prompt.message().contains(&token.short()));

        let confirmed = prompt.confirm();
        assert_eq!(confirmed.previous, token);
        assert_eq!(confirmed.cmd, "bash");
    }
}
