use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::reconnect::{Affordance, ConfirmedReconnect, ReconnectPrompt, Supervisor};
use super::sessions::{Dispatch, SessionTable};
use super::terminal::{self, TerminalPort};
use super::transport::{ConnectionState, Connector, TransportEvent, TransportLink};
use crate::core::codec::{ShellConnect, ShellDisconnect, ShellInput, ShellResize};
use crate::core::{
    AgentId, AgentStatus, CloseReason, Config, Frame, GatewayError, Geometry, Payload, Result,
    SessionEvent, SessionInfo, SessionToken,
};
use crate::directory::AgentDirectory;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Shell variants `open_session` accepts
    pub allowed: Vec<String>,
    pub scrollback_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for EngineConfig {
    fn from(config: &Config) -> Self {
        EngineConfig {
            allowed: config.shell.allowed.clone(),
            scrollback_bytes: config.shell.scrollback_bytes,
        }
    }
}

// Commands that can be sent to the engine actor
enum EngineCommand {
    Open {
        agent_id: AgentId,
        cmd: String,
        geometry: Geometry,
        response_tx: oneshot::Sender<Result<SessionToken>>,
    },
    Input {
        token: SessionToken,
        data: Bytes,
    },
    Resize {
        token: SessionToken,
        geometry: Geometry,
    },
    Close {
        token: SessionToken,
    },
    Forget {
        token: SessionToken,
        response_tx: oneshot::Sender<Option<SessionInfo>>,
    },
    Subscribe {
        token: SessionToken,
        response_tx: oneshot::Sender<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    },
    Snapshot {
        token: SessionToken,
        response_tx: oneshot::Sender<Option<SessionInfo>>,
    },
    List {
        response_tx: oneshot::Sender<Vec<SessionInfo>>,
    },
    State {
        response_tx: oneshot::Sender<ConnectionState>,
    },
    Affordance {
        response_tx: oneshot::Sender<Affordance>,
    },
    PromptReconnect {
        token: SessionToken,
        response_tx: oneshot::Sender<Result<ReconnectPrompt>>,
    },
    Reconnect {
        confirmed: ConfirmedReconnect,
        response_tx: oneshot::Sender<Result<SessionToken>>,
    },
    SetAllowed {
        variants: Vec<String>,
    },
    Disconnect {
        response_tx: oneshot::Sender<()>,
    },
}

// Reported by the task driving one connection attempt
enum LinkEvent {
    Opened {
        generation: u64,
        outbound: mpsc::UnboundedSender<Bytes>,
    },
    Inbound {
        generation: u64,
        bytes: Bytes,
    },
    Closed {
        generation: u64,
        reason: String,
    },
}

/// Handle to the shell engine of one console tab.
///
/// All calls funnel through a single FIFO command queue, so frames for one
/// token reach the transport in the order they were issued. Input, resize and
/// close return immediately.
#[derive(Clone)]
pub struct ShellEngine {
    command_tx: mpsc::UnboundedSender<EngineCommand>,
}

// Internal engine state (runs in its own task)
struct EngineActor {
    connector: Arc<dyn Connector>,
    directory: AgentDirectory,
    allowed: Vec<String>,
    table: SessionTable,
    supervisor: Supervisor,
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    // frames issued while Connecting, flushed in order on Open
    pending: Vec<Bytes>,
    link_cancel: Option<CancellationToken>,
    command_rx: mpsc::UnboundedReceiver<EngineCommand>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    link_rx: mpsc::UnboundedReceiver<LinkEvent>,
}

impl ShellEngine {
    pub fn new(connector: Arc<dyn Connector>, directory: AgentDirectory, config: EngineConfig) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();

        let actor = EngineActor {
            connector,
            directory,
            allowed: config.allowed,
            table: SessionTable::new(config.scrollback_bytes),
            supervisor: Supervisor::default(),
            outbound: None,
            pending: Vec::new(),
            link_cancel: None,
            command_rx,
            link_tx,
            link_rx,
        };

        tokio::spawn(actor.run());

        Self { command_tx }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(command(response_tx))
            .map_err(|_| GatewayError::EngineStopped)?;
        response_rx.await.map_err(|_| GatewayError::EngineStopped)
    }

    fn enqueue(&self, command: EngineCommand) {
        if self.command_tx.send(command).is_err() {
            tracing::debug!("Shell engine is gone, command dropped");
        }
    }

    /// Start a shell of variant `cmd` on an Online agent. The transport is
    /// opened first if needed; the returned token is Pending until output
    /// arrives.
    pub async fn open_session(
        &self,
        agent_id: AgentId,
        cmd: &str,
        geometry: Geometry,
    ) -> Result<SessionToken> {
        let cmd = cmd.to_string();
        self.request(|response_tx| EngineCommand::Open {
            agent_id,
            cmd,
            geometry,
            response_tx,
        })
        .await?
    }

    /// Forward keystrokes. Ignored for closed or unknown sessions.
    pub fn send_input(&self, token: SessionToken, data: impl Into<Bytes>) {
        self.enqueue(EngineCommand::Input {
            token,
            data: data.into(),
        });
    }

    pub fn resize(&self, token: SessionToken, geometry: Geometry) {
        self.enqueue(EngineCommand::Resize { token, geometry });
    }

    /// Close locally; the agent gets a best-effort disconnect notice
    pub fn close_session(&self, token: SessionToken) {
        self.enqueue(EngineCommand::Close { token });
    }

    /// Release a session's record and scrollback once its tab is gone.
    /// An open session is closed first, exactly as `close_session` would.
    pub async fn forget_session(&self, token: SessionToken) -> Option<SessionInfo> {
        self.request(|response_tx| EngineCommand::Forget { token, response_tx })
            .await
            .ok()
            .flatten()
    }

    /// Replace the permitted shell variants, e.g. with the discovered list
    pub fn set_allowed_shells(&self, variants: Vec<String>) {
        self.enqueue(EngineCommand::SetAllowed { variants });
    }

    pub async fn subscribe(&self, token: SessionToken) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.request(|response_tx| EngineCommand::Subscribe { token, response_tx })
            .await
            .ok()
            .flatten()
    }

    pub async fn snapshot(&self, token: SessionToken) -> Option<SessionInfo> {
        self.request(|response_tx| EngineCommand::Snapshot { token, response_tx })
            .await
            .ok()
            .flatten()
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.request(|response_tx| EngineCommand::List { response_tx })
            .await
            .unwrap_or_default()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.request(|response_tx| EngineCommand::State { response_tx })
            .await
            .unwrap_or_else(|e| ConnectionState::Closed(e.to_string()))
    }

    pub async fn affordance(&self) -> Affordance {
        self.request(|response_tx| EngineCommand::Affordance { response_tx })
            .await
            .unwrap_or(Affordance::Reconnect)
    }

    /// Ask to replace `token` with a fresh session on the same agent
    pub async fn prompt_reconnect(&self, token: SessionToken) -> Result<ReconnectPrompt> {
        self.request(|response_tx| EngineCommand::PromptReconnect { token, response_tx })
            .await?
    }

    /// Start the replacement session: same agent, variant and latest geometry
    /// under a new token. The previous session ends as `Replaced`.
    pub async fn reconnect(&self, confirmed: ConfirmedReconnect) -> Result<SessionToken> {
        self.request(|response_tx| EngineCommand::Reconnect {
            confirmed,
            response_tx,
        })
        .await?
    }

    /// Tear the transport down, closing every session on it
    pub async fn disconnect(&self) {
        let _ = self
            .request(|response_tx| EngineCommand::Disconnect { response_tx })
            .await;
    }

    /// Event channel for a terminal widget attached to `token`
    pub fn terminal(&self, token: SessionToken) -> TerminalPort {
        terminal::spawn(self.clone(), token)
    }
}

impl EngineActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = self.link_rx.recv() => {
                    self.handle_link(event);
                }
            }
        }
        if self.supervisor.shutdown("engine stopped") {
            self.teardown();
        }
        tracing::debug!("Shell engine shutting down");
    }

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Open {
                agent_id,
                cmd,
                geometry,
                response_tx,
            } => {
                let result = self.open_session(agent_id, cmd, geometry);
                let _ = response_tx.send(result);
            }
            EngineCommand::Input { token, data } => self.send_input(token, data),
            EngineCommand::Resize { token, geometry } => self.resize(token, geometry),
            EngineCommand::Close { token } => self.close_session(token),
            EngineCommand::Forget { token, response_tx } => {
                let _ = response_tx.send(self.forget_session(token));
            }
            EngineCommand::Subscribe { token, response_tx } => {
                let _ = response_tx.send(self.table.subscribe(&token));
            }
            EngineCommand::Snapshot { token, response_tx } => {
                let _ = response_tx.send(self.table.get(&token).map(|session| session.info()));
            }
            EngineCommand::List { response_tx } => {
                let _ = response_tx.send(self.table.list());
            }
            EngineCommand::State { response_tx } => {
                let _ = response_tx.send(self.supervisor.state().clone());
            }
            EngineCommand::Affordance { response_tx } => {
                let _ = response_tx.send(Affordance::for_history(self.table.opened()));
            }
            EngineCommand::PromptReconnect { token, response_tx } => {
                let _ = response_tx.send(self.prompt_reconnect(token));
            }
            EngineCommand::Reconnect {
                confirmed,
                response_tx,
            } => {
                let result = self.reconnect(confirmed);
                let _ = response_tx.send(result);
            }
            EngineCommand::SetAllowed { variants } => {
                tracing::debug!("Permitted shells: {:?}", variants);
                self.allowed = variants;
            }
            EngineCommand::Disconnect { response_tx } => {
                if self.supervisor.shutdown("closed by operator") {
                    tracing::info!("Transport closed by operator");
                    self.teardown();
                }
                let _ = response_tx.send(());
            }
        }
    }

    fn check_open(&self, agent_id: AgentId, cmd: &str) -> Result<()> {
        match self.directory.status(&agent_id) {
            None => return Err(GatewayError::UnknownAgent { agent_id }),
            Some(AgentStatus::Online) => {}
            Some(status) => return Err(GatewayError::AgentNotOnline { agent_id, status }),
        }
        if !self.allowed.iter().any(|allowed| allowed == cmd) {
            return Err(GatewayError::ShellNotAllowed {
                cmd: cmd.to_string(),
            });
        }
        Ok(())
    }

    fn open_session(&mut self, agent_id: AgentId, cmd: String, geometry: Geometry) -> Result<SessionToken> {
        self.check_open(agent_id, &cmd)?;
        self.ensure_connection();

        let token = self.table.open(agent_id, &cmd, geometry);
        tracing::info!(
            "Opening {} session {} on agent {} ({})",
            cmd,
            token.short(),
            agent_id,
            geometry
        );
        self.send(Payload::ShellConnect(ShellConnect {
            token,
            cmd,
            rows: geometry.rows,
            cols: geometry.cols,
        }));
        Ok(token)
    }

    fn send_input(&mut self, token: SessionToken, data: Bytes) {
        if !self.table.is_open(&token) {
            tracing::trace!("Input for closed or unknown session {} ignored", token.short());
            return;
        }
        self.send(Payload::ShellInput(ShellInput { token, data }));
    }

    fn resize(&mut self, token: SessionToken, geometry: Geometry) {
        if !self.table.set_geometry(&token, geometry) {
            tracing::trace!("Resize for closed or unknown session {} ignored", token.short());
            return;
        }
        tracing::debug!("Session {} resized to {}", token.short(), geometry);
        self.send(Payload::ShellResize(ShellResize {
            token,
            rows: geometry.rows,
            cols: geometry.cols,
        }));
    }

    fn close_session(&mut self, token: SessionToken) {
        if self.table.close(&token, CloseReason::Local) {
            tracing::info!("Closed session {}", token.short());
            self.send(Payload::ShellDisconnect(ShellDisconnect { token }));
        }
    }

    fn forget_session(&mut self, token: SessionToken) -> Option<SessionInfo> {
        self.close_session(token);
        let info = self.table.forget(&token)?;
        tracing::debug!("Forgot session {}", token.short());
        Some(info)
    }

    fn prompt_reconnect(&self, token: SessionToken) -> Result<ReconnectPrompt> {
        let session = self
            .table
            .get(&token)
            .ok_or(GatewayError::SessionNotFound { token })?;
        Ok(ReconnectPrompt::new(
            token,
            session.agent_id,
            session.cmd.clone(),
            session.geometry,
            session.is_open(),
        ))
    }

    fn reconnect(&mut self, confirmed: ConfirmedReconnect) -> Result<SessionToken> {
        self.check_open(confirmed.agent_id, &confirmed.cmd)?;

        let previous = confirmed.previous;
        if self.table.close(&previous, CloseReason::Replaced) {
            self.send(Payload::ShellDisconnect(ShellDisconnect { token: previous }));
        }
        let token = self.open_session(confirmed.agent_id, confirmed.cmd, confirmed.geometry)?;
        tracing::info!("Session {} replaced by {}", previous.short(), token.short());
        Ok(token)
    }

    fn ensure_connection(&mut self) {
        if !self.supervisor.state().needs_connect() {
            return;
        }
        let generation = self.supervisor.begin();
        self.pending.clear();

        let cancel = CancellationToken::new();
        self.link_cancel = Some(cancel.clone());
        tracing::info!("Connecting transport (attempt {})", generation);
        tokio::spawn(drive_link(
            self.connector.clone(),
            generation,
            self.link_tx.clone(),
            cancel,
        ));
    }

    fn send(&mut self, payload: Payload) {
        let name = payload.name();
        let bytes = Frame::new(payload).encode();
        match self.supervisor.state() {
            ConnectionState::Open => {
                let sent = self
                    .outbound
                    .as_ref()
                    .is_some_and(|outbound| outbound.send(bytes).is_ok());
                if !sent {
                    tracing::debug!("Transport outbound gone, {} dropped", name);
                }
            }
            ConnectionState::Connecting => self.pending.push(bytes),
            ConnectionState::Idle | ConnectionState::Closed(_) => {
                tracing::trace!("No transport, {} dropped", name);
            }
        }
    }

    fn handle_link(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened {
                generation,
                outbound,
            } => {
                if !self.supervisor.opened(generation) {
                    return;
                }
                tracing::info!(
                    "Transport open, flushing {} queued frames",
                    self.pending.len()
                );
                for bytes in self.pending.drain(..) {
                    if outbound.send(bytes).is_err() {
                        break;
                    }
                }
                self.outbound = Some(outbound);
            }
            LinkEvent::Inbound { generation, bytes } => {
                if generation != self.supervisor.generation() || !self.supervisor.state().is_open() {
                    return;
                }
                match Frame::decode(bytes) {
                    Ok(frame) => self.dispatch(frame),
                    Err(e) => tracing::warn!("Dropping malformed frame: {}", e),
                }
            }
            LinkEvent::Closed { generation, reason } => {
                if self.supervisor.closed(generation, reason.clone()) {
                    tracing::warn!("Transport closed: {}", reason);
                    self.teardown();
                }
            }
        }
    }

    fn dispatch(&mut self, frame: Frame) {
        let id = frame.id;
        match self.table.on_frame(frame) {
            Dispatch::Output { token, len } => {
                tracing::trace!("Frame {} -> session {} ({} bytes)", id, token.short(), len);
            }
            Dispatch::Failed { token, error } => {
                tracing::warn!("Session {} failed: {}", token.short(), error);
            }
            Dispatch::UnknownToken { token } => {
                tracing::debug!("Frame {} for unknown session {} dropped", id, token);
            }
            Dispatch::Stale { token } => {
                tracing::debug!("Frame {} for closed session {} dropped", id, token.short());
            }
            Dispatch::Ignored { kind } => {
                tracing::warn!("Frame {} of unexpected kind {} dropped", id, kind);
            }
        }
    }

    // Every session on the lost connection closes in one step
    fn teardown(&mut self) {
        self.outbound = None;
        self.pending.clear();
        if let Some(cancel) = self.link_cancel.take() {
            cancel.cancel();
        }
        let closed = self.table.close_all();
        if !closed.is_empty() {
            tracing::info!("Closed {} sessions after transport loss", closed.len());
        }
    }
}

async fn drive_link(
    connector: Arc<dyn Connector>,
    generation: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
    cancel: CancellationToken,
) {
    let link = tokio::select! {
        _ = cancel.cancelled() => return,
        result = connector.connect() => result,
    };
    let TransportLink {
        outbound,
        mut inbound,
    } = match link {
        Ok(link) => link,
        Err(e) => {
            tracing::error!("Transport connect failed: {}", e);
            let _ = events.send(LinkEvent::Closed {
                generation,
                reason: e.to_string(),
            });
            return;
        }
    };
    if events
        .send(LinkEvent::Opened {
            generation,
            outbound,
        })
        .is_err()
    {
        return;
    }

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = inbound.recv() => match event {
                Some(TransportEvent::Frame(bytes)) => {
                    if events.send(LinkEvent::Inbound { generation, bytes }).is_err() {
                        return;
                    }
                }
                Some(TransportEvent::Closed(reason)) => {
                    break reason.unwrap_or_else(|| "remote hangup".to_string());
                }
                None => break "connection closed".to_string(),
            }
        }
    };
    let _ = events.send(LinkEvent::Closed { generation, reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Agent;
    use crate::engine::transport::memory::MemoryConnector;

    fn directory_with(status: AgentStatus) -> (AgentDirectory, AgentId) {
        let directory = AgentDirectory::new();
        let mut agent = Agent::new(AgentId::new(), "web-1");
        agent.status = status;
        let id = agent.id;
        directory.upsert(agent);
        (directory, id)
    }

    #[tokio::test]
    async fn test_rejections_never_touch_the_transport() {
        let (connector, _remotes) = MemoryConnector::new();
        let (directory, agent_id) = directory_with(AgentStatus::Updating);
        let engine = ShellEngine::new(connector.clone(), directory.clone(), EngineConfig::default());

        let err = engine
            .open_session(agent_id, "bash", Geometry::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::AgentNotOnline { .. }));

        let err = engine
            .open_session(AgentId::new(), "bash", Geometry::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UnknownAgent { .. }));

        directory.upsert({
            let mut agent = directory.get(&agent_id).unwrap();
            agent.status = AgentStatus::Online;
            agent
        });
        let err = engine
            .open_session(agent_id, "python", Geometry::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ShellNotAllowed { .. }));

        assert_eq!(connector.attempts(), 0);
        assert_eq!(engine.connection_state().await, ConnectionState::Idle);
        assert!(engine.list_sessions().await.is_empty());
        assert_eq!(engine.affordance().await, Affordance::Connect);
    }

    #[tokio::test]
    async fn test_discovered_variants_replace_whitelist() {
        let (connector, _remotes) = MemoryConnector::new();
        let (directory, agent_id) = directory_with(AgentStatus::Online);
        let engine = ShellEngine::new(connector, directory, EngineConfig::default());

        engine.set_allowed_shells(vec!["fish".into()]);
        assert!(engine
            .open_session(agent_id, "bash", Geometry::default())
            .await
            .is_err());
        assert!(engine
            .open_session(agent_id, "fish", Geometry::default())
            .await
            .is_ok());
    }
}
