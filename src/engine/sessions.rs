//! Session table and inbound demultiplexer.
//!
//! Pure state: no tasks, no sockets. The engine actor owns one table per
//! console tab and feeds it decoded frames through [`SessionTable::on_frame`].

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;

use crate::core::{
    AgentId, CloseReason, Frame, Geometry, Payload, SessionEvent, SessionInfo, SessionStatus,
    SessionToken,
};

pub const CONNECTION_CLOSED_NOTICE: &[u8] = b"\r\nConnection closed.\r\n";

/// Outcome of routing one inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Output appended to the session
    Output { token: SessionToken, len: usize },
    /// The agent reported an error; the session is now closed
    Failed { token: SessionToken, error: String },
    /// No session with this token was ever registered here
    UnknownToken { token: SessionToken },
    /// The session exists but is already closed
    Stale { token: SessionToken },
    /// Unknown kind, or a kind that only travels console -> agent
    Ignored { kind: u8 },
}

/// Bounded output history, oldest bytes dropped first
#[derive(Debug, Default)]
pub struct Scrollback {
    buf: VecDeque<u8>,
    limit: usize,
}

impl Scrollback {
    pub fn new(limit: usize) -> Self {
        Scrollback {
            buf: VecDeque::new(),
            limit,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        if self.limit == 0 {
            return;
        }
        let data = if data.len() > self.limit {
            &data[data.len() - self.limit..]
        } else {
            data
        };
        let overflow = (self.buf.len() + data.len()).saturating_sub(self.limit);
        self.buf.drain(..overflow);
        self.buf.extend(data);
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.buf.iter().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[derive(Debug)]
pub struct Session {
    pub token: SessionToken,
    pub agent_id: AgentId,
    pub cmd: String,
    pub geometry: Geometry,
    pub status: SessionStatus,
    pub error: Option<String>,
    scrollback: Scrollback,
    subscribers: Vec<mpsc::UnboundedSender<SessionEvent>>,
}

impl Session {
    pub fn is_open(&self) -> bool {
        !self.status.is_closed()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            token: self.token,
            agent_id: self.agent_id,
            cmd: self.cmd.clone(),
            geometry: self.geometry,
            status: self.status.clone(),
            error: self.error.clone(),
            scrollback: self.scrollback.to_vec(),
        }
    }

    fn emit(&mut self, event: SessionEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn append(&mut self, data: Bytes) {
        self.scrollback.push(&data);
        self.emit(SessionEvent::Output(data));
    }

    /// Annotate, transition and notify. Returns false if already closed.
    fn close(&mut self, reason: CloseReason, notice: Option<Bytes>) -> bool {
        if !self.is_open() {
            return false;
        }
        if let Some(notice) = notice {
            self.append(notice);
        }
        self.status = SessionStatus::Closed(reason.clone());
        self.emit(SessionEvent::Closed(reason));
        self.subscribers.clear();
        true
    }
}

/// Every session of one console tab, keyed by token
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<SessionToken, Session>,
    scrollback_limit: usize,
    opened: usize,
}

impl SessionTable {
    pub fn new(scrollback_limit: usize) -> Self {
        SessionTable {
            sessions: HashMap::new(),
            scrollback_limit,
            opened: 0,
        }
    }

    /// Register a new Pending session under a fresh token
    pub fn open(&mut self, agent_id: AgentId, cmd: &str, geometry: Geometry) -> SessionToken {
        let mut token = SessionToken::generate();
        while self.sessions.contains_key(&token) {
            token = SessionToken::generate();
        }
        self.sessions.insert(
            token,
            Session {
                token,
                agent_id,
                cmd: cmd.to_string(),
                geometry,
                status: SessionStatus::Pending,
                error: None,
                scrollback: Scrollback::new(self.scrollback_limit),
                subscribers: Vec::new(),
            },
        );
        self.opened += 1;
        token
    }

    pub fn get(&self, token: &SessionToken) -> Option<&Session> {
        self.sessions.get(token)
    }

    pub fn is_open(&self, token: &SessionToken) -> bool {
        self.sessions.get(token).is_some_and(Session::is_open)
    }

    /// Sessions ever opened on this table, closed ones included
    pub fn opened(&self) -> usize {
        self.opened
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions.values().map(Session::info).collect()
    }

    /// Update geometry of an open session. Returns false if closed or unknown.
    pub fn set_geometry(&mut self, token: &SessionToken, geometry: Geometry) -> bool {
        match self.sessions.get_mut(token) {
            Some(session) if session.is_open() => {
                session.geometry = geometry;
                true
            }
            _ => false,
        }
    }

    /// Attach an event stream. Existing scrollback is replayed first, and a
    /// closed session yields its close reason straight away.
    pub fn subscribe(
        &mut self,
        token: &SessionToken,
    ) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        let session = self.sessions.get_mut(token)?;
        let (tx, rx) = mpsc::unbounded_channel();
        if !session.scrollback.is_empty() {
            let _ = tx.send(SessionEvent::Output(Bytes::from(session.scrollback.to_vec())));
        }
        match &session.status {
            SessionStatus::Closed(reason) => {
                let _ = tx.send(SessionEvent::Closed(reason.clone()));
            }
            _ => session.subscribers.push(tx),
        }
        Some(rx)
    }

    /// Demultiplex one inbound frame by token
    pub fn on_frame(&mut self, frame: Frame) -> Dispatch {
        match frame.payload {
            Payload::ShellOutput(output) => match self.sessions.get_mut(&output.token) {
                None => Dispatch::UnknownToken {
                    token: output.token,
                },
                Some(session) if !session.is_open() => Dispatch::Stale {
                    token: output.token,
                },
                Some(session) => {
                    if session.status == SessionStatus::Pending {
                        session.status = SessionStatus::Ready;
                    }
                    let len = output.data.len();
                    session.append(output.data);
                    Dispatch::Output {
                        token: output.token,
                        len,
                    }
                }
            },
            Payload::ShellError(failure) => match self.sessions.get_mut(&failure.token) {
                None => Dispatch::UnknownToken {
                    token: failure.token,
                },
                Some(session) if !session.is_open() => Dispatch::Stale {
                    token: failure.token,
                },
                Some(session) => {
                    let notice = Bytes::from(format!("\r\nError: {}\r\n", failure.error));
                    session.error = Some(failure.error.clone());
                    session.close(CloseReason::Remote(failure.error.clone()), Some(notice));
                    Dispatch::Failed {
                        token: failure.token,
                        error: failure.error,
                    }
                }
            },
            other => Dispatch::Ignored { kind: other.kind() },
        }
    }

    /// Close one session. Returns false if it was unknown or already closed.
    pub fn close(&mut self, token: &SessionToken, reason: CloseReason) -> bool {
        self.sessions
            .get_mut(token)
            .is_some_and(|session| session.close(reason, None))
    }

    /// Transport went away: close every open session at once and annotate
    /// its scrollback. Returns the tokens that were closed.
    pub fn close_all(&mut self) -> Vec<SessionToken> {
        let notice = Bytes::from_static(CONNECTION_CLOSED_NOTICE);
        self.sessions
            .values_mut()
            .filter_map(|session| {
                session
                    .close(CloseReason::ConnectionClosed, Some(notice.clone()))
                    .then_some(session.token)
            })
            .collect()
    }

    /// Drop a session record entirely, e.g. when its tab is closed
    pub fn forget(&mut self, token: &SessionToken) -> Option<SessionInfo> {
        let mut session = self.sessions.remove(token)?;
        session.close(CloseReason::Local, None);
        Some(session.info())
    }
}
