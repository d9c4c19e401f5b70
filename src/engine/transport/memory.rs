//! In-process transport. Each successful `connect` hands the far end of the
//! link to whoever holds the [`RemoteEnd`] receiver, which then plays the
//! agent side of the conversation.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};

use super::{Connector, TransportEvent, TransportLink};
use crate::core::{Frame, GatewayError, Payload, Result};

enum Plan {
    Fail(String),
    Hold(oneshot::Receiver<()>),
}

pub struct MemoryConnector {
    plans: Mutex<VecDeque<Plan>>,
    remotes: mpsc::UnboundedSender<RemoteEnd>,
    attempts: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (remotes, remote_rx) = mpsc::unbounded_channel();
        let connector = MemoryConnector {
            plans: Mutex::new(VecDeque::new()),
            remotes,
            attempts: AtomicUsize::new(0),
        };
        (Arc::new(connector), remote_rx)
    }

    /// Make the next connection attempt fail with `message`
    pub async fn fail_next(&self, message: impl Into<String>) {
        self.plans.lock().await.push_back(Plan::Fail(message.into()));
    }

    /// Stall the next connection attempt until the returned sender fires.
    /// Dropping the sender fails the attempt.
    pub async fn hold_next(&self) -> oneshot::Sender<()> {
        let (release_tx, release_rx) = oneshot::channel();
        self.plans.lock().await.push_back(Plan::Hold(release_rx));
        release_tx
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<TransportLink> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let plan = self.plans.lock().await.pop_front();
        match plan {
            Some(Plan::Fail(message)) => return Err(GatewayError::connection_failed(message)),
            Some(Plan::Hold(release)) => {
                if release.await.is_err() {
                    return Err(GatewayError::connection_failed("connection attempt abandoned"));
                }
            }
            None => {}
        }

        let (outbound, sent) = mpsc::unbounded_channel();
        let (events, inbound) = mpsc::unbounded_channel();
        self.remotes
            .send(RemoteEnd { sent, events })
            .map_err(|_| GatewayError::connection_failed("no remote listening"))?;
        Ok(TransportLink { outbound, inbound })
    }
}

/// Agent side of an in-memory connection. Dropping it closes the connection.
pub struct RemoteEnd {
    sent: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl RemoteEnd {
    /// Next frame the console sent, or `None` once the console hung up
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            let bytes = self.sent.recv().await?;
            if let Ok(frame) = Frame::decode(bytes) {
                return Some(frame);
            }
        }
    }

    pub fn send(&self, payload: Payload) {
        self.send_raw(Frame::new(payload).encode());
    }

    pub fn send_raw(&self, bytes: Bytes) {
        let _ = self.events.send(TransportEvent::Frame(bytes));
    }

    pub fn close(self, reason: Option<&str>) {
        let _ = self
            .events
            .send(TransportEvent::Closed(reason.map(str::to_string)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::ShellDisconnect;
    use crate::core::SessionToken;

    #[tokio::test]
    async fn test_planned_failure_then_success() {
        let (connector, mut remotes) = MemoryConnector::new();
        connector.fail_next("refused").await;

        let err = connector.connect().await.unwrap_err();
        assert!(err.to_string().contains("refused"));

        let link = connector.connect().await.unwrap();
        let mut remote = remotes.recv().await.unwrap();
        assert_eq!(connector.attempts(), 2);

        let token = SessionToken::generate();
        let frame = Frame::new(Payload::ShellDisconnect(ShellDisconnect { token }));
        link.outbound.send(frame.encode()).unwrap();
        assert_eq!(remote.recv().await, Some(frame));

        drop(link);
        assert_eq!(remote.recv().await, None);
    }
}
