//! Explicit event channel between a terminal widget and the engine.
//!
//! The widget produces [`TerminalEvent`]s; a pump task drains them in batches
//! and forwards them to the engine in order. Within a batch, consecutive
//! resizes collapse to the last one, so a window drag does not flood the
//! transport, and a resize queued before a keystroke still goes out first.

use bytes::Bytes;
use tokio::sync::mpsc;

use super::manager::ShellEngine;
use crate::core::{Geometry, SessionToken};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    Input(Bytes),
    Resize(Geometry),
    Close,
}

/// Producer side handed to a terminal widget. Dropping it stops the pump
/// without closing the session.
#[derive(Debug, Clone)]
pub struct TerminalPort {
    token: SessionToken,
    tx: mpsc::UnboundedSender<TerminalEvent>,
}

impl TerminalPort {
    pub fn token(&self) -> SessionToken {
        self.token
    }

    pub fn input(&self, data: impl Into<Bytes>) {
        let _ = self.tx.send(TerminalEvent::Input(data.into()));
    }

    pub fn resize(&self, rows: u16, cols: u16) {
        let _ = self.tx.send(TerminalEvent::Resize(Geometry::new(rows, cols)));
    }

    pub fn close(&self) {
        let _ = self.tx.send(TerminalEvent::Close);
    }
}

pub(crate) fn spawn(engine: ShellEngine, token: SessionToken) -> TerminalPort {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(pump(engine, token, rx));
    TerminalPort { token, tx }
}

async fn pump(engine: ShellEngine, token: SessionToken, mut rx: mpsc::UnboundedReceiver<TerminalEvent>) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }
        for event in coalesce(batch) {
            match event {
                TerminalEvent::Input(data) => engine.send_input(token, data),
                TerminalEvent::Resize(geometry) => engine.resize(token, geometry),
                TerminalEvent::Close => {
                    engine.close_session(token);
                    return;
                }
            }
        }
    }
}

/// Collapse runs of consecutive resizes to their last geometry. Order
/// relative to input and close is untouched.
pub fn coalesce(events: Vec<TerminalEvent>) -> Vec<TerminalEvent> {
    let mut out: Vec<TerminalEvent> = Vec::with_capacity(events.len());
    for event in events {
        if let TerminalEvent::Resize(geometry) = event {
            if let Some(TerminalEvent::Resize(last)) = out.last_mut() {
                *last = geometry;
                continue;
            }
        }
        out.push(event);
    }
    out
}
