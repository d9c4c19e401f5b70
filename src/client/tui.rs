use anyhow::{anyhow, Result};
use crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use futures_util::StreamExt;
use std::io::{self, Write};

use crate::core::{CloseReason, Geometry, SessionEvent, SessionToken};
use crate::engine::ShellEngine;

/// How an attached terminal session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Operator pressed the detach key; the session is closed locally
    Detached,
    /// The session ended on its own
    Closed(CloseReason),
}

/// Puts the local terminal in raw mode for as long as it lives
pub struct RawTerminal {
    _private: (),
}

impl RawTerminal {
    pub fn enable() -> Result<Self> {
        enable_raw_mode()?;
        Ok(RawTerminal { _private: () })
    }

    pub fn geometry() -> Result<Geometry> {
        let (cols, rows) = crossterm::terminal::size()?;
        Ok(Geometry::new(rows, cols))
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Wire the local terminal to a session until it closes or the operator
/// detaches with Ctrl-].
pub async fn attach(engine: &ShellEngine, token: SessionToken) -> Result<ExitReason> {
    let mut events = engine
        .subscribe(token)
        .await
        .ok_or_else(|| anyhow!("Session {} not found", token))?;
    let port = engine.terminal(token);
    let _raw = RawTerminal::enable()?;
    let mut stdout = io::stdout();
    let mut input = EventStream::new();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::Output(data)) => {
                    stdout.write_all(&data)?;
                    stdout.flush()?;
                }
                Some(SessionEvent::Closed(reason)) => return Ok(ExitReason::Closed(reason)),
                None => return Ok(ExitReason::Closed(CloseReason::Local)),
            },
            maybe_event = input.next() => match maybe_event {
                Some(Ok(Event::Key(key))) => {
                    if key.kind == KeyEventKind::Release {
                        continue;
                    }
                    if is_detach(&key) {
                        tracing::debug!("Detaching from session {}", token.short());
                        port.close();
                        return Ok(ExitReason::Detached);
                    }
                    if let Some(bytes) = key_to_bytes(&key) {
                        port.input(bytes);
                    }
                }
                Some(Ok(Event::Paste(text))) => port.input(text.into_bytes()),
                Some(Ok(Event::Resize(cols, rows))) => port.resize(rows, cols),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => {
                    port.close();
                    return Ok(ExitReason::Detached);
                }
            }
        }
    }
}

fn is_detach(key: &KeyEvent) -> bool {
    key.code == KeyCode::Char(']') && key.modifiers.contains(KeyModifiers::CONTROL)
}

/// Translate a key press into the bytes a VT-style terminal would send
pub fn key_to_bytes(key: &KeyEvent) -> Option<Vec<u8>> {
    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
    let alt = key.modifiers.contains(KeyModifiers::ALT);

    let mut bytes = match key.code {
        KeyCode::Char(c) if ctrl => {
            let upper = c.to_ascii_uppercase();
            match upper {
                '@'..='_' => vec![upper as u8 - b'@'],
                ' ' => vec![0],
                '?' => vec![0x7f],
                _ => return None,
            }
        }
        KeyCode::Char(c) => c.to_string().into_bytes(),
        KeyCode::Enter => vec![b'\r'],
        KeyCode::Tab => vec![b'\t'],
        KeyCode::BackTab => b"\x1b[Z".to_vec(),
        KeyCode::Backspace => vec![0x7f],
        KeyCode::Esc => vec![0x1b],
        KeyCode::Up => b"\x1b[A".to_vec(),
        KeyCode::Down => b"\x1b[B".to_vec(),
        KeyCode::Right => b"\x1b[C".to_vec(),
        KeyCode::Left => b"\x1b[D".to_vec(),
        KeyCode::Home => b"\x1b[H".to_vec(),
        KeyCode::End => b"\x1b[F".to_vec(),
        KeyCode::Insert => b"\x1b[2~".to_vec(),
        KeyCode::Delete => b"\x1b[3~".to_vec(),
        KeyCode::PageUp => b"\x1b[5~".to_vec(),
        KeyCode::PageDown => b"\x1b[6~".to_vec(),
        KeyCode::F(n) => match n {
            1 => b"\x1bOP".to_vec(),
            2 => b"\x1bOQ".to_vec(),
            3 => b"\x1bOR".to_vec(),
            4 => b"\x1bOS".to_vec(),
            5 => b"\x1b[15~".to_vec(),
            6..=8 => format!("\x1b[{}~", n + 11).into_bytes(),
            9..=10 => format!("\x1b[{}~", n + 11).into_bytes(),
            11..=12 => format!("\x1b[{}~", n + 12).into_bytes(),
            _ => return None,
        },
        _ => return None,
    };

    if alt {
        bytes.insert(0, 0x1b);
    }
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, modifiers)
    }

    #[test]
    fn test_printable_and_control_keys() {
        assert_eq!(
            key_to_bytes(&key(KeyCode::Char('l'), KeyModifiers::NONE)),
            Some(b"l".to_vec())
        );
        assert_eq!(
            key_to_bytes(&key(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Some(vec![0x03])
        );
        assert_eq!(
            key_to_bytes(&key(KeyCode::Char('é'), KeyModifiers::NONE)),
            Some("é".as_bytes().to_vec())
        );
        assert_eq!(
            key_to_bytes(&key(KeyCode::Enter, KeyModifiers::NONE)),
            Some(b"\r".to_vec())
        );
    }

    #[test]
    fn test_navigation_and_function_keys() {
        assert_eq!(
            key_to_bytes(&key(KeyCode::Up, KeyModifiers::NONE)),
            Some(b"\x1b[A".to_vec())
        );
        assert_eq!(
            key_to_bytes(&key(KeyCode::F(5), KeyModifiers::NONE)),
            Some(b"\x1b[15~".to_vec())
        );
        assert_eq!(
            key_to_bytes(&key(KeyCode::F(12), KeyModifiers::NONE)),
            Some(b"\x1b[24~".to_vec())
        );
        assert_eq!(
            key_to_bytes(&key(KeyCode::Char('b'), KeyModifiers::ALT)),
            Some(b"\x1bb".to_vec())
        );
    }

    #[test]
    fn test_detach_key() {
        assert!(is_detach(&key(KeyCode::Char(']'), KeyModifiers::CONTROL)));
        assert!(!is_detach(&key(KeyCode::Char(']'), KeyModifiers::NONE)));
    }
}
