use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::core::{PassiveAgent, Result};

/// A live outbound connection to a passive agent. Dropping it hangs up.
#[async_trait]
pub trait ActiveLink: Send + 'static {
    /// Resolves once the remote side has gone away
    async fn closed(&mut self);
}

/// Opens connections to passive agents
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, agent: &PassiveAgent) -> Result<Box<dyn ActiveLink>>;
}

/// Plain TCP dialer. The agent protocol spoken over the socket belongs to
/// the transport layer; this only owns the socket and notices hangups.
#[derive(Debug, Default, Clone)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, agent: &PassiveAgent) -> Result<Box<dyn ActiveLink>> {
        tracing::debug!("Dialing passive agent {} at {}", agent.name, agent.address);
        let stream = TcpStream::connect(&agent.address).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        tracing::info!("Connected to passive agent {} ({})", agent.name, peer);
        Ok(Box::new(TcpLink { stream }))
    }
}

struct TcpLink {
    stream: TcpStream,
}

#[async_trait]
impl ActiveLink for TcpLink {
    async fn closed(&mut self) {
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf).await {
                Ok(0) => return,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!("Passive link read error: {}", e);
                    return;
                }
            }
        }
    }
}
