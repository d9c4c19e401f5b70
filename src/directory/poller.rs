use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::status::AgentDirectory;
use crate::core::{Agent, Result};

/// Where the full agent listing comes from
#[async_trait]
pub trait AgentSource: Send + Sync + 'static {
    async fn fetch_agents(&self) -> Result<Vec<Agent>>;
}

/// Periodically refreshes an [`AgentDirectory`]. The poller is the only
/// writer; everything else just reads the directory.
pub struct DirectoryPoller {
    source: Arc<dyn AgentSource>,
    directory: AgentDirectory,
    interval: Duration,
}

impl DirectoryPoller {
    pub fn new(source: Arc<dyn AgentSource>, directory: AgentDirectory, interval: Duration) -> Self {
        Self {
            source,
            directory,
            interval,
        }
    }

    /// Fetch once and fold the result in. Returns the number of status changes.
    pub async fn poll_once(&self) -> Result<usize> {
        let agents = self.source.fetch_agents().await?;
        let count = agents.len();
        let changes = self.directory.replace_all(agents);
        tracing::debug!("Polled {} agents, {} status changes", count, changes);
        Ok(changes)
    }

    /// Poll on the configured interval until `cancel` fires. A failed fetch
    /// leaves the directory as it was.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Directory poller stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.poll_once().await {
                            tracing::warn!("Agent directory poll failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AgentId, AgentStatus, GatewayError};
    use std::sync::Mutex;

    struct ScriptedSource {
        responses: Mutex<Vec<Result<Vec<Agent>>>>,
    }

    #[async_trait]
    impl AgentSource for ScriptedSource {
        async fn fetch_agents(&self) -> Result<Vec<Agent>> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Ok(Vec::new());
            }
            responses.remove(0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_folds_listings_and_survives_errors() {
        let mut online = Agent::new(AgentId::new(), "web-1");
        online.status = AgentStatus::Online;
        let mut updating = online.clone();
        updating.status = AgentStatus::Updating;

        let source = Arc::new(ScriptedSource {
            responses: Mutex::new(vec![
                Ok(vec![online.clone()]),
                Err(GatewayError::connection_failed("console down")),
                Ok(vec![updating]),
            ]),
        });
        let directory = AgentDirectory::new();
        let cancel = CancellationToken::new();
        let handle = DirectoryPoller::new(source, directory.clone(), Duration::from_secs(5))
            .spawn(cancel.clone());

        // first tick fires immediately
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(directory.status(&online.id), Some(AgentStatus::Online));

        // failed poll keeps the previous view
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(directory.status(&online.id), Some(AgentStatus::Online));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(directory.status(&online.id), Some(AgentStatus::Updating));

        cancel.cancel();
        handle.await.unwrap();
    }
}
