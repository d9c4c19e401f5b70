use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::config::ConsoleConfig;
use crate::core::{Agent, Config, GatewayError, PassiveAgent, PassiveAgentId, Result};
use crate::directory::{AgentQuery, AgentSource};
use crate::passive::PassiveUpdate;

const LISTING_PAGE_SIZE: usize = 100;

/// `{code, msg, data}` wrapper every console endpoint answers with
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: u64,
}

#[derive(Debug, Serialize)]
pub struct CreatePassiveRequest {
    pub name: String,
    pub address: String,
    pub retry_time: i64,
}

#[derive(Debug, Serialize)]
struct IdsRequest<'a> {
    id: &'a [PassiveAgentId],
}

/// HTTP client for the console's monitor endpoints
#[derive(Debug, Clone)]
pub struct ConsoleClient {
    base_url: Url,
    config: ConsoleConfig,
    client: Client,
}

impl ConsoleClient {
    pub fn new(config: &ConsoleConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| GatewayError::connection_failed(format!("invalid console url: {}", e)))?;
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            base_url,
            config: config.clone(),
            client,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.console)
    }

    fn api_url(&self, path: &str) -> String {
        format!(
            "{}{}{}",
            self.base_url.as_str().trim_end_matches('/'),
            self.config.api_prefix,
            path
        )
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let (status, envelope) = self.exchange::<T>(request).await?;
        envelope.data.ok_or_else(|| GatewayError::Api {
            status,
            message: "response carried no data".to_string(),
        })
    }

    // For endpoints whose `data` is empty or irrelevant
    async fn send_unit(&self, request: RequestBuilder) -> Result<()> {
        self.exchange::<serde_json::Value>(request).await.map(|_| ())
    }

    async fn exchange<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<(u16, Envelope<T>)> {
        let response = request.send().await?;
        let status = response.status();
        tracing::debug!("{} {}", response.url().path(), status);

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(GatewayError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: Envelope<T> = response.json().await?;
        if envelope.code != 0 {
            return Err(GatewayError::Api {
                status: status.as_u16(),
                message: format!("code {}: {}", envelope.code, envelope.msg),
            });
        }
        Ok((status.as_u16(), envelope))
    }

    /// One page of the agent directory
    pub async fn list_agents(&self, query: &AgentQuery) -> Result<Page<Agent>> {
        let mut params: Vec<(&str, String)> = vec![
            ("page", query.page.max(1).to_string()),
            ("size", query.size.max(1).to_string()),
        ];
        if let Some(text) = query.text.as_deref().filter(|t| !t.is_empty()) {
            params.push(("text", text.to_string()));
        }
        for status in &query.statuses {
            params.push(("status", u8::from(*status).to_string()));
        }

        let request = self.client.get(self.api_url("/agents")).query(&params);
        self.send(request).await
    }

    /// Every agent, walking all pages
    pub async fn all_agents(&self) -> Result<Vec<Agent>> {
        let mut agents = Vec::new();
        let mut query = AgentQuery {
            size: LISTING_PAGE_SIZE,
            ..Default::default()
        };
        loop {
            let page = self.list_agents(&query).await?;
            let received = page.data.len();
            agents.extend(page.data);
            if received == 0 || agents.len() as u64 >= page.total {
                break;
            }
            query.page += 1;
        }
        Ok(agents)
    }

    /// Shell variants an operator may request
    pub async fn shell_variants(&self) -> Result<Vec<String>> {
        self.send(self.client.get(self.api_url("/settings/shell")))
            .await
    }

    /// Short-lived credential for opening the shell transport
    pub async fn capability_token(&self) -> Result<String> {
        self.send(self.client.get(self.api_url(&self.config.token_path)))
            .await
    }

    /// WebSocket URL of the shell transport. The scheme follows the console's
    /// own: `https` becomes `wss`, anything else `ws`.
    pub fn ws_url(&self, token: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| GatewayError::connection_failed(format!("cannot derive {} url", scheme)))?;
        let path = format!(
            "{}{}{}",
            url.path().trim_end_matches('/'),
            self.config.api_prefix,
            self.config.ws_path
        );
        url.set_path(&path);
        url.query_pairs_mut().clear().append_pair("token", token);
        Ok(url)
    }

    pub async fn list_passive(
        &self,
        text: Option<&str>,
        page: usize,
        size: usize,
    ) -> Result<Page<PassiveAgent>> {
        let mut params: Vec<(&str, String)> = vec![
            ("page", page.max(1).to_string()),
            ("size", size.max(1).to_string()),
            ("created_sort", "desc".to_string()),
        ];
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            params.push(("text", text.to_string()));
        }
        let request = self
            .client
            .get(self.api_url("/passive_agents"))
            .query(&params);
        self.send(request).await
    }

    pub async fn create_passive(&self, request: &CreatePassiveRequest) -> Result<PassiveAgentId> {
        tracing::debug!("POST /passive_agents request body: {:?}", request);
        self.send(self.client.post(self.api_url("/passive_agents")).json(request))
            .await
    }

    pub async fn update_passive(&self, id: &PassiveAgentId, update: &PassiveUpdate) -> Result<()> {
        let url = self.api_url(&format!("/passive_agents/{}", id));
        self.send_unit(self.client.put(url).json(update)).await
    }

    pub async fn delete_passive(&self, id: &PassiveAgentId) -> Result<()> {
        let url = self.api_url(&format!("/passive_agents/{}", id));
        self.send_unit(self.client.delete(url)).await
    }

    /// Bulk delete. Returns the number of records the console removed.
    pub async fn delete_passive_many(&self, ids: &[PassiveAgentId]) -> Result<u64> {
        let request = self
            .client
            .delete(self.api_url("/passive_agents"))
            .json(&IdsRequest { id: ids });
        self.send(request).await
    }

    pub async fn activate_passive(&self, id: &PassiveAgentId) -> Result<()> {
        let url = self.api_url(&format!("/passive_agents/{}/activate", id));
        self.send_unit(self.client.post(url).json(&serde_json::json!({})))
            .await
    }
}

#[async_trait]
impl AgentSource for ConsoleClient {
    async fn fetch_agents(&self) -> Result<Vec<Agent>> {
        self.all_agents().await
    }
}
