use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;
use uuid::Uuid;

/// Stable, opaque agent identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[serde(transparent)]
#[ts(export)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new() -> Self {
        AgentId(Uuid::new_v4())
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for AgentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(AgentId)
    }
}

/// Liveness of an agent. Serialized as its numeric code (0, 1, 2).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AgentStatus {
    #[default]
    Offline = 0,
    Online = 1,
    Updating = 2,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Offline => "offline",
            AgentStatus::Online => "online",
            AgentStatus::Updating => "updating",
        }
    }
}

impl From<AgentStatus> for u8 {
    fn from(status: AgentStatus) -> u8 {
        status as u8
    }
}

impl TryFrom<u8> for AgentStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AgentStatus::Offline),
            1 => Ok(AgentStatus::Online),
            2 => Ok(AgentStatus::Updating),
            other => Err(format!("invalid agent status code {}", other)),
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "offline" | "0" => Ok(AgentStatus::Offline),
            "online" | "1" => Ok(AgentStatus::Online),
            "updating" | "2" => Ok(AgentStatus::Updating),
            other => Err(format!("unknown agent status '{}'", other)),
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource telemetry reported alongside status. Purely informational.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Telemetry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f32>, // percent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(type = "number | null")]
    pub memory: Option<u64>, // bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(type = "number | null")]
    pub total_memory: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(type = "number | null")]
    pub disk: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(type = "number | null")]
    pub total_disk: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(type = "number | null")]
    pub net_up: Option<u64>, // bytes/s
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(type = "number | null")]
    pub net_down: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(type = "number | null")]
    pub latency: Option<i64>, // ms
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(default)]
    #[ts(type = "0 | 1 | 2")]
    pub status: AgentStatus,
    #[serde(flatten)]
    pub telemetry: Telemetry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_report: Option<DateTime<Utc>>,
}

impl Agent {
    pub fn new(id: AgentId, name: impl Into<String>) -> Self {
        Agent {
            id,
            name: name.into(),
            address: String::new(),
            hostname: None,
            os: None,
            arch: None,
            status: AgentStatus::Offline,
            telemetry: Telemetry::default(),
            last_report: None,
        }
    }

    /// The shell affordance is only usable while the agent is online
    pub fn is_shell_available(&self) -> bool {
        self.status == AgentStatus::Online
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[serde(transparent)]
#[ts(export)]
pub struct PassiveAgentId(pub Uuid);

impl PassiveAgentId {
    pub fn new() -> Self {
        PassiveAgentId(Uuid::new_v4())
    }
}

impl Default for PassiveAgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PassiveAgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for PassiveAgentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(PassiveAgentId)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PassiveStatus {
    #[default]
    Inactive = 0,
    Active = 1,
}

impl From<PassiveStatus> for u8 {
    fn from(status: PassiveStatus) -> u8 {
        status as u8
    }
}

impl TryFrom<u8> for PassiveStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PassiveStatus::Inactive),
            1 => Ok(PassiveStatus::Active),
            other => Err(format!("invalid passive agent status code {}", other)),
        }
    }
}

impl fmt::Display for PassiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassiveStatus::Inactive => f.write_str("inactive"),
            PassiveStatus::Active => f.write_str("active"),
        }
    }
}

/// An agent the gateway has to dial instead of waiting for it to connect in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PassiveAgent {
    pub id: PassiveAgentId,
    pub name: String,
    pub address: String,
    /// Seconds between automatic dial attempts; 0 disables auto-retry
    #[ts(type = "number")]
    pub retry_time: i64,
    #[serde(default)]
    #[ts(type = "0 | 1")]
    pub status: PassiveStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}
