//! Agent liveness model.
//!
//! Reports move an agent straight to the reported status; there is no
//! transition graph. Telemetry rides along and never influences status.
//! Any number of readers may look at the directory concurrently while the
//! poller, as the only writer, folds reports in.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;

use crate::core::{Agent, AgentId, AgentStatus, Telemetry};

/// One heartbeat/telemetry observation for an agent
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub agent_id: AgentId,
    pub status: AgentStatus,
    pub telemetry: Option<Telemetry>,
    pub at: DateTime<Utc>,
}

impl StatusReport {
    pub fn new(agent_id: AgentId, status: AgentStatus) -> Self {
        StatusReport {
            agent_id,
            status,
            telemetry: None,
            at: Utc::now(),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }
}

/// Effect of folding one report into the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged(AgentStatus),
    Changed {
        from: Option<AgentStatus>,
        to: AgentStatus,
    },
}

impl Transition {
    fn between(from: Option<AgentStatus>, to: AgentStatus) -> Self {
        match from {
            Some(from) if from == to => Transition::Unchanged(to),
            _ => Transition::Changed { from, to },
        }
    }

    pub fn is_change(&self) -> bool {
        matches!(self, Transition::Changed { .. })
    }
}

/// Filter for [`AgentDirectory::query`]
#[derive(Debug, Clone)]
pub struct AgentQuery {
    pub text: Option<String>,
    /// Empty means any status
    pub statuses: Vec<AgentStatus>,
    /// 1-based
    pub page: usize,
    pub size: usize,
}

impl Default for AgentQuery {
    fn default() -> Self {
        AgentQuery {
            text: None,
            statuses: Vec::new(),
            page: 1,
            size: 20,
        }
    }
}

impl AgentQuery {
    fn matches(&self, agent: &Agent, needle: Option<&str>) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&agent.status) {
            return false;
        }
        let Some(needle) = needle else {
            return true;
        };
        let hit = |field: &str| field.to_lowercase().contains(needle);
        hit(&agent.id.to_string())
            || hit(&agent.name)
            || hit(&agent.address)
            || agent.hostname.as_deref().is_some_and(hit)
            || agent.os.as_deref().is_some_and(hit)
            || agent.arch.as_deref().is_some_and(hit)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgentDirectory {
    agents: Arc<DashMap<AgentId, Agent>>,
}

impl AgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a status report in. Unknown agents are created with their id as
    /// a placeholder name until a full record arrives.
    pub fn apply(&self, report: StatusReport) -> Transition {
        let mut entry = self
            .agents
            .entry(report.agent_id)
            .or_insert_with(|| Agent::new(report.agent_id, report.agent_id.to_string()));
        let agent = entry.value_mut();
        let previous = agent.last_report.map(|_| agent.status);
        let transition = Transition::between(previous, report.status);

        agent.status = report.status;
        agent.last_report = Some(report.at);
        if let Some(telemetry) = report.telemetry {
            agent.telemetry = telemetry;
        }
        drop(entry);

        if transition.is_change() {
            tracing::info!(
                "Agent {} status {} -> {}",
                report.agent_id,
                previous.map_or("unknown", |s| s.as_str()),
                report.status
            );
        }
        transition
    }

    /// Insert or replace a full agent record, reporting its status change
    pub fn upsert(&self, mut agent: Agent) -> Transition {
        let previous = self.agents.get(&agent.id).map(|existing| existing.status);
        let transition = Transition::between(previous, agent.status);
        if agent.last_report.is_none() {
            agent.last_report = Some(Utc::now());
        }
        if transition.is_change() {
            tracing::info!(
                "Agent {} ({}) status {} -> {}",
                agent.name,
                agent.id,
                previous.map_or("unknown", |s| s.as_str()),
                agent.status
            );
        }
        self.agents.insert(agent.id, agent);
        transition
    }

    /// Fold a complete listing: every listed agent is upserted and every
    /// known agent missing from it is reported Offline. Returns the number of
    /// status changes.
    pub fn replace_all(&self, agents: Vec<Agent>) -> usize {
        let seen: HashSet<AgentId> = agents.iter().map(|agent| agent.id).collect();
        let mut changes = agents
            .into_iter()
            .filter(|agent| self.upsert(agent.clone()).is_change())
            .count();
        changes += self.report_missing_offline(&seen);
        changes
    }

    /// Mark every agent not in `seen` Offline. Records are kept.
    pub fn report_missing_offline(&self, seen: &HashSet<AgentId>) -> usize {
        let missing: Vec<AgentId> = self
            .agents
            .iter()
            .filter(|entry| !seen.contains(entry.key()) && entry.status != AgentStatus::Offline)
            .map(|entry| *entry.key())
            .collect();
        missing
            .into_iter()
            .filter(|id| {
                self.apply(StatusReport::new(*id, AgentStatus::Offline))
                    .is_change()
            })
            .count()
    }

    pub fn status(&self, id: &AgentId) -> Option<AgentStatus> {
        self.agents.get(id).map(|agent| agent.status)
    }

    pub fn get(&self, id: &AgentId) -> Option<Agent> {
        self.agents.get(id).map(|agent| agent.clone())
    }

    /// Look an agent up by exact id string or exact name
    pub fn find(&self, key: &str) -> Option<Agent> {
        if let Ok(id) = key.parse::<AgentId>() {
            if let Some(agent) = self.get(&id) {
                return Some(agent);
            }
        }
        self.agents
            .iter()
            .find(|entry| entry.name == key)
            .map(|entry| entry.value().clone())
    }

    /// Only Online agents accept new shell sessions. Re-read on every use.
    pub fn can_open_shell(&self, id: &AgentId) -> bool {
        self.status(id) == Some(AgentStatus::Online)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Filtered, name-ordered page of agents plus the total match count
    pub fn query(&self, query: &AgentQuery) -> (Vec<Agent>, usize) {
        let needle = query
            .text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_lowercase);

        let mut matched: Vec<Agent> = self
            .agents
            .iter()
            .filter(|entry| query.matches(entry.value(), needle.as_deref()))
            .map(|entry| entry.value().clone())
            .collect();
        matched.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));

        let total = matched.len();
        let size = query.size.max(1);
        let skip = query.page.max(1).saturating_sub(1).saturating_mul(size);
        let items = matched.into_iter().skip(skip).take(size).collect();
        (items, total)
    }
}
