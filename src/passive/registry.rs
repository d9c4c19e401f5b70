//! Passive agent records and their activation lifecycle.
//!
//! Each record is Inactive until a dial succeeds and Active while that
//! connection lives. At most one dial per record is ever in flight: manual
//! `activate_now` and the automatic retry timer both go through the same
//! check-and-set, and the retry timer simply skips a tick it cannot claim.
//!
//! Every record owns a lifetime token. Deleting the record cancels it, which
//! stops the retry loop, abandons an in-flight dial and hangs up a live link.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::dialer::{ActiveLink, Dialer};
use crate::core::{GatewayError, PassiveAgent, PassiveAgentId, PassiveStatus, Result};

const MAX_NAME_LEN: usize = 32;

/// Field changes for [`PassiveRegistry::update`]; `None` keeps the value
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassiveUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_time: Option<i64>,
}

struct Entry {
    record: PassiveAgent,
    in_flight: bool,
    lifetime: CancellationToken,
    retry: CancellationToken,
}

struct Inner {
    entries: Mutex<HashMap<PassiveAgentId, Entry>>,
    dialer: Arc<dyn Dialer>,
    dial_timeout: Duration,
}

#[derive(Clone)]
pub struct PassiveRegistry {
    inner: Arc<Inner>,
}

fn validate(name: &str, address: &str, retry_time: i64) -> Result<()> {
    if name.trim().is_empty() {
        return Err(GatewayError::invalid_passive("name must not be empty"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(GatewayError::invalid_passive(format!(
            "name must be at most {} characters",
            MAX_NAME_LEN
        )));
    }
    if address.trim().is_empty() {
        return Err(GatewayError::invalid_passive("address must not be empty"));
    }
    if retry_time < 0 {
        return Err(GatewayError::invalid_passive("retry_time must not be negative"));
    }
    Ok(())
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<PassiveAgentId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the single dial slot of a record
    fn begin(&self, id: &PassiveAgentId) -> Result<(PassiveAgent, CancellationToken)> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(id)
            .ok_or(GatewayError::PassiveAgentNotFound { id: *id })?;
        if entry.in_flight {
            return Err(GatewayError::ActivationInFlight { id: *id });
        }
        if entry.record.status == PassiveStatus::Active {
            return Err(GatewayError::AlreadyActive { id: *id });
        }
        entry.in_flight = true;
        Ok((entry.record.clone(), entry.lifetime.clone()))
    }

    fn set_status(&self, id: &PassiveAgentId, status: PassiveStatus) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(id) {
            Some(entry) => {
                entry.in_flight = false;
                entry.record.status = status;
                entry.record.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Run one claimed dial to completion
    async fn dial(self: Arc<Self>, record: PassiveAgent, lifetime: CancellationToken) {
        let outcome = tokio::select! {
            _ = lifetime.cancelled() => {
                tracing::debug!("Dial to {} abandoned, record deleted", record.name);
                return;
            }
            outcome = tokio::time::timeout(self.dial_timeout, self.dialer.dial(&record)) => outcome,
        };

        let link = match outcome {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                tracing::warn!("Dial to passive agent {} failed: {}", record.name, e);
                self.set_status(&record.id, PassiveStatus::Inactive);
                return;
            }
            Err(_) => {
                tracing::warn!(
                    "Dial to passive agent {} timed out after {:?}",
                    record.name,
                    self.dial_timeout
                );
                self.set_status(&record.id, PassiveStatus::Inactive);
                return;
            }
        };

        // the record may have been deleted while the dial finished
        if lifetime.is_cancelled() || !self.set_status(&record.id, PassiveStatus::Active) {
            tracing::debug!("Discarding link to deleted passive agent {}", record.name);
            return;
        }
        tracing::info!("Passive agent {} is active", record.name);
        tokio::spawn(self.watch(record, link, lifetime));
    }

    /// Hold the link until it drops or the record goes away
    async fn watch(self: Arc<Self>, record: PassiveAgent, mut link: Box<dyn ActiveLink>, lifetime: CancellationToken) {
        tokio::select! {
            _ = lifetime.cancelled() => {
                tracing::debug!("Hanging up on deleted passive agent {}", record.name);
            }
            _ = link.closed() => {
                if self.set_status(&record.id, PassiveStatus::Inactive) {
                    tracing::info!("Passive agent {} disconnected", record.name);
                }
            }
        }
    }

    /// Automatic activation: try now, then every `interval` until cancelled.
    /// Ticks that find the record active or mid-dial are skipped.
    async fn retry_loop(self: Arc<Self>, id: PassiveAgentId, interval: Duration, cancel: CancellationToken) {
        loop {
            match self.begin(&id) {
                Ok((record, lifetime)) => {
                    tracing::debug!("Automatic dial to passive agent {}", record.name);
                    self.clone().dial(record, lifetime).await;
                }
                Err(GatewayError::PassiveAgentNotFound { .. }) => return,
                Err(e) => tracing::trace!("Skipping automatic dial: {}", e),
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

impl PassiveRegistry {
    pub fn new(dialer: Arc<dyn Dialer>, dial_timeout: Duration) -> Self {
        PassiveRegistry {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                dialer,
                dial_timeout,
            }),
        }
    }

    fn check_unique(
        entries: &HashMap<PassiveAgentId, Entry>,
        skip: Option<&PassiveAgentId>,
        name: &str,
        address: &str,
    ) -> Result<()> {
        for (id, entry) in entries {
            if Some(id) == skip {
                continue;
            }
            if entry.record.name == name {
                return Err(GatewayError::invalid_passive(format!("name '{}' is already taken", name)));
            }
            if entry.record.address == address {
                return Err(GatewayError::invalid_passive(format!(
                    "address '{}' is already registered",
                    address
                )));
            }
        }
        Ok(())
    }

    // Restart the automatic retry loop of `entry` for its current retry_time
    fn schedule(&self, entry: &mut Entry) {
        entry.retry.cancel();
        entry.retry = entry.lifetime.child_token();
        if entry.record.retry_time > 0 {
            let interval = Duration::from_secs(entry.record.retry_time as u64);
            tokio::spawn(self.inner.clone().retry_loop(
                entry.record.id,
                interval,
                entry.retry.clone(),
            ));
        }
    }

    /// Register a new Inactive record. A positive `retry_time` starts
    /// automatic dialing right away.
    pub fn create(&self, name: &str, address: &str, retry_time: i64) -> Result<PassiveAgent> {
        let name = name.trim();
        let address = address.trim();
        validate(name, address, retry_time)?;

        let mut entries = self.inner.lock();
        Self::check_unique(&entries, None, name, address)?;

        let now = Utc::now();
        let record = PassiveAgent {
            id: PassiveAgentId::new(),
            name: name.to_string(),
            address: address.to_string(),
            retry_time,
            status: PassiveStatus::Inactive,
            created_at: now,
            updated_at: now,
        };
        let lifetime = CancellationToken::new();
        let entry = entries.entry(record.id).or_insert(Entry {
            record: record.clone(),
            in_flight: false,
            retry: lifetime.child_token(),
            lifetime,
        });
        // the retry loop blocks on the lock until this returns
        self.schedule(entry);

        tracing::info!(
            "Registered passive agent {} at {} (retry every {}s)",
            record.name,
            record.address,
            record.retry_time
        );
        Ok(record)
    }

    /// Change fields of a record. A changed `retry_time` reschedules
    /// automatic dialing; a live link is left alone.
    pub fn update(&self, id: &PassiveAgentId, update: PassiveUpdate) -> Result<PassiveAgent> {
        let mut entries = self.inner.lock();
        let current = entries
            .get(id)
            .map(|entry| entry.record.clone())
            .ok_or(GatewayError::PassiveAgentNotFound { id: *id })?;

        let name = update
            .name
            .as_deref()
            .map(str::trim)
            .unwrap_or(&current.name)
            .to_string();
        let address = update
            .address
            .as_deref()
            .map(str::trim)
            .unwrap_or(&current.address)
            .to_string();
        let retry_time = update.retry_time.unwrap_or(current.retry_time);
        validate(&name, &address, retry_time)?;
        Self::check_unique(&entries, Some(id), &name, &address)?;

        let entry = entries
            .get_mut(id)
            .ok_or(GatewayError::PassiveAgentNotFound { id: *id })?;
        entry.record.name = name;
        entry.record.address = address;
        entry.record.updated_at = Utc::now();
        if entry.record.retry_time != retry_time {
            entry.record.retry_time = retry_time;
            self.schedule(entry);
        }
        tracing::info!("Updated passive agent {}", entry.record.name);
        Ok(entry.record.clone())
    }

    /// Remove a record, cancelling its retry loop, any in-flight dial and any
    /// live link.
    pub fn delete(&self, id: &PassiveAgentId) -> Result<PassiveAgent> {
        let entry = self
            .inner
            .lock()
            .remove(id)
            .ok_or(GatewayError::PassiveAgentNotFound { id: *id })?;
        entry.lifetime.cancel();
        tracing::info!("Deleted passive agent {}", entry.record.name);
        Ok(entry.record)
    }

    /// Delete every listed record that exists. Returns how many were removed.
    pub fn delete_many(&self, ids: &[PassiveAgentId]) -> usize {
        ids.iter().filter(|id| self.delete(id).is_ok()).count()
    }

    /// One immediate dial outside the retry schedule. Rejected while the
    /// record is already active or being dialed.
    pub fn activate_now(&self, id: &PassiveAgentId) -> Result<()> {
        let (record, lifetime) = self.inner.begin(id)?;
        tracing::info!("Activating passive agent {} at {}", record.name, record.address);
        tokio::spawn(self.inner.clone().dial(record, lifetime));
        Ok(())
    }

    /// Whether the "activate now" control should be enabled
    pub fn can_activate(&self, id: &PassiveAgentId) -> bool {
        self.inner.lock().get(id).is_some_and(|entry| {
            !entry.in_flight && entry.record.status == PassiveStatus::Inactive
        })
    }

    pub fn is_in_flight(&self, id: &PassiveAgentId) -> bool {
        self.inner.lock().get(id).is_some_and(|entry| entry.in_flight)
    }

    pub fn get(&self, id: &PassiveAgentId) -> Option<PassiveAgent> {
        self.inner.lock().get(id).map(|entry| entry.record.clone())
    }

    /// All records, newest first
    pub fn list(&self) -> Vec<PassiveAgent> {
        let mut records: Vec<PassiveAgent> = self
            .inner
            .lock()
            .values()
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.name.cmp(&b.name)));
        records
    }

    /// (Re)start automatic dialing for every record with a positive
    /// retry_time. Returns how many loops were started.
    pub fn start_all(&self) -> usize {
        let mut entries = self.inner.lock();
        let mut started = 0;
        for entry in entries.values_mut() {
            self.schedule(entry);
            if entry.record.retry_time > 0 {
                started += 1;
            }
        }
        tracing::info!("Started automatic activation for {} passive agents", started);
        started
    }

    /// Stop every retry loop and hang up every link
    pub fn shutdown(&self) {
        for entry in self.inner.lock().drain().map(|(_, entry)| entry) {
            entry.lifetime.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct RefusingDialer;

    #[async_trait]
    impl Dialer for RefusingDialer {
        async fn dial(&self, _agent: &PassiveAgent) -> Result<Box<dyn ActiveLink>> {
            Err(GatewayError::connection_failed("refused"))
        }
    }

    fn registry() -> PassiveRegistry {
        PassiveRegistry::new(Arc::new(RefusingDialer), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_create_validates_input() {
        let registry = registry();
        for (name, address, retry) in [
            ("", "10.0.0.1:4040", 0),
            ("edge", " ", 0),
            ("edge", "10.0.0.1:4040", -1),
            ("a-name-that-is-way-too-long-for-a-record", "10.0.0.1:4040", 0),
        ] {
            let err = registry.create(name, address, retry).unwrap_err();
            assert!(matches!(err, GatewayError::InvalidPassiveAgent { .. }), "{}", err);
        }
        assert!(registry.list().is_empty());

        let record = registry.create(" edge ", "10.0.0.1:4040", 0).unwrap();
        assert_eq!(record.name, "edge");
        assert_eq!(record.status, PassiveStatus::Inactive);
    }

    #[tokio::test]
    async fn test_names_and_addresses_are_unique() {
        let registry = registry();
        let first = registry.create("edge-1", "10.0.0.1:4040", 0).unwrap();
        assert!(registry.create("edge-1", "10.0.0.2:4040", 0).is_err());
        assert!(registry.create("edge-2", "10.0.0.1:4040", 0).is_err());

        let second = registry.create("edge-2", "10.0.0.2:4040", 0).unwrap();
        let err = registry
            .update(
                &second.id,
                PassiveUpdate {
                    name: Some("edge-1".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidPassiveAgent { .. }));

        // renaming a record to its own name is fine
        registry
            .update(
                &first.id,
                PassiveUpdate {
                    name: Some("edge-1".into()),
                    retry_time: Some(0),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_many_counts_existing_records() {
        let registry = registry();
        let a = registry.create("a", "10.0.0.1:1", 0).unwrap();
        let b = registry.create("b", "10.0.0.2:1", 0).unwrap();
        assert_eq!(
            registry.delete_many(&[a.id, PassiveAgentId::new(), b.id, a.id]),
            2
        );
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_record_cannot_activate() {
        let registry = registry();
        let id = PassiveAgentId::new();
        assert!(!registry.can_activate(&id));
        assert!(matches!(
            registry.activate_now(&id),
            Err(GatewayError::PassiveAgentNotFound { .. })
        ));
    }
}
