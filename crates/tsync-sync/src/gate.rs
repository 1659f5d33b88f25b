use std::collections::{BTreeMap, BTreeSet, HashSet};

use anyhow::Result;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use tsync_core::{instance_key, BlacklistEntry};
use tsync_fetch::{FetchError, ProjectStatuses, RecordTypeFields, SearchResult, TrackerClient};
use tsync_store::BlacklistStore;

/// In-memory view of the persisted blacklist.
///
/// Loaded once per session and re-read on every project connect, so an
/// instance blocked mid-run by another project stops being contacted.
pub struct BlacklistGate {
    store: BlacklistStore,
    blocked: RwLock<HashSet<String>>,
}

impl BlacklistGate {
    pub async fn load(store: BlacklistStore) -> Result<Self> {
        let blocked = store.load_instances().await?;
        info!(table = store.table(), blocked = blocked.len(), "blacklist loaded");
        Ok(Self {
            store,
            blocked: RwLock::new(blocked),
        })
    }

    /// Re-reads the persisted set. A failed read keeps the previous view.
    pub async fn refresh(&self) {
        match self.store.load_instances().await {
            Ok(fresh) => *self.blocked.write().await = fresh,
            Err(err) => error!(error = %err, "blacklist refresh failed; keeping previous set"),
        }
    }

    pub async fn is_blocked(&self, instance: &str) -> bool {
        self.blocked.read().await.contains(&instance_key(instance))
    }

    /// Persists an authentication-failure entry and blocks the instance for the rest of the run.
    pub async fn block(&self, instance: &str) -> Result<()> {
        let entry = BlacklistEntry::auth_failure(instance, Utc::now());
        self.store.append(&entry).await?;
        self.blocked.write().await.insert(instance_key(instance));
        warn!(instance, "instance blacklisted after authentication failure");
        Ok(())
    }

    pub fn client<'a>(&'a self, client: TrackerClient) -> GatedClient<'a> {
        GatedClient { client, gate: self }
    }
}

/// A [`TrackerClient`] whose calls short-circuit while its instance is blocked.
pub struct GatedClient<'a> {
    client: TrackerClient,
    gate: &'a BlacklistGate,
}

impl GatedClient<'_> {
    pub fn instance(&self) -> &str {
        self.client.instance()
    }

    async fn blocked(&self, call: &str) -> bool {
        let blocked = self.gate.is_blocked(self.client.instance()).await;
        if blocked {
            let instance = self.client.instance();
            warn!(instance, call, "instance is blacklisted; skipping call");
        }
        blocked
    }

    async fn on_unauthorized(&self, err: &FetchError) {
        if err.is_unauthorized() {
            if let Err(block_err) = self.gate.block(self.client.instance()).await {
                error!(
                    instance = self.client.instance(),
                    error = %block_err,
                    "failed to persist blacklist entry"
                );
            }
        }
    }

    pub async fn project_statuses(&self, project_key: &str) -> Result<ProjectStatuses, FetchError> {
        if self.blocked("project_statuses").await {
            return Ok(ProjectStatuses::default());
        }
        let out = self.client.fetch_project_statuses(project_key).await;
        if let Err(err) = &out {
            self.on_unauthorized(err).await;
        }
        out
    }

    pub async fn record_type_fields(
        &self,
        project_key: &str,
    ) -> Result<Option<BTreeMap<String, RecordTypeFields>>, FetchError> {
        if self.blocked("record_type_fields").await {
            return Ok(None);
        }
        let out = self.client.fetch_record_type_fields(project_key).await;
        if let Err(err) = &out {
            self.on_unauthorized(err).await;
        }
        out
    }

    pub async fn default_fields(&self) -> Result<Option<BTreeSet<String>>, FetchError> {
        if self.blocked("default_fields").await {
            return Ok(None);
        }
        let out = self.client.fetch_default_fields().await;
        if let Err(err) = &out {
            self.on_unauthorized(err).await;
        }
        out
    }

    pub async fn search(&self, jql: &str) -> Result<SearchResult, FetchError> {
        if self.blocked("search").await {
            return Ok(SearchResult::default());
        }
        let out = self.client.search(jql).await;
        if let Err(err) = &out {
            self.on_unauthorized(err).await;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsync_store::SyncStore;

    #[tokio::test]
    async fn membership_is_case_insensitive() {
        let store = SyncStore::in_memory().await.expect("store");
        let gate = BlacklistGate::load(store.blacklist("blacklist_table")).await.expect("gate");
        assert!(!gate.is_blocked("acme").await);

        gate.block("Acme").await.expect("block");
        assert!(gate.is_blocked("ACME").await);
        assert!(gate.is_blocked("acme").await);
    }

    #[tokio::test]
    async fn refresh_sees_entries_written_elsewhere() {
        let store = SyncStore::in_memory().await.expect("store");
        let gate = BlacklistGate::load(store.blacklist("blacklist_table")).await.expect("gate");

        store
            .blacklist("blacklist_table")
            .append(&BlacklistEntry::auth_failure("globex", Utc::now()))
            .await
            .expect("append");
        assert!(!gate.is_blocked("globex").await);

        gate.refresh().await;
        assert!(gate.is_blocked("globex").await);
    }
}
