use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use uuid::Uuid;
use workload_core::tags::{diff_tags, normalize_tag_names, TagDiff};
use workload_core::{reconcile, Entity, EntityKind, Reconciled, Record, RunSummary, TagOwner};

use crate::{decode, encode, lease_ttl, Store, StoreResult, RUN_HISTORY_LIMIT};

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<EntityKind, BTreeMap<String, Record<JsonValue>>>,
    known_tags: BTreeSet<String>,
    tags: BTreeMap<TagOwner, BTreeSet<String>>,
    leases: BTreeMap<String, (Uuid, DateTime<Utc>)>,
    runs: VecDeque<RunSummary>,
}

/// Process-local store. One mutex serializes every write; run history keeps the newest
/// [`RUN_HISTORY_LIMIT`] summaries.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every known tag name, including ones no longer attached to anything.
    pub async fn known_tags(&self) -> BTreeSet<String> {
        self.state.lock().await.known_tags.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn update<E, F>(
        &self,
        key: &E::Key,
        run: Option<Uuid>,
        merge: F,
    ) -> StoreResult<Reconciled<E>>
    where
        E: Entity,
        F: FnOnce(Option<&E>) -> E::Incoming + Send,
    {
        let mut state = self.state.lock().await;
        let table = state.tables.entry(E::KIND).or_default();
        let lookup_key = key.to_string();
        let existing = table.get(&lookup_key).cloned().map(decode::<E>).transpose()?;
        let incoming = merge(existing.as_ref().map(|record| &record.fields));
        let out = reconcile(existing, key, incoming, run, Utc::now());
        table.insert(lookup_key, encode(&out.record)?);
        Ok(out)
    }

    async fn get<E: Entity>(&self, key: &E::Key) -> StoreResult<Option<Record<E>>> {
        let state = self.state.lock().await;
        state
            .tables
            .get(&E::KIND)
            .and_then(|t| t.get(&key.to_string()))
            .cloned()
            .map(decode)
            .transpose()
    }

    async fn list_active<E: Entity>(&self, scope: Option<i64>) -> StoreResult<Vec<Record<E>>> {
        let state = self.state.lock().await;
        let Some(table) = state.tables.get(&E::KIND) else {
            return Ok(Vec::new());
        };
        table
            .values()
            .filter(|row| row.is_active && (scope.is_none() || row.scope == scope))
            .cloned()
            .map(decode)
            .collect()
    }

    async fn touch<E: Entity>(&self, key: &E::Key, run: Uuid) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state
            .tables
            .get_mut(&E::KIND)
            .and_then(|t| t.get_mut(&key.to_string()))
        {
            Some(row) => {
                workload_core::reconcile::touch(row, run);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn deactivate_unseen<E: Entity>(
        &self,
        scope: Option<i64>,
        run: Uuid,
    ) -> StoreResult<Vec<String>> {
        let mut state = self.state.lock().await;
        let mut flipped = Vec::new();
        if let Some(table) = state.tables.get_mut(&E::KIND) {
            for row in table.values_mut() {
                let in_scope = scope.is_none() || row.scope == scope;
                if row.is_active && in_scope && row.last_seen_run != Some(run) {
                    row.is_active = false;
                    flipped.push(row.lookup_key.clone());
                }
            }
        }
        Ok(flipped)
    }

    async fn deactivate_scope<E: Entity>(&self, scope_id: i64) -> StoreResult<usize> {
        let mut state = self.state.lock().await;
        let mut count = 0;
        if let Some(table) = state.tables.get_mut(&E::KIND) {
            for row in table.values_mut() {
                if row.is_active && row.scope == Some(scope_id) {
                    row.is_active = false;
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    async fn tags_of(&self, owner: &TagOwner) -> StoreResult<BTreeSet<String>> {
        let state = self.state.lock().await;
        Ok(state.tags.get(owner).cloned().unwrap_or_default())
    }

    async fn sync_tags(&self, owner: &TagOwner, names: &[String]) -> StoreResult<TagDiff> {
        let wanted = normalize_tag_names(names)?;
        let mut state = self.state.lock().await;
        let current = state.tags.get(owner).cloned().unwrap_or_default();
        let diff = diff_tags(&current, &wanted);
        state.known_tags.extend(diff.add.iter().cloned());
        state.tags.insert(owner.clone(), wanted);
        Ok(diff)
    }

    async fn acquire_lease(&self, name: &str, holder: Uuid, ttl: Duration) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        if let Some((current, expires_at)) = state.leases.get(name) {
            if *current != holder && *expires_at > now {
                return Ok(false);
            }
        }
        state
            .leases
            .insert(name.to_string(), (holder, now + lease_ttl(ttl)));
        Ok(true)
    }

    async fn release_lease(&self, name: &str, holder: Uuid) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if matches!(state.leases.get(name), Some((current, _)) if *current == holder) {
            state.leases.remove(name);
        }
        Ok(())
    }

    async fn record_run(&self, summary: &RunSummary) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        match state.runs.iter_mut().find(|run| run.run_id == summary.run_id) {
            Some(existing) => *existing = summary.clone(),
            None => state.runs.push_back(summary.clone()),
        }
        while state.runs.len() > RUN_HISTORY_LIMIT {
            state.runs.pop_front();
        }
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> StoreResult<Vec<RunSummary>> {
        let state = self.state.lock().await;
        Ok(state.runs.iter().rev().take(limit).cloned().collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
