//! Durable store for reconciled workload entities, tags, leases and run records.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;
use workload_core::tags::{TagDiff, TagError};
use workload_core::{Entity, Reconciled, Record, RunSummary, TagOwner};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "workload-storage";

/// Run summaries kept by stores that do not page their history.
pub const RUN_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A concurrent writer won the race for the same lookup key.
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("stored fields do not decode: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    InvalidTag(#[from] TagError),
}

impl StoreError {
    /// Losing the store ends the whole run; everything else is contained.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Upsert-with-history whose incoming values are derived from the stored entity.
    ///
    /// `merge` sees the current entity (or `None`) while the row is held, so a concurrent writer
    /// of the same lookup key is either fully before or fully after this one.
    async fn update<E, F>(
        &self,
        key: &E::Key,
        run: Option<Uuid>,
        merge: F,
    ) -> StoreResult<Reconciled<E>>
    where
        E: Entity,
        F: FnOnce(Option<&E>) -> E::Incoming + Send;

    /// Upsert-with-history for one entity, serialized per lookup key.
    async fn reconcile<E: Entity>(
        &self,
        key: &E::Key,
        incoming: E::Incoming,
        run: Option<Uuid>,
    ) -> StoreResult<Reconciled<E>> {
        self.update::<E, _>(key, run, move |_| incoming).await
    }

    async fn get<E: Entity>(&self, key: &E::Key) -> StoreResult<Option<Record<E>>>;

    /// Active records, optionally limited to one opportunity scope, ordered by lookup key.
    async fn list_active<E: Entity>(&self, scope: Option<i64>) -> StoreResult<Vec<Record<E>>>;

    /// Stamp an existing record as seen by `run`. Returns false when no record exists.
    async fn touch<E: Entity>(&self, key: &E::Key, run: Uuid) -> StoreResult<bool>;

    /// Deactivate active records (within `scope` when given) not stamped by `run`.
    /// Returns the lookup keys that flipped.
    async fn deactivate_unseen<E: Entity>(
        &self,
        scope: Option<i64>,
        run: Uuid,
    ) -> StoreResult<Vec<String>>;

    /// Deactivate every active record belonging to one opportunity.
    async fn deactivate_scope<E: Entity>(&self, scope_id: i64) -> StoreResult<usize>;

    async fn tags_of(&self, owner: &TagOwner) -> StoreResult<BTreeSet<String>>;

    /// Converge the owner's tag set to `names` in one atomic step.
    async fn sync_tags(&self, owner: &TagOwner, names: &[String]) -> StoreResult<TagDiff>;

    /// Single-flight lease keyed by pipeline name. Expired leases can be taken over.
    async fn acquire_lease(&self, name: &str, holder: Uuid, ttl: Duration) -> StoreResult<bool>;

    async fn release_lease(&self, name: &str, holder: Uuid) -> StoreResult<()>;

    async fn record_run(&self, summary: &RunSummary) -> StoreResult<()>;

    async fn recent_runs(&self, limit: usize) -> StoreResult<Vec<RunSummary>>;

    async fn ping(&self) -> StoreResult<()>;
}

// Entity payloads are persisted as JSON; the record metadata stays typed.
fn encode<E: Entity>(record: &Record<E>) -> StoreResult<Record<JsonValue>> {
    Ok(Record {
        id: record.id,
        lookup_key: record.lookup_key.clone(),
        scope: record.scope,
        is_active: record.is_active,
        last_seen_run: record.last_seen_run,
        created_at: record.created_at,
        updated_at: record.updated_at,
        previously_updated_at: record.previously_updated_at,
        fields: serde_json::to_value(&record.fields)?,
    })
}

fn decode<E: Entity>(row: Record<JsonValue>) -> StoreResult<Record<E>> {
    Ok(Record {
        id: row.id,
        lookup_key: row.lookup_key,
        scope: row.scope,
        is_active: row.is_active,
        last_seen_run: row.last_seen_run,
        created_at: row.created_at,
        updated_at: row.updated_at,
        previously_updated_at: row.previously_updated_at,
        fields: serde_json::from_value(row.fields)?,
    })
}

fn lease_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365))
}
