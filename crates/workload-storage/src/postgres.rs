use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;
use workload_core::tags::{diff_tags, normalize_tag_names, TagDiff};
use workload_core::{reconcile, Entity, Reconciled, Record, RunSummary, TagOwner};

use crate::{decode, encode, lease_ttl, Store, StoreError, StoreResult};

const RECORD_COLUMNS: &str = "id, lookup_key, scope_id, is_active, last_seen_run, created_at, \
                              updated_at, previously_updated_at, fields";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            _ => StoreError::Query(err.to_string()),
        }
    }
}

/// Postgres-backed store. All SQL is runtime-checked; each entity kind has its own table with a
/// shared column layout and the entity payload in `fields` JSONB.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .context("running migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_record(row: &PgRow) -> StoreResult<Record<JsonValue>> {
    Ok(Record {
        id: row.try_get("id")?,
        lookup_key: row.try_get("lookup_key")?,
        scope: row.try_get("scope_id")?,
        is_active: row.try_get("is_active")?,
        last_seen_run: row.try_get("last_seen_run")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        previously_updated_at: row.try_get("previously_updated_at")?,
        fields: row.try_get("fields")?,
    })
}

#[async_trait]
impl Store for PgStore {
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
        let table = E::KIND.table();
        let lookup_key = key.to_string();
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM {table} WHERE lookup_key = $1 FOR UPDATE"
        ))
        .bind(&lookup_key)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row_to_record(&row).and_then(decode::<E>))
        .transpose()?;

        // The row stays locked until commit; a racing first insert surfaces as a conflict.
        let incoming = merge(existing.as_ref().map(|record| &record.fields));
        let out = reconcile(existing, key, incoming, run, Utc::now());
        let row = encode(&out.record)?;

        if out.created {
            sqlx::query(&format!(
                "INSERT INTO {table} ({RECORD_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
            ))
            .bind(row.id)
            .bind(&row.lookup_key)
            .bind(row.scope)
            .bind(row.is_active)
            .bind(row.last_seen_run)
            .bind(row.created_at)
            .bind(row.updated_at)
            .bind(row.previously_updated_at)
            .bind(&row.fields)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(&format!(
                "UPDATE {table}
                    SET is_active = $2,
                        last_seen_run = $3,
                        updated_at = $4,
                        previously_updated_at = $5,
                        fields = $6
                  WHERE lookup_key = $1"
            ))
            .bind(&row.lookup_key)
            .bind(row.is_active)
            .bind(row.last_seen_run)
            .bind(row.updated_at)
            .bind(row.previously_updated_at)
            .bind(&row.fields)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(kind = %E::KIND, key = %lookup_key, created = out.created, "reconciled");
        Ok(out)
    }

    async fn get<E: Entity>(&self, key: &E::Key) -> StoreResult<Option<Record<E>>> {
        let table = E::KIND.table();
        sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM {table} WHERE lookup_key = $1"
        ))
        .bind(key.to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row_to_record(&row).and_then(decode))
        .transpose()
    }

    async fn list_active<E: Entity>(&self, scope: Option<i64>) -> StoreResult<Vec<Record<E>>> {
        let table = E::KIND.table();
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM {table}
              WHERE is_active AND ($1::BIGINT IS NULL OR scope_id = $1)
              ORDER BY lookup_key"
        ))
        .bind(scope)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row_to_record(row).and_then(decode))
            .collect()
    }

    async fn touch<E: Entity>(&self, key: &E::Key, run: Uuid) -> StoreResult<bool> {
        let table = E::KIND.table();
        let result = sqlx::query(&format!(
            "UPDATE {table} SET last_seen_run = $2 WHERE lookup_key = $1"
        ))
        .bind(key.to_string())
        .bind(run)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn deactivate_unseen<E: Entity>(
        &self,
        scope: Option<i64>,
        run: Uuid,
    ) -> StoreResult<Vec<String>> {
        let table = E::KIND.table();
        let rows = sqlx::query(&format!(
            "UPDATE {table} SET is_active = FALSE
              WHERE is_active
                AND ($1::BIGINT IS NULL OR scope_id = $1)
                AND last_seen_run IS DISTINCT FROM $2
          RETURNING lookup_key"
        ))
        .bind(scope)
        .bind(run)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("lookup_key").map_err(StoreError::from))
            .collect()
    }

    async fn deactivate_scope<E: Entity>(&self, scope_id: i64) -> StoreResult<usize> {
        let table = E::KIND.table();
        let result = sqlx::query(&format!(
            "UPDATE {table} SET is_active = FALSE WHERE is_active AND scope_id = $1"
        ))
        .bind(scope_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn tags_of(&self, owner: &TagOwner) -> StoreResult<BTreeSet<String>> {
        let rows = sqlx::query(
            r#"
            SELECT t.name
              FROM entity_tags et
              JOIN tags t ON t.id = et.tag_id
             WHERE et.owner_kind = $1 AND et.owner_key = $2
            "#,
        )
        .bind(owner.kind.as_str())
        .bind(&owner.key)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(StoreError::from))
            .collect()
    }

    async fn sync_tags(&self, owner: &TagOwner, names: &[String]) -> StoreResult<TagDiff> {
        let wanted = normalize_tag_names(names)?;
        let mut tx = self.pool.begin().await?;

        let current: BTreeSet<String> = sqlx::query(
            r#"
            SELECT t.name
              FROM entity_tags et
              JOIN tags t ON t.id = et.tag_id
             WHERE et.owner_kind = $1 AND et.owner_key = $2
               FOR UPDATE OF et
            "#,
        )
        .bind(owner.kind.as_str())
        .bind(&owner.key)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| row.try_get::<String, _>("name"))
        .collect::<Result<_, _>>()?;

        let diff = diff_tags(&current, &wanted);

        for name in &diff.add {
            let tag_id: i64 = sqlx::query(
                r#"
                INSERT INTO tags (name) VALUES ($1)
                ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
                RETURNING id
                "#,
            )
            .bind(name)
            .fetch_one(&mut *tx)
            .await?
            .try_get("id")?;

            sqlx::query(
                r#"
                INSERT INTO entity_tags (owner_kind, owner_key, tag_id)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(owner.kind.as_str())
            .bind(&owner.key)
            .bind(tag_id)
            .execute(&mut *tx)
            .await?;
        }

        if !diff.remove.is_empty() {
            let removed: Vec<String> = diff.remove.iter().cloned().collect();
            sqlx::query(
                r#"
                DELETE FROM entity_tags et
                 USING tags t
                 WHERE et.tag_id = t.id
                   AND et.owner_kind = $1
                   AND et.owner_key = $2
                   AND t.name = ANY($3)
                "#,
            )
            .bind(owner.kind.as_str())
            .bind(&owner.key)
            .bind(removed)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(diff)
    }

    async fn acquire_lease(&self, name: &str, holder: Uuid, ttl: Duration) -> StoreResult<bool> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO pipeline_locks (name, holder, acquired_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE
               SET holder = EXCLUDED.holder,
                   acquired_at = EXCLUDED.acquired_at,
                   expires_at = EXCLUDED.expires_at
             WHERE pipeline_locks.expires_at <= EXCLUDED.acquired_at
                OR pipeline_locks.holder = EXCLUDED.holder
            RETURNING holder
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(now)
        .bind(now + lease_ttl(ttl))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn release_lease(&self, name: &str, holder: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM pipeline_locks WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_run(&self, summary: &RunSummary) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs (run_id, status, started_at, finished_at, summary)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (run_id) DO UPDATE
               SET status = EXCLUDED.status,
                   finished_at = EXCLUDED.finished_at,
                   summary = EXCLUDED.summary
            "#,
        )
        .bind(summary.run_id)
        .bind(summary.status.as_str())
        .bind(summary.started_at)
        .bind(summary.finished_at)
        .bind(serde_json::to_value(summary)?)
        .execute(&self.pool)
        .await?;
        debug!(run_id = %summary.run_id, status = %summary.status, "run recorded");
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> StoreResult<Vec<RunSummary>> {
        let rows = sqlx::query("SELECT summary FROM sync_runs ORDER BY started_at DESC LIMIT $1")
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> StoreResult<RunSummary> {
                let summary: JsonValue = row.try_get("summary")?;
                Ok(serde_json::from_value(summary)?)
            })
            .collect()
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
