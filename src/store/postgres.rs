//! PostgreSQL Entity Store
//!
//! One table per entity kind. Indexed columns carry what claims filter on;
//! the entity itself lives in a JSONB `body`. Lease columns are authoritative
//! and are never taken from the body.
//!
//! The entity's [`StatefulEntity::INDEXED_PROPERTIES`] are copied into an
//! `indexed` JSONB column with a GIN index. Equality criteria on those
//! properties become a `@>` containment test in SQL; anything else is
//! evaluated in process on the decoded rows.
//!
//! Cross-process atomicity:
//! - claims lock candidate rows with `FOR UPDATE SKIP LOCKED` inside a
//!   transaction, so concurrent claimers skip each other's rows;
//! - writes by a lease holder are conditional (`WHERE lease_holder = $holder`).

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use super::query::{Criterion, Operator, PropertyValue, QuerySpec, matches_all};
use super::{ClaimRequest, EntityStore, StoreError};
use crate::clock::{Clock, SystemClock};
use crate::entity::{EntityId, Lease, StatefulEntity};

/// Rows locked per claimed slot when a filter must be applied in process
const FILTER_OVERSCAN: usize = 4;

/// Criteria split into a containment document for SQL and a residue
struct SplitFilter {
    indexed: serde_json::Map<String, serde_json::Value>,
    residue: Vec<Criterion>,
}

fn split_filter<T: StatefulEntity>(criteria: &[Criterion]) -> Result<SplitFilter, StoreError> {
    let mut split = SplitFilter {
        indexed: serde_json::Map::new(),
        residue: Vec::new(),
    };
    for criterion in criteria {
        let scalar = matches!(
            criterion.right,
            PropertyValue::Bool(_) | PropertyValue::Int(_) | PropertyValue::Str(_)
        );
        let indexed = criterion.op == Operator::Eq
            && scalar
            && T::INDEXED_PROPERTIES.contains(&criterion.left.as_str())
            && !split.indexed.contains_key(&criterion.left);
        if indexed {
            split
                .indexed
                .insert(criterion.left.clone(), serde_json::to_value(&criterion.right)?);
        } else {
            split.residue.push(criterion.clone());
        }
    }
    Ok(split)
}

pub struct PgEntityStore<T> {
    pool: PgPool,
    table: String,
    clock: Arc<dyn Clock>,
    _entity: PhantomData<fn() -> T>,
}

impl<T> PgEntityStore<T>
where
    T: StatefulEntity + Serialize + DeserializeOwned,
{
    pub fn new(pool: PgPool, table: &str) -> Result<Self, StoreError> {
        Self::with_clock(pool, table, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, table: &str, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let valid = !table.is_empty()
            && table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !table.starts_with(|c: char| c.is_ascii_digit());
        if !valid {
            return Err(StoreError::Backend(format!("invalid table name '{table}'")));
        }
        Ok(Self {
            pool,
            table: table.to_string(),
            clock,
            _entity: PhantomData,
        })
    }

    /// Create the table and claim index if missing
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let table = &self.table;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id                TEXT PRIMARY KEY,
                state             INTEGER NOT NULL,
                state_timestamp   BIGINT NOT NULL,
                pending           BOOLEAN NOT NULL DEFAULT FALSE,
                lease_holder      TEXT,
                lease_acquired_at BIGINT,
                lease_expires_at  BIGINT,
                indexed           JSONB NOT NULL DEFAULT '{{}}',
                body              JSONB NOT NULL
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "ALTER TABLE {table} ADD COLUMN IF NOT EXISTS indexed JSONB NOT NULL DEFAULT '{{}}'"
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {table}_indexed_idx ON {table} USING GIN (indexed jsonb_path_ops)"
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {table}_claim_idx ON {table} (state, state_timestamp)"
        ))
        .execute(&self.pool)
        .await?;

        tracing::info!(table = %table, "Entity table ready");
        Ok(())
    }

    fn entity_from_row(row: &PgRow) -> Result<T, StoreError> {
        let Json(body): Json<serde_json::Value> = row.try_get("body")?;
        let mut entity: T = serde_json::from_value(body)?;

        let holder: Option<String> = row.try_get("lease_holder")?;
        let acquired_at: Option<i64> = row.try_get("lease_acquired_at")?;
        let expires_at: Option<i64> = row.try_get("lease_expires_at")?;
        entity.meta_mut().lease = match (holder, acquired_at, expires_at) {
            (Some(holder), Some(acquired_at), Some(expires_at)) => Some(Lease {
                holder,
                acquired_at,
                expires_at,
            }),
            _ => None,
        };
        Ok(entity)
    }

    fn body_of(entity: &T) -> Result<serde_json::Value, StoreError> {
        let mut body = serde_json::to_value(entity)?;
        // the lease columns are the only source of truth
        if let Some(meta) = body.get_mut("meta").and_then(|m| m.as_object_mut()) {
            meta.remove("lease");
        }
        Ok(body)
    }

    fn indexed_of(entity: &T) -> Result<serde_json::Value, StoreError> {
        let mut indexed = serde_json::Map::new();
        for path in T::INDEXED_PROPERTIES {
            match entity.property(path) {
                None | Some(PropertyValue::List(_)) => {}
                Some(value) => {
                    indexed.insert(path.to_string(), serde_json::to_value(value)?);
                }
            }
        }
        Ok(serde_json::Value::Object(indexed))
    }

    /// Explain why a conditional write touched no row
    async fn conflict_for(&self, id: &EntityId) -> StoreError {
        let sql = format!("SELECT lease_holder FROM {} WHERE id = $1", self.table);
        match sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
        {
            Ok(None) => StoreError::NotFound(*id),
            Ok(Some(row)) => {
                let holder: Option<String> = row.try_get("lease_holder").ok().flatten();
                StoreError::LeaseConflict {
                    id: *id,
                    holder: holder.unwrap_or_else(|| "<none>".to_string()),
                }
            }
            Err(e) => e.into(),
        }
    }
}

#[async_trait]
impl<T> EntityStore<T> for PgEntityStore<T>
where
    T: StatefulEntity + Serialize + DeserializeOwned,
{
    async fn find(&self, id: &EntityId) -> Result<Option<T>, StoreError> {
        let sql = format!("SELECT * FROM {} WHERE id = $1", self.table);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::entity_from_row).transpose()
    }

    async fn upsert(&self, entity: T) -> Result<(), StoreError> {
        let meta = entity.meta();
        let sql = format!(
            r#"
            INSERT INTO {} (id, state, state_timestamp, pending, body, indexed)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                state = EXCLUDED.state,
                state_timestamp = EXCLUDED.state_timestamp,
                pending = EXCLUDED.pending,
                body = EXCLUDED.body,
                indexed = EXCLUDED.indexed
            "#,
            self.table
        );
        sqlx::query(&sql)
            .bind(meta.id.to_string())
            .bind(meta.state)
            .bind(meta.state_timestamp)
            .bind(meta.pending)
            .bind(Json(Self::body_of(&entity)?))
            .bind(Json(Self::indexed_of(&entity)?))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &EntityId) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let mut tx = self.pool.begin().await?;

        let select = format!("SELECT * FROM {} WHERE id = $1 FOR UPDATE", self.table);
        let row = sqlx::query(&select)
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound(*id))?;
        let entity = Self::entity_from_row(&row)?;

        if let Some(reason) = entity.deletion_blocker() {
            return Err(StoreError::DeletionRefused { id: *id, reason });
        }
        if let Some(lease) = &entity.meta().lease
            && !lease.is_expired(now)
        {
            return Err(StoreError::LeaseConflict {
                id: *id,
                holder: lease.holder.clone(),
            });
        }

        let delete = format!("DELETE FROM {} WHERE id = $1", self.table);
        sqlx::query(&delete)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn next_not_leased(&self, claim: &ClaimRequest<'_>) -> Result<Vec<T>, StoreError> {
        if claim.max == 0 {
            return Ok(Vec::new());
        }
        let split = split_filter::<T>(claim.filter)?;
        let scan = if split.residue.is_empty() {
            claim.max
        } else {
            claim.max.saturating_mul(FILTER_OVERSCAN)
        };

        let mut tx = self.pool.begin().await?;

        let select = format!(
            r#"
            SELECT * FROM {}
            WHERE state = $1
              AND state_timestamp <= $2
              AND pending = FALSE
              AND (lease_holder IS NULL OR lease_expires_at <= $2)
              AND indexed @> $3
            ORDER BY state_timestamp, id
            LIMIT $4
            FOR UPDATE SKIP LOCKED
            "#,
            self.table
        );
        let rows = sqlx::query(&select)
            .bind(claim.state)
            .bind(claim.now)
            .bind(Json(serde_json::Value::Object(split.indexed)))
            .bind(scan as i64)
            .fetch_all(&mut *tx)
            .await?;

        let mut claimed = Vec::with_capacity(claim.max.min(rows.len()));
        for row in &rows {
            if claimed.len() == claim.max {
                break;
            }
            let entity = Self::entity_from_row(row)?;
            if matches_all(&split.residue, &entity)? {
                claimed.push(entity);
            }
        }

        if claimed.is_empty() {
            tx.commit().await?;
            return Ok(claimed);
        }

        let lease = Lease::new(claim.holder, claim.now, claim.lease_duration);
        let ids: Vec<String> = claimed.iter().map(|e| e.id().to_string()).collect();
        let update = format!(
            r#"
            UPDATE {}
            SET lease_holder = $1, lease_acquired_at = $2, lease_expires_at = $3
            WHERE id = ANY($4)
            "#,
            self.table
        );
        sqlx::query(&update)
            .bind(&lease.holder)
            .bind(lease.acquired_at)
            .bind(lease.expires_at)
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        for entity in &mut claimed {
            entity.meta_mut().lease = Some(lease.clone());
        }
        Ok(claimed)
    }

    async fn acquire_lease(
        &self,
        id: &EntityId,
        holder: &str,
        duration: Duration,
        now: i64,
    ) -> Result<Lease, StoreError> {
        let lease = Lease::new(holder, now, duration);
        let sql = format!(
            r#"
            UPDATE {}
            SET lease_holder = $2, lease_acquired_at = $3, lease_expires_at = $4
            WHERE id = $1
              AND (lease_holder IS NULL OR lease_expires_at <= $3 OR lease_holder = $2)
            "#,
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(id.to_string())
            .bind(&lease.holder)
            .bind(lease.acquired_at)
            .bind(lease.expires_at)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(self.conflict_for(id).await);
        }
        Ok(lease)
    }

    async fn release_lease(&self, id: &EntityId, holder: &str) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            UPDATE {}
            SET lease_holder = NULL, lease_acquired_at = NULL, lease_expires_at = NULL
            WHERE id = $1 AND (lease_holder IS NULL OR lease_holder = $2)
            "#,
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(id.to_string())
            .bind(holder)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(self.conflict_for(id).await);
        }
        Ok(())
    }

    async fn save_and_release(&self, entity: T, holder: &str) -> Result<(), StoreError> {
        let meta = entity.meta();
        let sql = format!(
            r#"
            UPDATE {}
            SET state = $3, state_timestamp = $4, pending = $5, body = $6, indexed = $7,
                lease_holder = NULL, lease_acquired_at = NULL, lease_expires_at = NULL
            WHERE id = $1 AND lease_holder = $2
            "#,
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(meta.id.to_string())
            .bind(holder)
            .bind(meta.state)
            .bind(meta.state_timestamp)
            .bind(meta.pending)
            .bind(Json(Self::body_of(&entity)?))
            .bind(Json(Self::indexed_of(&entity)?))
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(self.conflict_for(&meta.id).await);
        }
        Ok(())
    }

    async fn query(&self, query: &QuerySpec) -> Result<Vec<T>, StoreError> {
        // indexed equalities narrow the scan; the full query is applied after
        let split = split_filter::<T>(&query.filter)?;
        let sql = format!("SELECT * FROM {} WHERE indexed @> $1", self.table);
        let rows = sqlx::query(&sql)
            .bind(Json(serde_json::Value::Object(split.indexed)))
            .fetch_all(&self.pool)
            .await?;
        let entities = rows
            .iter()
            .map(Self::entity_from_row)
            .collect::<Result<Vec<T>, StoreError>>()?;
        Ok(query.apply(entities)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::ProcessState;
    use crate::entity::fixtures::{Job, JobState};
    use sqlx::postgres::PgPoolOptions;

    async fn store() -> Option<PgEntityStore<Job>> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&url)
            .await
            .ok()?;
        let table = format!("test_jobs_{}", EntityId::new().to_string().to_lowercase());
        let store = PgEntityStore::new(pool, &table).ok()?;
        store.ensure_schema().await.ok()?;
        Some(store)
    }

    #[tokio::test]
    async fn test_rejects_unsafe_table_names() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/none")
            .unwrap();
        assert!(PgEntityStore::<Job>::new(pool.clone(), "jobs; DROP TABLE x").is_err());
        assert!(PgEntityStore::<Job>::new(pool.clone(), "1jobs").is_err());
        assert!(PgEntityStore::<Job>::new(pool, "jobs_v2").is_ok());
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_pg_claim_order_and_exclusion() {
        let Some(store) = store().await else {
            eprintln!("DATABASE_URL not set, skipping");
            return;
        };
        let mut ids = Vec::new();
        for ts in [300, 100, 200] {
            let job = Job::new("j", JobState::Queued, ts);
            ids.push(job.id());
            store.upsert(job).await.unwrap();
        }

        let request = ClaimRequest {
            state: JobState::Queued.code(),
            filter: &[],
            max: 1,
            holder: "a",
            lease_duration: Duration::from_secs(60),
            now: 1_000,
        };
        let first = store.next_not_leased(&request).await.unwrap();
        assert_eq!(first[0].id(), ids[1]);

        let other = ClaimRequest {
            holder: "b",
            max: 10,
            ..request.clone()
        };
        let rest: Vec<EntityId> = store
            .next_not_leased(&other)
            .await
            .unwrap()
            .iter()
            .map(|j| j.id())
            .collect();
        assert_eq!(rest, vec![ids[2], ids[0]]);

        // the holder's own live lease is not handed back either
        let again = ClaimRequest {
            holder: "a",
            ..request.clone()
        };
        assert!(store.next_not_leased(&again).await.unwrap().is_empty());
    }

    #[test]
    fn test_split_filter_pushes_indexed_equalities() {
        let criteria = vec![
            Criterion::equal("label", "special"),
            Criterion::equal("label", "other"),
            Criterion::new("label", Operator::Like, "sp%"),
            Criterion::equal("state", 1),
            Criterion::equal("label", vec!["a", "b"]),
        ];
        let split = split_filter::<Job>(&criteria).unwrap();
        assert_eq!(
            serde_json::Value::Object(split.indexed),
            serde_json::json!({ "label": "special" })
        );
        // repeated, non-equality, unindexed and list criteria stay in process
        assert_eq!(split.residue, criteria[1..].to_vec());
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_pg_filter_runs_in_sql() {
        let Some(store) = store().await else {
            eprintln!("DATABASE_URL not set, skipping");
            return;
        };
        // older rows of another label would fill an in-process batch
        for ts in 0..10 {
            store.upsert(Job::new("other", JobState::Queued, ts)).await.unwrap();
        }
        let special = Job::new("special", JobState::Queued, 100);
        let special_id = special.id();
        store.upsert(special).await.unwrap();

        let filter = [Criterion::equal("label", "special")];
        let request = ClaimRequest {
            state: JobState::Queued.code(),
            filter: &filter,
            max: 1,
            holder: "a",
            lease_duration: Duration::from_secs(60),
            now: 1_000,
        };
        let claimed = store.next_not_leased(&request).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id(), special_id);

        let found = store
            .query(&QuerySpec::filtered(filter.to_vec()))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), special_id);
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_pg_conditional_save() {
        let Some(store) = store().await else {
            eprintln!("DATABASE_URL not set, skipping");
            return;
        };
        let job = Job::new("j", JobState::Queued, 0);
        let id = job.id();
        store.upsert(job.clone()).await.unwrap();

        assert!(matches!(
            store.save_and_release(job.clone(), "a").await,
            Err(StoreError::LeaseConflict { .. })
        ));

        store
            .acquire_lease(&id, "a", Duration::from_secs(60), 0)
            .await
            .unwrap();
        assert!(matches!(
            store
                .acquire_lease(&id, "b", Duration::from_secs(60), 10)
                .await,
            Err(StoreError::LeaseConflict { .. })
        ));

        let mut changed = job;
        changed.label = "saved".into();
        store.save_and_release(changed, "a").await.unwrap();

        let stored = store.find(&id).await.unwrap().unwrap();
        assert_eq!(stored.label, "saved");
        assert!(stored.meta.lease.is_none());
    }
}
