/*!
SQLite Flow Store

Durable [`FlowStore`](crate::store::FlowStore) implementation backed by a
`sqlx` connection pool.

## Behavior

- The two records of an aggregate live in `flows_master` and `flows_child`;
  `create` writes both (plus any linked records) inside one transaction.
- `save` enforces the optimistic version token with a version-checked
  `UPDATE`; zero affected rows is re-inspected to report the precise cause
  (missing row, foreign tenant, or stale version).
- Serialization goes through the persistence models (see `store::models`);
  this module stays focused on database I/O.
- When the `sqlite-migrations` feature is enabled (default), embedded
  migrations (`sqlx::migrate!("./migrations")`) run on connect; disabling
  the feature assumes external migration orchestration.

## Database Schema

- `flows_master.id` ← aggregate id, `flow_type`/`status`/`tenant_id`/
  `engagement_id` as filterable columns, `payload_json` ← serialized
  `PersistedMaster`, `version` ← concurrency token.
- `flows_child.id` ← same id, `payload_json` ← serialized `PersistedChild`.
- `linked_records(flow_id, kind, key, payload_json)` ← records written
  atomically with flow creation.
*/

use std::path::Path;
use std::sync::Arc;

use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use tracing::{instrument, warn};

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::state::FlowState;
use crate::store::models::{PersistedChild, PersistedMaster, assemble};
use crate::store::{FlowStore, LinkedWrite, StoreError};
use crate::types::FlowId;
use crate::utils::json_ext::JsonSerializable;

/// Durable store backed by SQLite.
pub struct SqliteFlowStore {
    /// Shared pool for concurrent flow operations.
    pool: Arc<SqlitePool>,
}

impl std::fmt::Debug for SqliteFlowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteFlowStore").finish()
    }
}

fn backend(op: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend {
        message: format!("{op}: {e}"),
    }
}

impl SqliteFlowStore {
    /// Connect (or create) a SQLite database at `database_url`.
    /// Example URL: `"sqlite://flowline.db"`.
    #[must_use = "store must be used to persist flows"]
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        // SqlitePool::connect does not create missing database files; touch
        // the path first so file-backed URLs work out of the box.
        if let Some(path) = database_url
            .strip_prefix("sqlite://")
            .filter(|p| !p.is_empty() && *p != ":memory:")
        {
            if !Path::new(path).exists() {
                std::fs::File::create(path).map_err(|e| backend("create database file", e))?;
            }
        }
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| backend("connect", e))?;
        #[cfg(feature = "sqlite-migrations")]
        {
            if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
                return Err(backend("migration failure", e));
            }
        }
        #[cfg(not(feature = "sqlite-migrations"))]
        {
            // Feature disabled: assume external migration orchestration already applied schema.
        }
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    async fn fetch_master_row(&self, flow_id: &FlowId) -> Result<Option<SqliteRow>, StoreError> {
        sqlx::query(
            r#"
            SELECT tenant_id, engagement_id, version, payload_json
            FROM flows_master
            WHERE id = ?1
            "#,
        )
        .bind(flow_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| backend("select master", e))
    }

    /// Classify a failed tenant-scoped lookup/update against the raw row.
    fn scope_check(
        row: &SqliteRow,
        flow_id: &FlowId,
        ctx: &RequestContext,
    ) -> Result<(), StoreError> {
        let tenant_id: String = row.get("tenant_id");
        let engagement_id: String = row.get("engagement_id");
        if tenant_id != ctx.tenant_id || engagement_id != ctx.engagement_id {
            warn!(
                target: "audit",
                flow_id = %flow_id,
                tenant_id = %ctx.tenant_id,
                owner_tenant = %tenant_id,
                "cross-tenant flow access rejected"
            );
            return Err(StoreError::CrossTenant {
                flow_id: flow_id.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl FlowStore for SqliteFlowStore {
    #[instrument(skip(self, state, linked), fields(flow_id = %state.id()), err)]
    async fn create(&self, state: &FlowState, linked: &[LinkedWrite]) -> Result<FlowId, StoreError> {
        let ctx = RequestContext::current()?;
        if state.master.tenant_id != ctx.tenant_id
            || state.master.engagement_id != ctx.engagement_id
        {
            return Err(StoreError::CrossTenant {
                flow_id: state.id().clone(),
            });
        }
        let master = PersistedMaster::from(&state.master);
        let child = PersistedChild::from(&state.child);
        let master_json = master.to_json()?;
        let child_json = child.to_json()?;

        let mut tx = self.pool.begin().await.map_err(|e| backend("tx begin", e))?;

        sqlx::query(
            r#"
            INSERT INTO flows_master (
                id, flow_type, status, tenant_id, engagement_id,
                payload_json, version, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&master.id)
        .bind(&master.flow_type)
        .bind(&master.status)
        .bind(&master.tenant_id)
        .bind(&master.engagement_id)
        .bind(&master_json)
        .bind(master.version)
        .bind(&master.created_at)
        .bind(&master.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| backend("insert master", e))?;

        sqlx::query(
            r#"
            INSERT INTO flows_child (id, payload_json, updated_at)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(&child.id)
        .bind(&child_json)
        .bind(&child.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| backend("insert child", e))?;

        for write in linked {
            let payload_json = write.payload.to_json()?;
            sqlx::query(
                r#"
                INSERT INTO linked_records (flow_id, kind, key, payload_json)
                VALUES (?1, ?2, ?3, ?4)
                "#,
            )
            .bind(&master.id)
            .bind(&write.kind)
            .bind(&write.key)
            .bind(&payload_json)
            .execute(&mut *tx)
            .await
            .map_err(|e| backend("insert linked record", e))?;
        }

        tx.commit().await.map_err(|e| backend("tx commit", e))?;
        Ok(state.id().clone())
    }

    #[instrument(skip(self), err)]
    async fn load(&self, flow_id: &FlowId) -> Result<FlowState, StoreError> {
        let ctx = RequestContext::current()?;
        let row = self
            .fetch_master_row(flow_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                flow_id: flow_id.clone(),
            })?;
        Self::scope_check(&row, flow_id, &ctx)?;
        let master_json: String = row.get("payload_json");
        let master = PersistedMaster::from_json(&master_json)?;

        let child_row = sqlx::query(
            r#"
            SELECT payload_json FROM flows_child WHERE id = ?1
            "#,
        )
        .bind(flow_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| backend("select child", e))?
        .ok_or_else(|| backend("child record", format!("missing for {flow_id}")))?;
        let child_json: String = child_row.get("payload_json");
        let child = PersistedChild::from_json(&child_json)?;

        Ok(assemble(master, child))
    }

    #[instrument(skip(self, state), fields(flow_id = %state.id()), err)]
    async fn save(&self, state: &mut FlowState) -> Result<(), StoreError> {
        let ctx = RequestContext::current()?;
        let loaded_version = state.master.version;
        state.master.version += 1;
        let master = PersistedMaster::from(&state.master);
        let child = PersistedChild::from(&state.child);
        let master_json = master.to_json()?;
        let child_json = child.to_json()?;

        let mut tx = self.pool.begin().await.map_err(|e| backend("tx begin", e))?;

        let result = sqlx::query(
            r#"
            UPDATE flows_master
            SET status = ?1, payload_json = ?2, version = ?3, updated_at = ?4
            WHERE id = ?5 AND version = ?6 AND tenant_id = ?7 AND engagement_id = ?8
            "#,
        )
        .bind(&master.status)
        .bind(&master_json)
        .bind(master.version)
        .bind(&master.updated_at)
        .bind(&master.id)
        .bind(loaded_version as i64)
        .bind(&ctx.tenant_id)
        .bind(&ctx.engagement_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| backend("update master", e))?;

        if result.rows_affected() != 1 {
            // Roll back the version bump and report the precise cause.
            state.master.version = loaded_version;
            drop(tx);
            let row = self
                .fetch_master_row(state.id())
                .await?
                .ok_or_else(|| StoreError::NotFound {
                    flow_id: state.id().clone(),
                })?;
            Self::scope_check(&row, state.id(), &ctx)?;
            let actual: i64 = row.get("version");
            return Err(StoreError::VersionConflict {
                flow_id: state.id().clone(),
                expected: loaded_version,
                actual: actual.max(0) as u64,
            });
        }

        sqlx::query(
            r#"
            UPDATE flows_child SET payload_json = ?1, updated_at = ?2 WHERE id = ?3
            "#,
        )
        .bind(&child_json)
        .bind(&child.updated_at)
        .bind(&child.id)
        .execute(&mut *tx)
        .await
        .map_err(|e| backend("update child", e))?;

        tx.commit().await.map_err(|e| backend("tx commit", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn find_active(&self, flow_type: &str) -> Result<Option<FlowId>, StoreError> {
        let ctx = RequestContext::current()?;
        let row = sqlx::query(
            r#"
            SELECT id FROM flows_master
            WHERE tenant_id = ?1 AND engagement_id = ?2 AND flow_type = ?3
              AND status IN ('not_started', 'running', 'paused')
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(&ctx.tenant_id)
        .bind(&ctx.engagement_id)
        .bind(flow_type)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| backend("select active", e))?;
        Ok(row.map(|r| FlowId::from(r.get::<String, _>("id"))))
    }

    #[instrument(skip(self), err)]
    async fn list(&self) -> Result<Vec<FlowId>, StoreError> {
        let ctx = RequestContext::current()?;
        let rows = sqlx::query(
            r#"
            SELECT id FROM flows_master
            WHERE tenant_id = ?1 AND engagement_id = ?2
            ORDER BY created_at ASC
            "#,
        )
        .bind(&ctx.tenant_id)
        .bind(&ctx.engagement_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| backend("select flows", e))?;
        Ok(rows
            .into_iter()
            .map(|r| FlowId::from(r.get::<String, _>("id")))
            .collect())
    }

    #[instrument(skip(self), err)]
    async fn purge(&self, flow_id: &FlowId) -> Result<(), StoreError> {
        let ctx = RequestContext::current()?;
        let row = self
            .fetch_master_row(flow_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                flow_id: flow_id.clone(),
            })?;
        Self::scope_check(&row, flow_id, &ctx)?;

        let mut tx = self.pool.begin().await.map_err(|e| backend("tx begin", e))?;
        sqlx::query("DELETE FROM linked_records WHERE flow_id = ?1")
            .bind(flow_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| backend("delete linked", e))?;
        sqlx::query("DELETE FROM flows_child WHERE id = ?1")
            .bind(flow_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| backend("delete child", e))?;
        sqlx::query("DELETE FROM flows_master WHERE id = ?1")
            .bind(flow_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| backend("delete master", e))?;
        tx.commit().await.map_err(|e| backend("tx commit", e))?;
        Ok(())
    }
}
