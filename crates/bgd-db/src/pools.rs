// crates/bgd-db/src/pools.rs
//
// WorkPool store: pool policy CRUD, drain, and the capacity reads that feed
// the scaling policy. Pools carry policy, not runtime state.

use std::collections::BTreeMap;

use anyhow::{anyhow, ensure, Context, Result};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use bgd_schemas::{NewWorkPool, QueueStrategy, WorkPool};

use crate::is_unique_constraint_violation;

fn work_pool_from_row(row: &PgRow) -> Result<WorkPool> {
    let default_env: Value = row.try_get("default_env")?;
    let default_env: BTreeMap<String, String> =
        serde_json::from_value(default_env).context("work_pools.default_env is not a string map")?;

    Ok(WorkPool {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        provider: row.try_get("provider")?,
        min_size: row.try_get("min_size")?,
        max_concurrency: row.try_get("max_concurrency")?,
        max_idle_time: row.try_get("max_idle_time")?,
        max_session_duration: row.try_get("max_session_duration")?,
        auto_scale: row.try_get("auto_scale")?,
        paused: row.try_get("paused")?,
        default_env,
        default_image: row.try_get("default_image")?,
        default_priority: row.try_get("default_priority")?,
        queue_strategy: QueueStrategy::parse(&row.try_get::<String, _>("queue_strategy")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Insert a new pool. Rejects on duplicate name.
pub async fn create_work_pool(pool: &PgPool, p: &NewWorkPool) -> Result<WorkPool> {
    ensure!(p.min_size >= 0, "min_size must be >= 0");
    ensure!(p.max_concurrency >= 1, "max_concurrency must be >= 1");

    let default_env =
        serde_json::to_value(&p.default_env).context("serialize pool default_env")?;

    let res = sqlx::query(
        r#"
        insert into work_pools (
          id, name, provider, min_size, max_concurrency,
          max_idle_time, max_session_duration, auto_scale, paused,
          default_env, default_image, default_priority, queue_strategy
        ) values (
          $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13
        )
        returning id, name, provider, min_size, max_concurrency,
                  max_idle_time, max_session_duration, auto_scale, paused,
                  default_env, default_image, default_priority, queue_strategy,
                  created_at, updated_at
        "#,
    )
    .bind(p.id)
    .bind(&p.name)
    .bind(&p.provider)
    .bind(p.min_size)
    .bind(p.max_concurrency)
    .bind(p.max_idle_time)
    .bind(p.max_session_duration)
    .bind(p.auto_scale)
    .bind(p.paused)
    .bind(default_env)
    .bind(&p.default_image)
    .bind(p.default_priority)
    .bind(p.queue_strategy.as_str())
    .fetch_one(pool)
    .await;

    match res {
        Ok(row) => work_pool_from_row(&row),
        Err(e) => {
            if is_unique_constraint_violation(&e, "uq_work_pools_name") {
                return Err(anyhow!("work pool name '{}' already exists", p.name));
            }
            Err(anyhow::Error::new(e).context("create_work_pool failed"))
        }
    }
}

pub async fn get_work_pool(pool: &PgPool, id: Uuid) -> Result<WorkPool> {
    let row = sqlx::query(
        r#"
        select id, name, provider, min_size, max_concurrency,
               max_idle_time, max_session_duration, auto_scale, paused,
               default_env, default_image, default_priority, queue_strategy,
               created_at, updated_at
        from work_pools
        where id = $1
        "#,
    )
    .bind(id)
    .fetch_one(pool)
    .await
    .context("get_work_pool failed")?;

    work_pool_from_row(&row)
}

pub async fn get_work_pool_by_name(pool: &PgPool, name: &str) -> Result<Option<WorkPool>> {
    let row = sqlx::query(
        r#"
        select id, name, provider, min_size, max_concurrency,
               max_idle_time, max_session_duration, auto_scale, paused,
               default_env, default_image, default_priority, queue_strategy,
               created_at, updated_at
        from work_pools
        where name = $1
        "#,
    )
    .bind(name)
    .fetch_optional(pool)
    .await
    .context("get_work_pool_by_name failed")?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(work_pool_from_row(&row)?))
}

/// List pools, optionally filtered on the paused flag. Name order.
pub async fn list_work_pools(pool: &PgPool, paused: Option<bool>) -> Result<Vec<WorkPool>> {
    let rows = sqlx::query(
        r#"
        select id, name, provider, min_size, max_concurrency,
               max_idle_time, max_session_duration, auto_scale, paused,
               default_env, default_image, default_priority, queue_strategy,
               created_at, updated_at
        from work_pools
        where ($1::boolean is null or paused = $1)
        order by name asc
        "#,
    )
    .bind(paused)
    .fetch_all(pool)
    .await
    .context("list_work_pools failed")?;

    rows.iter().map(work_pool_from_row).collect()
}

/// Partial update of pool policy: only the fields present are written.
#[derive(Debug, Clone, Default)]
pub struct WorkPoolUpdate {
    pub min_size: Option<i32>,
    pub max_concurrency: Option<i32>,
    pub max_idle_time: Option<i64>,
    pub max_session_duration: Option<i64>,
    pub auto_scale: Option<bool>,
    pub paused: Option<bool>,
    pub default_env: Option<BTreeMap<String, String>>,
    pub default_image: Option<String>,
    pub default_priority: Option<i32>,
}

pub async fn update_work_pool(pool: &PgPool, id: Uuid, u: &WorkPoolUpdate) -> Result<WorkPool> {
    let default_env = match &u.default_env {
        Some(env) => Some(serde_json::to_value(env).context("serialize pool default_env")?),
        None => None,
    };

    let row = sqlx::query(
        r#"
        update work_pools
           set min_size             = coalesce($2, min_size),
               max_concurrency      = coalesce($3, max_concurrency),
               max_idle_time        = coalesce($4, max_idle_time),
               max_session_duration = coalesce($5, max_session_duration),
               auto_scale           = coalesce($6, auto_scale),
               paused               = coalesce($7, paused),
               default_env          = coalesce($8, default_env),
               default_image        = coalesce($9, default_image),
               default_priority     = coalesce($10, default_priority),
               updated_at           = now()
         where id = $1
        returning id, name, provider, min_size, max_concurrency,
                  max_idle_time, max_session_duration, auto_scale, paused,
                  default_env, default_image, default_priority, queue_strategy,
                  created_at, updated_at
        "#,
    )
    .bind(id)
    .bind(u.min_size)
    .bind(u.max_concurrency)
    .bind(u.max_idle_time)
    .bind(u.max_session_duration)
    .bind(u.auto_scale)
    .bind(u.paused)
    .bind(default_env)
    .bind(&u.default_image)
    .bind(u.default_priority)
    .fetch_one(pool)
    .await
    .context("update_work_pool failed")?;

    work_pool_from_row(&row)
}

/// Drain a pool: `paused = true`, `auto_scale = false`, `min_size = 0` in
/// one atomic write. Running sessions are untouched; drain never preempts.
pub async fn drain_work_pool(pool: &PgPool, id: Uuid) -> Result<()> {
    let res = sqlx::query(
        r#"
        update work_pools
           set paused     = true,
               auto_scale = false,
               min_size   = 0,
               updated_at = now()
         where id = $1
        "#,
    )
    .bind(id)
    .execute(pool)
    .await
    .context("drain_work_pool failed")?;

    if res.rows_affected() == 0 {
        return Err(anyhow!("drain_work_pool: pool {} not found", id));
    }
    Ok(())
}

pub async fn delete_work_pool(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("delete from work_pools where id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("delete_work_pool failed")?;
    Ok(())
}

/// Fetch the `default-<provider>` pool, creating it on first use.
///
/// The insert uses `ON CONFLICT DO NOTHING` so two workers racing on first
/// startup converge on one row; the follow-up select returns whichever
/// insert won.
pub async fn get_or_create_default_pool(pool: &PgPool, provider: &str) -> Result<WorkPool> {
    let name = format!("default-{provider}");

    let defaults = NewWorkPool::named(&name, provider);
    let default_env =
        serde_json::to_value(&defaults.default_env).context("serialize pool default_env")?;

    sqlx::query(
        r#"
        insert into work_pools (
          id, name, provider, min_size, max_concurrency,
          max_idle_time, max_session_duration, auto_scale, paused,
          default_env, default_image, default_priority, queue_strategy
        ) values (
          $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13
        )
        on conflict on constraint uq_work_pools_name do nothing
        "#,
    )
    .bind(defaults.id)
    .bind(&defaults.name)
    .bind(&defaults.provider)
    .bind(defaults.min_size)
    .bind(defaults.max_concurrency)
    .bind(defaults.max_idle_time)
    .bind(defaults.max_session_duration)
    .bind(defaults.auto_scale)
    .bind(defaults.paused)
    .bind(default_env)
    .bind(&defaults.default_image)
    .bind(defaults.default_priority)
    .bind(defaults.queue_strategy.as_str())
    .execute(pool)
    .await
    .context("get_or_create_default_pool insert failed")?;

    get_work_pool_by_name(pool, &name)
        .await?
        .ok_or_else(|| anyhow!("default pool '{}' missing after upsert", name))
}

/// Pool-level capacity: the concurrency ceiling and the sessions currently
/// counted against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCapacity {
    pub max_concurrency: i32,
    /// Sessions in {starting, running, idle}.
    pub active_sessions: i64,
}

pub async fn get_pool_capacity(pool: &PgPool, pool_id: Uuid) -> Result<PoolCapacity> {
    let (max_concurrency, active_sessions): (i32, i64) = sqlx::query_as(
        r#"
        select
          p.max_concurrency,
          (
            select count(*)::bigint
            from sessions s
            where s.work_pool_id = p.id
              and s.status in ('starting', 'running', 'idle')
          )
        from work_pools p
        where p.id = $1
        "#,
    )
    .bind(pool_id)
    .fetch_one(pool)
    .await
    .context("get_pool_capacity failed")?;

    Ok(PoolCapacity {
        max_concurrency,
        active_sessions,
    })
}
