// crates/bgd-db/src/workers.rs
//
// Worker registry: hostname-keyed registration, heartbeats, and the slot
// sums the reconciler uses in strict mode. Liveness is never stored — it is
// computed from last_beat against a TTL at read time.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use bgd_schemas::{NewWorker, Worker};

fn worker_from_row(row: &PgRow) -> Result<Worker> {
    Ok(Worker {
        id: row.try_get("id")?,
        pool_id: row.try_get("pool_id")?,
        hostname: row.try_get("hostname")?,
        name: row.try_get("name")?,
        provider: row.try_get("provider")?,
        max_slots: row.try_get("max_slots")?,
        active: row.try_get("active")?,
        last_beat: row.try_get("last_beat")?,
        started_at: row.try_get("started_at")?,
        paused: row.try_get("paused")?,
    })
}

/// Register a worker, upserting on `(pool_id, hostname)`.
///
/// On conflict the row is replaced: `id`, `name`, `provider`, `max_slots`,
/// `active`, `last_beat`, `started_at` and `paused` all take the new
/// registration's values. The second writer wins; a previous registration's
/// `id` is silently superseded.
pub async fn register_worker(pool: &PgPool, w: &NewWorker) -> Result<Worker> {
    let row = sqlx::query(
        r#"
        insert into workers (
          id, pool_id, hostname, name, provider, max_slots, active,
          last_beat, started_at, paused
        ) values (
          $1, $2, $3, $4, $5, $6, 0, now(), now(), $7
        )
        on conflict on constraint uq_workers_pool_hostname do update
            set id         = excluded.id,
                name       = excluded.name,
                provider   = excluded.provider,
                max_slots  = excluded.max_slots,
                active     = excluded.active,
                last_beat  = excluded.last_beat,
                started_at = excluded.started_at,
                paused     = excluded.paused
        returning id, pool_id, hostname, name, provider, max_slots, active,
                  last_beat, started_at, paused
        "#,
    )
    .bind(w.id)
    .bind(w.pool_id)
    .bind(&w.hostname)
    .bind(&w.name)
    .bind(&w.provider)
    .bind(w.max_slots)
    .bind(w.paused)
    .fetch_one(pool)
    .await
    .context("register_worker failed")?;

    worker_from_row(&row)
}

pub async fn get_worker(pool: &PgPool, id: Uuid) -> Result<Worker> {
    let row = sqlx::query(
        r#"
        select id, pool_id, hostname, name, provider, max_slots, active,
               last_beat, started_at, paused
        from workers
        where id = $1
        "#,
    )
    .bind(id)
    .fetch_one(pool)
    .await
    .context("get_worker failed")?;

    worker_from_row(&row)
}

/// List workers, optionally restricted to a pool and to online rows.
///
/// "Online" is computed client-side from `last_beat` and `ttl_secs`; the
/// store never persists a liveness flag.
pub async fn list_workers(
    pool: &PgPool,
    pool_id: Option<Uuid>,
    online_only: bool,
    ttl_secs: i64,
) -> Result<Vec<Worker>> {
    let rows = sqlx::query(
        r#"
        select id, pool_id, hostname, name, provider, max_slots, active,
               last_beat, started_at, paused
        from workers
        where ($1::uuid is null or pool_id = $1)
        order by started_at asc, id asc
        "#,
    )
    .bind(pool_id)
    .fetch_all(pool)
    .await
    .context("list_workers failed")?;

    let now = Utc::now();
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let w = worker_from_row(&row)?;
        if online_only && !w.is_online(ttl_secs, now) {
            continue;
        }
        out.push(w);
    }
    Ok(out)
}

/// Stamp `last_beat = now()` and record the in-flight session count.
pub async fn heartbeat_worker(pool: &PgPool, id: Uuid, active: i32) -> Result<()> {
    let res = sqlx::query(
        r#"
        update workers
           set last_beat = now(),
               active    = $2
         where id = $1
        "#,
    )
    .bind(id)
    .bind(active)
    .execute(pool)
    .await
    .context("heartbeat_worker failed")?;

    if res.rows_affected() == 0 {
        return Err(anyhow::anyhow!("heartbeat_worker: worker {} not found", id));
    }
    Ok(())
}

pub async fn pause_worker(pool: &PgPool, id: Uuid, paused: bool) -> Result<()> {
    let res = sqlx::query(
        r#"
        update workers
           set paused = $2
         where id = $1
        "#,
    )
    .bind(id)
    .bind(paused)
    .execute(pool)
    .await
    .context("pause_worker failed")?;

    if res.rows_affected() == 0 {
        return Err(anyhow::anyhow!("pause_worker: worker {} not found", id));
    }
    Ok(())
}

pub async fn delete_worker(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("delete from workers where id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("delete_worker failed")?;
    Ok(())
}

/// Summed slot capacity across the online, unpaused workers of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerCapacity {
    pub total_slots: i64,
    pub total_active: i64,
}

impl WorkerCapacity {
    /// Slots not currently holding a session. Never negative: a worker whose
    /// reported `active` exceeds its (recently lowered) `max_slots`
    /// contributes zero, not a debt against its peers.
    pub fn available_slots(&self) -> i64 {
        (self.total_slots - self.total_active).max(0)
    }
}

/// Sum `max_slots` and `active` over the online, unpaused workers of a pool.
pub async fn get_worker_capacity(
    pool: &PgPool,
    pool_id: Uuid,
    ttl_secs: i64,
) -> Result<WorkerCapacity> {
    let workers = list_workers(pool, Some(pool_id), true, ttl_secs).await?;

    let mut cap = WorkerCapacity::default();
    for w in workers.iter().filter(|w| !w.paused) {
        cap.total_slots += i64::from(w.max_slots);
        cap.total_active += i64::from(w.active);
    }
    Ok(cap)
}
