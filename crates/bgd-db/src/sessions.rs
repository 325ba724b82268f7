// crates/bgd-db/src/sessions.rs
//
// Session store: the persistent queue of sessions modelled as a state
// machine. `dequeue_sessions` is the core primitive — a single transactional
// statement with FOR UPDATE SKIP LOCKED so concurrent workers never observe
// the same pending row and never block each other on contended rows.
//
// The store does not police transition legality; callers (the worker runtime
// and the reconciler) only ever issue legal transitions.

use std::collections::BTreeMap;

use anyhow::{anyhow, ensure, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use bgd_schemas::{
    Browser, NewSession, NewSessionMetrics, OperatingSystem, Screen, Session, SessionMetrics,
    SessionStatus,
};

fn session_from_row(row: &PgRow) -> Result<Session> {
    let environment: Value = row.try_get("environment")?;
    let environment: BTreeMap<String, String> =
        serde_json::from_value(environment).context("sessions.environment is not a string map")?;

    Ok(Session {
        id: row.try_get("id")?,
        browser: Browser::parse(&row.try_get::<String, _>("browser")?)?,
        version: row.try_get("version")?,
        operating_system: OperatingSystem::parse(
            &row.try_get::<String, _>("operating_system")?,
        )?,
        screen: Screen {
            width: row.try_get("screen_width")?,
            height: row.try_get("screen_height")?,
            dpi: row.try_get("screen_dpi")?,
            scale: row.try_get("screen_scale")?,
        },
        headless: row.try_get("headless")?,
        environment,
        status: SessionStatus::parse(&row.try_get::<String, _>("status")?)?,
        work_pool_id: row.try_get("work_pool_id")?,
        worker_id: row.try_get("worker_id")?,
        ws_endpoint: row.try_get("ws_endpoint")?,
        live_url: row.try_get("live_url")?,
        provider: row.try_get("provider")?,
        container_id: row.try_get("container_id")?,
        container_network: row.try_get("container_network")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Insert a new session row in `pending`, stamping
/// `created_at = updated_at = now()`. Rejects on id collision.
pub async fn create_session(pool: &PgPool, s: &NewSession) -> Result<Session> {
    ensure!(
        s.screen.is_valid(),
        "screen dimensions must be positive: {:?}",
        s.screen
    );

    let environment =
        serde_json::to_value(&s.environment).context("serialize session environment")?;

    let row = sqlx::query(
        r#"
        insert into sessions (
          id, browser, version, operating_system,
          screen_width, screen_height, screen_dpi, screen_scale,
          headless, environment, status, work_pool_id, provider
        ) values (
          $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'pending', $11, $12
        )
        returning id, browser, version, operating_system,
                  screen_width, screen_height, screen_dpi, screen_scale,
                  headless, environment, status, work_pool_id, worker_id,
                  ws_endpoint, live_url, provider, container_id,
                  container_network, created_at, updated_at
        "#,
    )
    .bind(s.id)
    .bind(s.browser.as_str())
    .bind(&s.version)
    .bind(s.operating_system.as_str())
    .bind(s.screen.width)
    .bind(s.screen.height)
    .bind(s.screen.dpi)
    .bind(s.screen.scale)
    .bind(s.headless)
    .bind(environment)
    .bind(s.work_pool_id)
    .bind(&s.provider)
    .fetch_one(pool)
    .await
    .context("create_session failed")?;

    session_from_row(&row)
}

/// Fetch a session by id.
pub async fn get_session(pool: &PgPool, id: Uuid) -> Result<Session> {
    let row = sqlx::query(
        r#"
        select id, browser, version, operating_system,
               screen_width, screen_height, screen_dpi, screen_scale,
               headless, environment, status, work_pool_id, worker_id,
               ws_endpoint, live_url, provider, container_id,
               container_network, created_at, updated_at
        from sessions
        where id = $1
        "#,
    )
    .bind(id)
    .fetch_one(pool)
    .await
    .context("get_session failed")?;

    session_from_row(&row)
}

/// Listing filters: all optional, combined with AND.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub work_pool_id: Option<Uuid>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// List sessions, newest first.
pub async fn list_sessions(pool: &PgPool, filter: &SessionFilter) -> Result<Vec<Session>> {
    let rows = sqlx::query(
        r#"
        select id, browser, version, operating_system,
               screen_width, screen_height, screen_dpi, screen_scale,
               headless, environment, status, work_pool_id, worker_id,
               ws_endpoint, live_url, provider, container_id,
               container_network, created_at, updated_at
        from sessions
        where ($1::text is null or status = $1)
          and ($2::uuid is null or work_pool_id = $2)
          and ($3::timestamptz is null or created_at >= $3)
        order by created_at desc, id desc
        limit $4
        "#,
    )
    .bind(filter.status.map(|s| s.as_str()))
    .bind(filter.work_pool_id)
    .bind(filter.since)
    .bind(filter.limit.unwrap_or(100))
    .fetch_all(pool)
    .await
    .context("list_sessions failed")?;

    rows.iter().map(session_from_row).collect()
}

/// Atomic status write, stamping `updated_at = now()`.
///
/// No legality check is enforced here; transition policing is the caller's
/// responsibility.
pub async fn update_session_status(
    pool: &PgPool,
    id: Uuid,
    status: SessionStatus,
) -> Result<()> {
    let res = sqlx::query(
        r#"
        update sessions
           set status     = $2,
               updated_at = now()
         where id = $1
        "#,
    )
    .bind(id)
    .bind(status.as_str())
    .execute(pool)
    .await
    .context("update_session_status failed")?;

    if res.rows_affected() == 0 {
        return Err(anyhow!("update_session_status: session {} not found", id));
    }
    Ok(())
}

/// Write the endpoints and status atomically. Called exactly once per
/// session by the owning worker, after the provisioner reports healthy.
pub async fn update_session_endpoints(
    pool: &PgPool,
    id: Uuid,
    ws_endpoint: &str,
    live_url: &str,
    status: SessionStatus,
) -> Result<()> {
    let res = sqlx::query(
        r#"
        update sessions
           set ws_endpoint = $2,
               live_url    = $3,
               status      = $4,
               updated_at  = now()
         where id = $1
        "#,
    )
    .bind(id)
    .bind(ws_endpoint)
    .bind(live_url)
    .bind(status.as_str())
    .execute(pool)
    .await
    .context("update_session_endpoints failed")?;

    if res.rows_affected() == 0 {
        return Err(anyhow!("update_session_endpoints: session {} not found", id));
    }
    Ok(())
}

/// Persist the provisioner's opaque cleanup handles so an orphan sweep can
/// find the sandbox after a worker restart.
pub async fn update_session_container(
    pool: &PgPool,
    id: Uuid,
    container_id: Option<&str>,
    container_network: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        update sessions
           set container_id      = $2,
               container_network = $3,
               updated_at        = now()
         where id = $1
        "#,
    )
    .bind(id)
    .bind(container_id)
    .bind(container_network)
    .execute(pool)
    .await
    .context("update_session_container failed")?;
    Ok(())
}

/// Atomically claim up to `limit` pending sessions of a pool for a worker.
///
/// Uses `FOR UPDATE SKIP LOCKED` so concurrent workers never claim the same
/// row and never block each other: each pending row is handed to at most one
/// worker; losers observe either a different row or none. Rows are selected
/// FIFO by `created_at` (id as tiebreaker) and transition to `starting` with
/// `worker_id` set and `updated_at` stamped.
pub async fn dequeue_sessions(
    pool: &PgPool,
    pool_id: Uuid,
    worker_id: Uuid,
    limit: i64,
) -> Result<Vec<Session>> {
    if limit <= 0 {
        return Ok(Vec::new());
    }

    let rows = sqlx::query(
        r#"
        with to_claim as (
            select id
            from sessions
            where status = 'pending'
              and work_pool_id = $1
            order by created_at asc, id asc
            limit $2
            for update skip locked
        )
        update sessions
           set status     = 'starting',
               worker_id  = $3,
               updated_at = now()
         where id in (select id from to_claim)
        returning id, browser, version, operating_system,
                  screen_width, screen_height, screen_dpi, screen_scale,
                  headless, environment, status, work_pool_id, worker_id,
                  ws_endpoint, live_url, provider, container_id,
                  container_network, created_at, updated_at
        "#,
    )
    .bind(pool_id)
    .bind(limit)
    .bind(worker_id)
    .fetch_all(pool)
    .await
    .context("dequeue_sessions failed")?;

    let mut out = rows
        .iter()
        .map(session_from_row)
        .collect::<Result<Vec<_>>>()?;
    // UPDATE ... RETURNING does not guarantee row order.
    out.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
    Ok(out)
}

/// Bulk-expire idle sessions whose last update predates `cutoff`.
/// Returns the number of rows transitioned to `expired`.
pub async fn expire_idle_sessions(
    pool: &PgPool,
    pool_id: Uuid,
    cutoff: DateTime<Utc>,
) -> Result<u64> {
    let res = sqlx::query(
        r#"
        update sessions
           set status     = 'expired',
               updated_at = now()
         where work_pool_id = $1
           and status = 'idle'
           and updated_at < $2
        "#,
    )
    .bind(pool_id)
    .bind(cutoff)
    .execute(pool)
    .await
    .context("expire_idle_sessions failed")?;

    Ok(res.rows_affected())
}

/// Delete terminal sessions whose last update predates `cutoff`.
/// Returns the number of rows deleted.
pub async fn delete_terminal_sessions_before(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<u64> {
    let res = sqlx::query(
        r#"
        delete from sessions
         where status in ('completed', 'failed', 'timed_out', 'crashed', 'terminated', 'expired')
           and updated_at < $1
        "#,
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .context("delete_terminal_sessions_before failed")?;

    Ok(res.rows_affected())
}

/// Per-pool session counts feeding the scaling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSessionCounts {
    /// Sessions in {starting, running, idle}.
    pub active: i64,
    /// Sessions in pending.
    pub pending: i64,
}

pub async fn count_sessions_by_status(
    pool: &PgPool,
    pool_id: Uuid,
) -> Result<PoolSessionCounts> {
    let (active, pending): (i64, i64) = sqlx::query_as(
        r#"
        select
          count(*) filter (where status in ('starting', 'running', 'idle'))::bigint,
          count(*) filter (where status = 'pending')::bigint
        from sessions
        where work_pool_id = $1
        "#,
    )
    .bind(pool_id)
    .fetch_one(pool)
    .await
    .context("count_sessions_by_status failed")?;

    Ok(PoolSessionCounts { active, pending })
}

/// Append one metrics sample. All numbers must be non-negative
/// (also enforced by table check constraints).
pub async fn insert_session_metrics(pool: &PgPool, m: &NewSessionMetrics) -> Result<()> {
    ensure!(
        m.cpu_percent >= 0.0
            && m.memory_mb >= 0.0
            && m.network_rx_bytes >= 0
            && m.network_tx_bytes >= 0,
        "session metrics must be non-negative"
    );

    sqlx::query(
        r#"
        insert into session_metrics (
          id, session_id, cpu_percent, memory_mb, network_rx_bytes, network_tx_bytes
        ) values (
          $1, $2, $3, $4, $5, $6
        )
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(m.session_id)
    .bind(m.cpu_percent)
    .bind(m.memory_mb)
    .bind(m.network_rx_bytes)
    .bind(m.network_tx_bytes)
    .execute(pool)
    .await
    .context("insert_session_metrics failed")?;
    Ok(())
}

/// Most recent metrics samples for a session.
pub async fn list_session_metrics(
    pool: &PgPool,
    session_id: Uuid,
    limit: i64,
) -> Result<Vec<SessionMetrics>> {
    let rows = sqlx::query(
        r#"
        select id, session_id, cpu_percent, memory_mb,
               network_rx_bytes, network_tx_bytes, captured_at
        from session_metrics
        where session_id = $1
        order by captured_at desc
        limit $2
        "#,
    )
    .bind(session_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("list_session_metrics failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(SessionMetrics {
            id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            cpu_percent: row.try_get("cpu_percent")?,
            memory_mb: row.try_get("memory_mb")?,
            network_rx_bytes: row.try_get("network_rx_bytes")?,
            network_tx_bytes: row.try_get("network_tx_bytes")?,
            captured_at: row.try_get("captured_at")?,
        });
    }
    Ok(out)
}
