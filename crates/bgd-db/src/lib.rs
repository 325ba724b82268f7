// crates/bgd-db/src/lib.rs
use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

pub const ENV_DB_URL: &str = "DATABASE_URL";

pub mod pools;
pub mod sessions;
pub mod workers;

pub use pools::{
    create_work_pool, delete_work_pool, drain_work_pool, get_or_create_default_pool,
    get_pool_capacity, get_work_pool, get_work_pool_by_name, list_work_pools, update_work_pool,
    PoolCapacity, WorkPoolUpdate,
};
pub use sessions::{
    count_sessions_by_status, create_session, delete_terminal_sessions_before, dequeue_sessions,
    expire_idle_sessions, get_session, insert_session_metrics, list_session_metrics,
    list_sessions, update_session_container, update_session_endpoints, update_session_status,
    PoolSessionCounts, SessionFilter,
};
pub use workers::{
    delete_worker, get_worker, get_worker_capacity, heartbeat_worker, list_workers, pause_worker,
    register_worker, WorkerCapacity,
};

/// Connect to Postgres using an explicit URL.
pub async fn connect(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Connect to Postgres using DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

/// Test helper used by integration tests:
/// - Connect using DATABASE_URL
/// - Ensure migrations are applied
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='sessions'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_sessions_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_sessions_table: bool,
}

/// Detect a Postgres unique constraint violation by name.
pub(crate) fn is_unique_constraint_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.constraint() == Some(constraint)
                || (db_err.code().as_deref() == Some("23505")
                    && db_err.constraint() == Some(constraint))
        }
        _ => false,
    }
}
