//! Pool reconciler: the control loop that maintains each pool's desired
//! state.
//!
//! One loop per process, not per pool. Each tick walks every pool and
//! applies three independent steps — scale up to `min_size`, expire stale
//! idle sessions, reap old terminal rows. A failing step is logged and never
//! aborts the tick; the next tick simply retries against fresh state.

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, error, info};

use bgd_db::{
    count_sessions_by_status, create_session, delete_terminal_sessions_before,
    expire_idle_sessions, get_worker_capacity, list_work_pools,
};
use bgd_schemas::{NewSession, WorkPool, WORKER_TTL_SECS};

pub mod policy;

pub use policy::sessions_to_create;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between ticks.
    pub tick_interval: Duration,
    /// How long terminal rows are retained before the cleanup sweep deletes
    /// them.
    pub retention_secs: i64,
    /// Strict mode clamps scale-up by online worker slots so the reconciler
    /// never creates sessions that cannot be claimed. Coarse mode scales on
    /// pool policy alone.
    pub strict_capacity: bool,
    /// Liveness window used when summing worker slots.
    pub worker_ttl_secs: i64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            retention_secs: 24 * 60 * 60,
            strict_capacity: true,
            worker_ttl_secs: WORKER_TTL_SECS,
        }
    }
}

/// What one tick did, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub pools_seen: u32,
    pub sessions_created: u64,
    pub sessions_expired: u64,
    pub sessions_deleted: u64,
}

pub struct Reconciler {
    db: PgPool,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(db: PgPool, config: ReconcilerConfig) -> Self {
        Self { db, config }
    }

    /// Run one full reconcile pass. Step errors are logged and skipped; the
    /// report counts only what actually happened.
    pub async fn tick_once(&self) -> TickReport {
        let mut report = TickReport::default();

        let pools = match list_work_pools(&self.db, None).await {
            Ok(pools) => pools,
            Err(e) => {
                error!(error = %e, "reconciler could not list pools");
                return report;
            }
        };
        report.pools_seen = pools.len() as u32;

        for pool in &pools {
            if pool.auto_scale && !pool.paused {
                match self.scale_pool(pool).await {
                    Ok(created) => report.sessions_created += created,
                    Err(e) => error!(pool = %pool.name, error = %e, "scale-up step failed"),
                }
            }

            if pool.max_idle_time > 0 {
                match self.expire_pool_idle(pool).await {
                    Ok(expired) => report.sessions_expired += expired,
                    Err(e) => error!(pool = %pool.name, error = %e, "idle-expiry step failed"),
                }
            }
        }

        match self.sweep_terminal().await {
            Ok(deleted) => report.sessions_deleted += deleted,
            Err(e) => error!(error = %e, "terminal cleanup sweep failed"),
        }

        report
    }

    /// Bring a pool up to `min_size` by inserting pending sessions that
    /// inherit the pool's defaults.
    async fn scale_pool(&self, pool: &WorkPool) -> anyhow::Result<u64> {
        let counts = count_sessions_by_status(&self.db, pool.id).await?;

        let available_slots = if self.config.strict_capacity {
            get_worker_capacity(&self.db, pool.id, self.config.worker_ttl_secs)
                .await?
                .available_slots()
        } else {
            i64::MAX
        };

        let deficit = sessions_to_create(pool, counts.active, counts.pending, available_slots);
        for _ in 0..deficit {
            let s = NewSession::with_pool_defaults(pool);
            create_session(&self.db, &s).await?;
        }

        if deficit > 0 {
            info!(
                pool = %pool.name,
                created = deficit,
                active = counts.active,
                pending = counts.pending,
                "scaled pool toward min_size"
            );
        }
        Ok(deficit as u64)
    }

    /// Transition idle sessions older than the pool's `max_idle_time` to
    /// `expired`.
    async fn expire_pool_idle(&self, pool: &WorkPool) -> anyhow::Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::seconds(pool.max_idle_time);
        let expired = expire_idle_sessions(&self.db, pool.id, cutoff).await?;
        if expired > 0 {
            info!(pool = %pool.name, expired, "expired idle sessions");
        }
        Ok(expired)
    }

    /// Delete terminal sessions past the retention window.
    async fn sweep_terminal(&self) -> anyhow::Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.config.retention_secs);
        let deleted = delete_terminal_sessions_before(&self.db, cutoff).await?;
        if deleted > 0 {
            info!(deleted, "reaped terminal sessions past retention");
        }
        Ok(deleted)
    }

    /// Tick forever until `shutdown` flips.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.tick_once().await;
                    debug!(?report, "reconcile tick");
                }
                _ = shutdown.changed() => {
                    info!("reconciler shutting down");
                    return;
                }
            }
        }
    }
}
