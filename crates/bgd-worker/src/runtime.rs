//! Worker runtime: registration, the poll/heartbeat loops, and graceful
//! drain.
//!
//! Correctness never relies on in-process coordination between workers —
//! concurrent claims are serialised by the store's skip-locked dequeue. The
//! only in-process shared state is the atomic active counter, mutated by
//! slot guards on driver entry/exit; `paused` and `max_slots` are re-read
//! from the store on every poll tick.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use bgd_db::{
    dequeue_sessions, get_or_create_default_pool, get_work_pool, get_worker, heartbeat_worker,
    pause_worker, register_worker,
};
use bgd_provision::Provisioner;
use bgd_schemas::NewWorker;

use crate::driver::{drive_session, DriverConfig, SlotGuard};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Target pool; when absent the worker attaches to
    /// `default-<provider>`, creating it on first use.
    pub pool_id: Option<Uuid>,
    /// Display name; defaults to `worker-<hostname>`.
    pub name: Option<String>,
    /// Provisioner kind to look up in the factory.
    pub provider: String,
    /// Slot limit registered with the store.
    pub max_slots: i32,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// How long a draining worker waits for in-flight sessions.
    pub drain_grace: Duration,
    pub driver: DriverConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_id: None,
            name: None,
            provider: "docker".to_string(),
            max_slots: 1,
            poll_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            drain_grace: Duration::from_secs(30),
            driver: DriverConfig::default(),
        }
    }
}

pub struct WorkerRuntime {
    db: PgPool,
    provisioner: Arc<dyn Provisioner>,
    pool_id: Uuid,
    worker_id: Uuid,
    active: Arc<AtomicI64>,
    config: WorkerConfig,
}

impl WorkerRuntime {
    /// Resolve the pool, register with the store, and build the runtime.
    ///
    /// Startup failures here (missing pool, unreachable store) are fatal:
    /// the binary exits non-zero.
    pub async fn connect(
        db: PgPool,
        provisioner: Arc<dyn Provisioner>,
        config: WorkerConfig,
    ) -> Result<Self> {
        let pool = match config.pool_id {
            Some(id) => get_work_pool(&db, id)
                .await
                .with_context(|| format!("target pool {id} does not exist"))?,
            None => get_or_create_default_pool(&db, &config.provider).await?,
        };

        let hostname = hostname();
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| format!("worker-{hostname}"));
        let registration = NewWorker::new(
            pool.id,
            hostname,
            name,
            provisioner.kind(),
            config.max_slots,
        );
        let row = register_worker(&db, &registration).await?;
        info!(worker = %row.id, pool = %pool.name, slots = row.max_slots, "worker registered");

        Ok(Self {
            db,
            provisioner,
            pool_id: pool.id,
            worker_id: row.id,
            active: Arc::new(AtomicI64::new(0)),
            config,
        })
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    pub fn pool_id(&self) -> Uuid {
        self.pool_id
    }

    /// In-flight session drivers right now.
    pub fn active_sessions(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    /// One poll tick: adopt remote `max_slots`/`paused`, claim up to the
    /// free slot count, spawn one driver per claimed session. Returns how
    /// many sessions were claimed.
    pub async fn poll_tick(&self) -> Result<usize> {
        let me = get_worker(&self.db, self.worker_id).await?;
        if me.paused {
            debug!(worker = %self.worker_id, "paused; skipping dequeue");
            return Ok(0);
        }

        let available = i64::from(me.max_slots) - self.active.load(Ordering::SeqCst);
        if available <= 0 {
            return Ok(0);
        }

        let sessions =
            dequeue_sessions(&self.db, self.pool_id, self.worker_id, available).await?;
        let claimed = sessions.len();
        for session in sessions {
            debug!(worker = %self.worker_id, session = %session.id, "claimed session");
            let guard = SlotGuard::acquire(&self.active);
            let db = self.db.clone();
            let provisioner = Arc::clone(&self.provisioner);
            let pool_id = self.pool_id;
            let driver_config = self.config.driver.clone();
            tokio::spawn(async move {
                // The guard lives for the driver's whole lifetime; its Drop
                // releases the slot on every exit path, panics included.
                let _guard = guard;
                drive_session(&db, &provisioner, pool_id, session, &driver_config).await;
            });
        }
        Ok(claimed)
    }

    /// Write `(now, active)` to the worker row.
    pub async fn heartbeat(&self) -> Result<()> {
        let active = self.active.load(Ordering::SeqCst) as i32;
        heartbeat_worker(&self.db, self.worker_id, active).await
    }

    /// Main loop: poll and heartbeat until `shutdown` flips, then drain.
    ///
    /// Loop errors are logged and retried on the next tick; only the
    /// initial registration is allowed to kill the process.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut poll = tokio::time::interval(self.config.poll_interval);
        let mut beat = tokio::time::interval(self.config.heartbeat_interval);

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(e) = self.poll_tick().await {
                        warn!(error = %e, "poll tick failed; retrying next tick");
                    }
                }
                _ = beat.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        warn!(error = %e, "heartbeat failed; retrying next tick");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        self.drain().await;
        Ok(())
    }

    /// Graceful shutdown: pause the row so no new claims happen, then wait
    /// for in-flight drivers up to the grace period. Sessions are never
    /// aborted here — they run to their own terminal condition.
    pub async fn drain(&self) {
        info!(worker = %self.worker_id, "draining: pausing and awaiting in-flight sessions");
        if let Err(e) = pause_worker(&self.db, self.worker_id, true).await {
            warn!(error = %e, "pausing own row failed");
        }

        let deadline = tokio::time::Instant::now() + self.config.drain_grace;
        while self.active.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let leftover = self.active.load(Ordering::SeqCst);
        if leftover > 0 {
            warn!(leftover, "drain grace elapsed with sessions still in flight");
        }
        if let Err(e) = self.heartbeat().await {
            warn!(error = %e, "final heartbeat failed");
        }
    }
}

/// Hostname for worker identity. Environment-derived: enough to distinguish
/// machines in a fleet without a hardware id.
pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "unknown-host".to_string())
}
