//! Per-session lifecycle driver.
//!
//! One driver owns one claimed session from `starting` to its terminal
//! state. All transitions for a session are issued here, serially — the
//! store's claim guarantees no concurrent writer touches the row.
//!
//! The split between the session duration and the hard deadline matters:
//! probes run on an interval, so the completion check must get a chance to
//! run before the outer deadline trips. The grace window lets a naturally
//! completing session report `completed` rather than `timed_out`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use bgd_db::{
    get_work_pool, insert_session_metrics, update_session_container, update_session_endpoints,
    update_session_status,
};
use bgd_provision::Provisioner;
use bgd_schemas::{Session, SessionStatus};

/// Driver timings. Scenario tests compress these; production keeps the
/// defaults.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Interval between health/metrics probes.
    pub probe_interval: Duration,
    /// Deadline on each health probe.
    pub health_deadline: Duration,
    /// Deadline on `Provisioner::start` (the driver's own health timeout is
    /// expected to be at or below this).
    pub start_timeout: Duration,
    /// Extra window past the session duration before the driver gives up
    /// and reports `timed_out`. Must exceed `probe_interval`.
    pub completion_grace: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            health_deadline: Duration::from_secs(3),
            start_timeout: Duration::from_secs(10),
            completion_grace: Duration::from_secs(60),
        }
    }
}

/// Holds one of the worker's slots; decrements the active counter exactly
/// once on drop, regardless of how the driver exits.
pub struct SlotGuard {
    active: Arc<AtomicI64>,
}

impl SlotGuard {
    pub fn acquire(active: &Arc<AtomicI64>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self {
            active: Arc::clone(active),
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Drive one claimed session through its lifecycle.
///
/// Never returns an error: every failure path resolves to a terminal status
/// write plus a best-effort stop. Store write failures are logged — the row
/// stays behind for the retention sweep.
pub async fn drive_session(
    db: &PgPool,
    provisioner: &Arc<dyn Provisioner>,
    pool_id: Uuid,
    mut session: Session,
    config: &DriverConfig,
) {
    let pool = match get_work_pool(db, pool_id).await {
        Ok(p) => p,
        Err(e) => {
            warn!(session = %session.id, error = %e, "pool lookup failed");
            set_status(db, session.id, SessionStatus::Failed).await;
            return;
        }
    };

    let endpoints =
        match tokio::time::timeout(config.start_timeout, provisioner.start(&mut session)).await {
            Ok(Ok(endpoints)) => endpoints,
            Ok(Err(e)) => {
                warn!(session = %session.id, error = %e, "provisioner start failed");
                set_status(db, session.id, SessionStatus::Failed).await;
                return;
            }
            Err(_) => {
                warn!(session = %session.id, "provisioner start timed out");
                set_status(db, session.id, SessionStatus::Failed).await;
                // The sandbox may have come up after the deadline.
                stop_best_effort(provisioner, &session).await;
                return;
            }
        };

    // Persist the provisioner's cleanup handles before anything else can
    // fail, so an orphan sweep can find the sandbox.
    if session.container_id.is_some() || session.container_network.is_some() {
        if let Err(e) = update_session_container(
            db,
            session.id,
            session.container_id.as_deref(),
            session.container_network.as_deref(),
        )
        .await
        {
            warn!(session = %session.id, error = %e, "persisting container handles failed");
        }
    }

    if let Err(e) = update_session_endpoints(
        db,
        session.id,
        &endpoints.ws_url,
        &endpoints.live_url,
        SessionStatus::Running,
    )
    .await
    {
        error!(session = %session.id, error = %e, "recording endpoints failed");
        stop_best_effort(provisioner, &session).await;
        set_status(db, session.id, SessionStatus::Failed).await;
        return;
    }
    session.status = SessionStatus::Running;
    info!(session = %session.id, ws = %endpoints.ws_url, "session running");

    let duration = ChronoDuration::seconds(pool.session_duration_secs());
    let grace = ChronoDuration::from_std(config.completion_grace)
        .unwrap_or_else(|_| ChronoDuration::seconds(60));
    let deadline = session.created_at + duration;
    let hard_deadline = deadline + grace;

    let terminal = loop {
        if Utc::now() >= hard_deadline {
            break SessionStatus::TimedOut;
        }

        match tokio::time::timeout(config.health_deadline, provisioner.health_check(&session))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(session = %session.id, error = %e, "health check failed");
                break SessionStatus::Failed;
            }
            Err(_) => {
                warn!(session = %session.id, "health check timed out");
                break SessionStatus::Failed;
            }
        }

        // Metrics are best-effort: a failed sample never fails the session.
        match provisioner.get_metrics(&session).await {
            Ok(m) => {
                if let Err(e) = insert_session_metrics(db, &m).await {
                    debug!(session = %session.id, error = %e, "metrics insert failed");
                }
            }
            Err(e) => debug!(session = %session.id, error = %e, "metrics collection failed"),
        }

        if Utc::now().signed_duration_since(session.created_at) > duration {
            break SessionStatus::Completed;
        }

        tokio::time::sleep(config.probe_interval).await;
    };

    set_status(db, session.id, terminal).await;
    info!(session = %session.id, status = terminal.as_str(), "session finished");

    stop_best_effort(provisioner, &session).await;
}

async fn set_status(db: &PgPool, session_id: Uuid, status: SessionStatus) {
    if let Err(e) = update_session_status(db, session_id, status).await {
        error!(session = %session_id, status = status.as_str(), error = %e,
               "terminal status write failed");
    }
}

/// Stop failures are logged, never fatal: the row has already reached a
/// terminal state and the sandbox is reclaimed by the driver's own orphan
/// sweep or manual cleanup.
async fn stop_best_effort(provisioner: &Arc<dyn Provisioner>, session: &Session) {
    if let Err(e) = provisioner.stop(session).await {
        warn!(session = %session.id, error = %e, "provisioner stop failed; sandbox may leak");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_guard_decrements_exactly_once_on_drop() {
        let active = Arc::new(AtomicI64::new(0));
        {
            let _a = SlotGuard::acquire(&active);
            let _b = SlotGuard::acquire(&active);
            assert_eq!(active.load(Ordering::SeqCst), 2);
        }
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn slot_guard_decrements_on_panic_unwind() {
        let active = Arc::new(AtomicI64::new(0));
        let cloned = Arc::clone(&active);
        let result = std::panic::catch_unwind(move || {
            let _guard = SlotGuard::acquire(&cloned);
            panic!("driver blew up");
        });
        assert!(result.is_err());
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn default_grace_exceeds_probe_interval() {
        let c = DriverConfig::default();
        assert!(c.completion_grace > c.probe_interval);
    }
}
