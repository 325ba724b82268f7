//! Pool scaling policy.
//!
//! [`sessions_to_create`] is a pure function of its inputs — no store reads,
//! no clock, no hidden state. It is the sole policy input to the reconciler,
//! so autoscaling behaviour is fully table-testable.

use bgd_schemas::WorkPool;

/// How many new pending sessions a pool needs right now.
///
/// `active` counts sessions in {starting, running, idle}; `pending` counts
/// queued sessions; `available_slots` is the free slot sum across online,
/// unpaused workers (pass `i64::MAX` for coarse mode, where policy alone
/// decides).
///
/// A paused or non-autoscaling pool never asks for sessions. The deficit
/// against `min_size` is clamped by worker slots and by the concurrency
/// ceiling, and never goes negative.
pub fn sessions_to_create(
    pool: &WorkPool,
    active: i64,
    pending: i64,
    available_slots: i64,
) -> i64 {
    if pool.paused || !pool.auto_scale {
        return 0;
    }

    let committed = active + pending;
    let mut deficit = (i64::from(pool.min_size) - committed).max(0);
    deficit = deficit.min(available_slots);
    deficit = deficit.min(i64::from(pool.max_concurrency) - committed);
    deficit.max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use bgd_schemas::QueueStrategy;
    use chrono::Utc;
    use uuid::Uuid;

    fn pool(min_size: i32, max_concurrency: i32, auto_scale: bool, paused: bool) -> WorkPool {
        WorkPool {
            id: Uuid::new_v4(),
            name: "p".into(),
            provider: "local".into(),
            min_size,
            max_concurrency,
            max_idle_time: 0,
            max_session_duration: 0,
            auto_scale,
            paused,
            default_env: BTreeMap::new(),
            default_image: None,
            default_priority: 0,
            queue_strategy: QueueStrategy::Fifo,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn paused_pool_asks_for_nothing() {
        let p = pool(5, 10, true, true);
        assert_eq!(sessions_to_create(&p, 0, 0, 100), 0);
    }

    #[test]
    fn non_autoscaling_pool_asks_for_nothing() {
        let p = pool(5, 10, false, false);
        assert_eq!(sessions_to_create(&p, 0, 0, 100), 0);
    }

    #[test]
    fn drained_pool_returns_zero_for_any_arguments() {
        // Drain sets paused=true, auto_scale=false, min_size=0.
        let p = pool(0, 10, false, true);
        for (a, n, s) in [(0, 0, 0), (3, 2, 100), (0, 0, i64::MAX)] {
            assert_eq!(sessions_to_create(&p, a, n, s), 0);
        }
    }

    #[test]
    fn min_size_zero_creates_nothing() {
        let p = pool(0, 10, true, false);
        assert_eq!(sessions_to_create(&p, 0, 0, 100), 0);
    }

    #[test]
    fn deficit_counts_active_and_pending() {
        let p = pool(3, 10, true, false);
        // 1 running + 0 pending, plenty of slots: needs 2 (scenario S3).
        assert_eq!(sessions_to_create(&p, 1, 0, 100), 2);
        // After creating them, nothing more.
        assert_eq!(sessions_to_create(&p, 1, 2, 100), 0);
    }

    #[test]
    fn deficit_is_clamped_by_worker_slots() {
        let p = pool(8, 10, true, false);
        assert_eq!(sessions_to_create(&p, 0, 0, 3), 3);
        assert_eq!(sessions_to_create(&p, 0, 0, 0), 0);
    }

    #[test]
    fn deficit_is_clamped_by_max_concurrency() {
        let p = pool(10, 4, true, false);
        assert_eq!(sessions_to_create(&p, 2, 1, 100), 1);
        // Already at the ceiling.
        assert_eq!(sessions_to_create(&p, 4, 0, 100), 0);
    }

    #[test]
    fn overcommitted_pool_never_goes_negative() {
        let p = pool(2, 3, true, false);
        // More committed than min_size and even than max_concurrency
        // (stale reads can briefly over-count).
        assert_eq!(sessions_to_create(&p, 5, 2, 100), 0);
    }

    #[test]
    fn coarse_mode_ignores_slot_clamp() {
        let p = pool(6, 10, true, false);
        assert_eq!(sessions_to_create(&p, 0, 0, i64::MAX), 6);
    }

    #[test]
    fn policy_is_a_pure_function_of_its_inputs() {
        let p = pool(4, 8, true, false);
        let first = sessions_to_create(&p, 1, 1, 5);
        for _ in 0..10 {
            assert_eq!(sessions_to_create(&p, 1, 1, 5), first);
        }
    }
}
