//! Deterministic fake provisioner for worker and reconciler scenarios.
//!
//! Behaviour is scripted up front:
//! - `failing_starts(n)` makes the first `n` start calls fail;
//! - `healthy_for_probes(n)` makes each session's health checks pass `n`
//!   times and fail from then on (`None` = healthy forever).
//!
//! Every call is journalled so tests can assert idempotency laws (e.g. stop
//! called twice succeeds twice and is recorded twice).

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use uuid::Uuid;

use bgd_provision::{Endpoints, Provisioner};
use bgd_schemas::{NewSessionMetrics, Session};

#[derive(Default)]
struct FakeState {
    start_failures_remaining: u32,
    healthy_probes: Option<u32>,
    probes_seen: HashMap<Uuid, u32>,
    started: Vec<Uuid>,
    stopped: Vec<Uuid>,
    endpoints: HashMap<Uuid, Endpoints>,
}

pub struct FakeProvisioner {
    kind: String,
    state: Mutex<FakeState>,
}

impl Default for FakeProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProvisioner {
    /// A driver whose sessions start immediately and stay healthy forever.
    pub fn new() -> Self {
        Self {
            kind: "fake".to_string(),
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Register under a different factory key (for factory tests).
    pub fn with_kind(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::new()
        }
    }

    /// Fail the first `n` start calls with an error, succeed afterwards.
    pub fn failing_starts(self, n: u32) -> Self {
        self.state
            .lock()
            .expect("fake provisioner lock poisoned")
            .start_failures_remaining = n;
        self
    }

    /// Per session: pass the first `n` health checks, fail from then on.
    pub fn healthy_for_probes(self, n: u32) -> Self {
        self.state
            .lock()
            .expect("fake provisioner lock poisoned")
            .healthy_probes = Some(n);
        self
    }

    pub fn start_count(&self) -> usize {
        self.state
            .lock()
            .expect("fake provisioner lock poisoned")
            .started
            .len()
    }

    /// How many times `stop` has been called for a session.
    pub fn stop_count(&self, session_id: Uuid) -> usize {
        self.state
            .lock()
            .expect("fake provisioner lock poisoned")
            .stopped
            .iter()
            .filter(|id| **id == session_id)
            .count()
    }

    pub fn probe_count(&self, session_id: Uuid) -> u32 {
        self.state
            .lock()
            .expect("fake provisioner lock poisoned")
            .probes_seen
            .get(&session_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn stopped_sessions(&self) -> Vec<Uuid> {
        self.state
            .lock()
            .expect("fake provisioner lock poisoned")
            .stopped
            .clone()
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn start(&self, session: &mut Session) -> Result<Endpoints> {
        let endpoints = {
            let mut state = self.state.lock().expect("fake provisioner lock poisoned");
            if state.start_failures_remaining > 0 {
                state.start_failures_remaining -= 1;
                return Err(anyhow!("scripted start failure for session {}", session.id));
            }
            state.started.push(session.id);
            // Idempotent per session id: a repeated start returns the same
            // endpoints the first call minted.
            state
                .endpoints
                .entry(session.id)
                .or_insert_with(|| Endpoints {
                    ws_url: format!("ws://fake/{}/devtools", session.id),
                    live_url: format!("http://fake/{}", session.id),
                })
                .clone()
        };

        session.ws_endpoint = Some(endpoints.ws_url.clone());
        session.live_url = Some(endpoints.live_url.clone());
        session.container_id = Some(format!("fake-{}", session.id));
        Ok(endpoints)
    }

    async fn stop(&self, session: &Session) -> Result<()> {
        let mut state = self.state.lock().expect("fake provisioner lock poisoned");
        state.stopped.push(session.id);
        Ok(())
    }

    async fn health_check(&self, session: &Session) -> Result<()> {
        let mut state = self.state.lock().expect("fake provisioner lock poisoned");
        let seen = state.probes_seen.entry(session.id).or_insert(0);
        *seen += 1;
        let seen = *seen;
        if let Some(limit) = state.healthy_probes {
            if seen > limit {
                return Err(anyhow!(
                    "scripted health failure for session {} on probe {}",
                    session.id,
                    seen
                ));
            }
        }
        Ok(())
    }

    async fn get_metrics(&self, session: &Session) -> Result<NewSessionMetrics> {
        Ok(NewSessionMetrics {
            session_id: session.id,
            cpu_percent: 1.0,
            memory_mb: 128.0,
            network_rx_bytes: 1024,
            network_tx_bytes: 512,
        })
    }

    fn kind(&self) -> &str {
        &self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use bgd_schemas::{Browser, OperatingSystem, Screen, SessionStatus};
    use chrono::Utc;

    fn make_session() -> Session {
        Session {
            id: Uuid::new_v4(),
            browser: Browser::Chrome,
            version: "latest".into(),
            operating_system: OperatingSystem::Linux,
            screen: Screen::default(),
            headless: true,
            environment: BTreeMap::new(),
            status: SessionStatus::Starting,
            work_pool_id: None,
            worker_id: None,
            ws_endpoint: None,
            live_url: None,
            provider: "fake".into(),
            container_id: None,
            container_network: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn start_is_idempotent_per_session() {
        let driver = FakeProvisioner::new();
        let mut s = make_session();
        let first = driver.start(&mut s).await.unwrap();
        let second = driver.start(&mut s).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(driver.start_count(), 2);
        assert_eq!(s.ws_endpoint.as_deref(), Some(first.ws_url.as_str()));
    }

    #[tokio::test]
    async fn scripted_start_failures_then_success() {
        let driver = FakeProvisioner::new().failing_starts(2);
        let mut s = make_session();
        assert!(driver.start(&mut s).await.is_err());
        assert!(driver.start(&mut s).await.is_err());
        assert!(driver.start(&mut s).await.is_ok());
    }

    #[tokio::test]
    async fn stop_twice_succeeds_both_times() {
        let driver = FakeProvisioner::new();
        let s = make_session();
        driver.stop(&s).await.unwrap();
        driver.stop(&s).await.unwrap();
        assert_eq!(driver.stop_count(s.id), 2);
    }

    #[tokio::test]
    async fn health_decays_after_scripted_probes() {
        let driver = FakeProvisioner::new().healthy_for_probes(2);
        let s = make_session();
        assert!(driver.health_check(&s).await.is_ok());
        assert!(driver.health_check(&s).await.is_ok());
        assert!(driver.health_check(&s).await.is_err());
        assert_eq!(driver.probe_count(s.id), 3);
    }

    #[tokio::test]
    async fn metrics_are_non_negative() {
        let driver = FakeProvisioner::new();
        let s = make_session();
        let m = driver.get_metrics(&s).await.unwrap();
        assert!(m.cpu_percent >= 0.0);
        assert!(m.memory_mb >= 0.0);
        assert!(m.network_rx_bytes >= 0);
        assert!(m.network_tx_bytes >= 0);
    }
}
