//! Shared domain types for BrowserGrid.
//!
//! Everything here is plain data: serde-serialisable structs and enums used
//! by the store (`bgd-db`), the provisioner seam (`bgd-provision`), the
//! reconciler and the worker runtime. No I/O lives in this crate.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Liveness window for workers: a worker whose `last_beat` is older than this
/// is offline for capacity purposes.
pub const WORKER_TTL_SECS: i64 = 300;

/// Fallback session duration when a pool does not set `max_session_duration`.
pub const DEFAULT_SESSION_DURATION_SECS: i64 = 30 * 60;

// ---------------------------------------------------------------------------
// SessionStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a session.
///
/// ```text
/// pending → starting → running → {idle →}
///     (completed | failed | timed_out | crashed | terminated | expired)
/// ```
///
/// Terminal states are absorbing: the store permits any write, but no core
/// component ever issues a transition out of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Starting,
    Running,
    Idle,
    Completed,
    Failed,
    TimedOut,
    Crashed,
    Terminated,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Idle => "idle",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::TimedOut => "timed_out",
            SessionStatus::Crashed => "crashed",
            SessionStatus::Terminated => "terminated",
            SessionStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "starting" => Ok(SessionStatus::Starting),
            "running" => Ok(SessionStatus::Running),
            "idle" => Ok(SessionStatus::Idle),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "timed_out" => Ok(SessionStatus::TimedOut),
            "crashed" => Ok(SessionStatus::Crashed),
            "terminated" => Ok(SessionStatus::Terminated),
            "expired" => Ok(SessionStatus::Expired),
            other => Err(anyhow!("invalid session status: {}", other)),
        }
    }

    /// Returns `true` if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::Failed
                | SessionStatus::TimedOut
                | SessionStatus::Crashed
                | SessionStatus::Terminated
                | SessionStatus::Expired
        )
    }

    /// Returns `true` if the session occupies pool capacity
    /// (claimed but not yet terminal).
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionStatus::Starting | SessionStatus::Running | SessionStatus::Idle
        )
    }
}

/// The states counted against `max_concurrency`, in wire form.
pub const ACTIVE_STATUSES: [&str; 3] = ["starting", "running", "idle"];

// ---------------------------------------------------------------------------
// Browser / OperatingSystem
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Browser {
    Chrome,
    Chromium,
    Firefox,
    Edge,
}

impl Browser {
    pub fn as_str(&self) -> &'static str {
        match self {
            Browser::Chrome => "chrome",
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Edge => "edge",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "chrome" => Ok(Browser::Chrome),
            "chromium" => Ok(Browser::Chromium),
            "firefox" => Ok(Browser::Firefox),
            "edge" => Ok(Browser::Edge),
            other => Err(anyhow!("invalid browser: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingSystem {
    Linux,
    Windows,
    Macos,
}

impl OperatingSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingSystem::Linux => "linux",
            OperatingSystem::Windows => "windows",
            OperatingSystem::Macos => "macos",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "linux" => Ok(OperatingSystem::Linux),
            "windows" => Ok(OperatingSystem::Windows),
            "macos" => Ok(OperatingSystem::Macos),
            other => Err(anyhow!("invalid operating system: {}", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Screen
// ---------------------------------------------------------------------------

/// Requested screen geometry for a browser instance. All fields positive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Screen {
    pub width: i32,
    pub height: i32,
    pub dpi: i32,
    pub scale: f64,
}

impl Default for Screen {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            dpi: 96,
            scale: 1.0,
        }
    }
}

impl Screen {
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && self.dpi > 0 && self.scale > 0.0
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A persisted session row: one ephemeral browser instance and its lifecycle
/// record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub browser: Browser,
    pub version: String,
    pub operating_system: OperatingSystem,
    pub screen: Screen,
    pub headless: bool,
    /// Passed to the provisioner as the instance's environment.
    pub environment: BTreeMap<String, String>,
    pub status: SessionStatus,
    pub work_pool_id: Option<Uuid>,
    /// Set exactly when the session leaves `pending`; kept as the historical
    /// owner after the session reaches a terminal state.
    pub worker_id: Option<Uuid>,
    /// CDP WebSocket endpoint, written once by the owning worker.
    pub ws_endpoint: Option<String>,
    /// Live-view HTTP URL, written once by the owning worker.
    pub live_url: Option<String>,
    /// Provisioner kind that serves this session (`docker`, `local`, ...).
    pub provider: String,
    /// Opaque handle owned by the provisioner for cleanup.
    pub container_id: Option<String>,
    /// Opaque network handle owned by the provisioner for cleanup.
    pub container_network: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a session row. The store stamps
/// `status = pending` and `created_at = updated_at = now`.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: Uuid,
    pub browser: Browser,
    pub version: String,
    pub operating_system: OperatingSystem,
    pub screen: Screen,
    pub headless: bool,
    pub environment: BTreeMap<String, String>,
    pub work_pool_id: Option<Uuid>,
    pub provider: String,
}

impl NewSession {
    /// The session the reconciler creates when filling a pool's `min_size`:
    /// Chrome/latest/Linux, headless, default screen, the pool's
    /// `default_env` with `default_image` merged in as `BROWSER_IMAGE`.
    pub fn with_pool_defaults(pool: &WorkPool) -> Self {
        let mut environment = pool.default_env.clone();
        if let Some(image) = &pool.default_image {
            environment.insert("BROWSER_IMAGE".to_string(), image.clone());
        }
        Self {
            id: Uuid::new_v4(),
            browser: Browser::Chrome,
            version: "latest".to_string(),
            operating_system: OperatingSystem::Linux,
            screen: Screen::default(),
            headless: true,
            environment,
            work_pool_id: Some(pool.id),
            provider: pool.provider.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkPool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStrategy {
    Fifo,
}

impl QueueStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStrategy::Fifo => "fifo",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "fifo" => Ok(QueueStrategy::Fifo),
            other => Err(anyhow!("invalid queue strategy: {}", other)),
        }
    }
}

/// Pool policy. Pools group sessions and the workers that serve them; they
/// carry autoscaling, idle-expiry and duration limits, not runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkPool {
    pub id: Uuid,
    pub name: String,
    pub provider: String,
    pub min_size: i32,
    pub max_concurrency: i32,
    /// Seconds an `idle` session may sit before the reconciler expires it.
    /// Zero disables idle expiry.
    pub max_idle_time: i64,
    /// Seconds a session may run before its driver completes it.
    /// Zero means the worker falls back to [`DEFAULT_SESSION_DURATION_SECS`].
    pub max_session_duration: i64,
    pub auto_scale: bool,
    pub paused: bool,
    pub default_env: BTreeMap<String, String>,
    pub default_image: Option<String>,
    pub default_priority: i32,
    pub queue_strategy: QueueStrategy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkPool {
    /// Effective per-session duration for drivers.
    pub fn session_duration_secs(&self) -> i64 {
        if self.max_session_duration > 0 {
            self.max_session_duration
        } else {
            DEFAULT_SESSION_DURATION_SECS
        }
    }
}

/// Input for creating a pool.
#[derive(Debug, Clone)]
pub struct NewWorkPool {
    pub id: Uuid,
    pub name: String,
    pub provider: String,
    pub min_size: i32,
    pub max_concurrency: i32,
    pub max_idle_time: i64,
    pub max_session_duration: i64,
    pub auto_scale: bool,
    pub paused: bool,
    pub default_env: BTreeMap<String, String>,
    pub default_image: Option<String>,
    pub default_priority: i32,
    pub queue_strategy: QueueStrategy,
}

impl NewWorkPool {
    pub fn named(name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            provider: provider.into(),
            min_size: 0,
            max_concurrency: 10,
            max_idle_time: 0,
            max_session_duration: DEFAULT_SESSION_DURATION_SECS,
            auto_scale: false,
            paused: false,
            default_env: BTreeMap::new(),
            default_image: None,
            default_priority: 0,
            queue_strategy: QueueStrategy::Fifo,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Registration of a dispatcher process. Identity is `(pool_id, hostname)`;
/// re-registering with the same pair replaces the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    pub pool_id: Uuid,
    pub hostname: String,
    pub name: String,
    pub provider: String,
    pub max_slots: i32,
    /// Sessions currently in flight, as last reported by heartbeat.
    pub active: i32,
    pub last_beat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub paused: bool,
}

impl Worker {
    /// A worker is online iff `now − last_beat ≤ ttl`. Computed client-side;
    /// the store never writes an online flag.
    pub fn is_online(&self, ttl_secs: i64, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_beat) <= Duration::seconds(ttl_secs)
    }
}

/// Input for registering a worker.
#[derive(Debug, Clone)]
pub struct NewWorker {
    pub id: Uuid,
    pub pool_id: Uuid,
    pub hostname: String,
    pub name: String,
    pub provider: String,
    pub max_slots: i32,
    pub paused: bool,
}

impl NewWorker {
    pub fn new(
        pool_id: Uuid,
        hostname: impl Into<String>,
        name: impl Into<String>,
        provider: impl Into<String>,
        max_slots: i32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            pool_id,
            hostname: hostname.into(),
            name: name.into(),
            provider: provider.into(),
            max_slots,
            paused: false,
        }
    }
}

// ---------------------------------------------------------------------------
// SessionMetrics
// ---------------------------------------------------------------------------

/// One instance-level metrics sample. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub id: Uuid,
    pub session_id: Uuid,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub network_rx_bytes: i64,
    pub network_tx_bytes: i64,
    pub captured_at: DateTime<Utc>,
}

/// Input for a metrics sample. All numbers must be non-negative.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSessionMetrics {
    pub session_id: Uuid,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub network_rx_bytes: i64,
    pub network_tx_bytes: i64,
}

impl NewSessionMetrics {
    pub fn zeroed(session_id: Uuid) -> Self {
        Self {
            session_id,
            cpu_percent: 0.0,
            memory_mb: 0.0,
            network_rx_bytes: 0,
            network_tx_bytes: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_wire_form() {
        let all = [
            SessionStatus::Pending,
            SessionStatus::Starting,
            SessionStatus::Running,
            SessionStatus::Idle,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::TimedOut,
            SessionStatus::Crashed,
            SessionStatus::Terminated,
            SessionStatus::Expired,
        ];
        for s in all {
            assert_eq!(SessionStatus::parse(s.as_str()).unwrap(), s);
        }
    }

    #[test]
    fn status_parse_rejects_unknown() {
        assert!(SessionStatus::parse("paused").is_err());
        assert!(SessionStatus::parse("").is_err());
    }

    #[test]
    fn terminal_and_active_sets_are_disjoint() {
        let terminal = [
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::TimedOut,
            SessionStatus::Crashed,
            SessionStatus::Terminated,
            SessionStatus::Expired,
        ];
        for s in terminal {
            assert!(s.is_terminal());
            assert!(!s.is_active());
        }
        for s in [
            SessionStatus::Starting,
            SessionStatus::Running,
            SessionStatus::Idle,
        ] {
            assert!(s.is_active());
            assert!(!s.is_terminal());
        }
        assert!(!SessionStatus::Pending.is_terminal());
        assert!(!SessionStatus::Pending.is_active());
    }

    #[test]
    fn active_statuses_match_is_active() {
        for s in ACTIVE_STATUSES {
            assert!(SessionStatus::parse(s).unwrap().is_active());
        }
    }

    #[test]
    fn default_screen_is_full_hd() {
        let s = Screen::default();
        assert_eq!((s.width, s.height, s.dpi), (1920, 1080, 96));
        assert!((s.scale - 1.0).abs() < f64::EPSILON);
        assert!(s.is_valid());
    }

    #[test]
    fn screen_rejects_non_positive_dimensions() {
        let mut s = Screen::default();
        s.width = 0;
        assert!(!s.is_valid());
        s = Screen::default();
        s.scale = -1.0;
        assert!(!s.is_valid());
    }

    #[test]
    fn pool_defaults_merge_image_into_environment() {
        let mut pool_input = NewWorkPool::named("pool-a", "docker");
        pool_input
            .default_env
            .insert("TZ".to_string(), "UTC".to_string());
        let pool = WorkPool {
            id: pool_input.id,
            name: pool_input.name.clone(),
            provider: pool_input.provider.clone(),
            min_size: pool_input.min_size,
            max_concurrency: pool_input.max_concurrency,
            max_idle_time: pool_input.max_idle_time,
            max_session_duration: pool_input.max_session_duration,
            auto_scale: pool_input.auto_scale,
            paused: pool_input.paused,
            default_env: pool_input.default_env.clone(),
            default_image: Some("chrome:128".to_string()),
            default_priority: 0,
            queue_strategy: QueueStrategy::Fifo,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let s = NewSession::with_pool_defaults(&pool);
        assert_eq!(s.environment.get("TZ").map(String::as_str), Some("UTC"));
        assert_eq!(
            s.environment.get("BROWSER_IMAGE").map(String::as_str),
            Some("chrome:128")
        );
        assert_eq!(s.work_pool_id, Some(pool.id));
        assert_eq!(s.browser, Browser::Chrome);
        assert!(s.headless);
    }

    #[test]
    fn session_duration_falls_back_when_unset() {
        let mut pool = WorkPool {
            id: Uuid::new_v4(),
            name: "p".into(),
            provider: "local".into(),
            min_size: 0,
            max_concurrency: 1,
            max_idle_time: 0,
            max_session_duration: 0,
            auto_scale: false,
            paused: false,
            default_env: BTreeMap::new(),
            default_image: None,
            default_priority: 0,
            queue_strategy: QueueStrategy::Fifo,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(pool.session_duration_secs(), DEFAULT_SESSION_DURATION_SECS);
        pool.max_session_duration = 120;
        assert_eq!(pool.session_duration_secs(), 120);
    }

    #[test]
    fn worker_online_window_is_inclusive_of_ttl() {
        let now = Utc::now();
        let w = Worker {
            id: Uuid::new_v4(),
            pool_id: Uuid::new_v4(),
            hostname: "host-a".into(),
            name: "worker-host-a".into(),
            provider: "local".into(),
            max_slots: 1,
            active: 0,
            last_beat: now - Duration::seconds(WORKER_TTL_SECS),
            started_at: now,
            paused: false,
        };
        assert!(w.is_online(WORKER_TTL_SECS, now));

        let stale = Worker {
            last_beat: now - Duration::seconds(WORKER_TTL_SECS + 1),
            ..w
        };
        assert!(!stale.is_online(WORKER_TTL_SECS, now));
    }
}
