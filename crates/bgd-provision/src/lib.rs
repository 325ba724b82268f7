//! Provisioner seam: the pluggable driver that converts a session record
//! into a running, health-checkable sandbox with CDP endpoints.
//!
//! Drivers register into a process-wide [`ProvisionerFactory`] at init time,
//! keyed by type string; consumers (the worker runtime) look them up by the
//! session's `provider`. The factory is write-only at init and read-only
//! afterwards — it is the only process-wide mutable singleton in the system.

use anyhow::Result;
use async_trait::async_trait;

use bgd_schemas::{NewSessionMetrics, Session};

pub mod factory;
pub mod local;

pub use factory::{
    global_get, global_types, register_global, FactoryError, ProvisionerFactory,
};
pub use local::{LocalDriver, LocalDriverConfig};

/// Endpoints a healthy sandbox exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// Chrome DevTools Protocol WebSocket URL.
    pub ws_url: String,
    /// Live-view HTTP URL.
    pub live_url: String,
}

/// A pluggable sandbox driver. Implementations must be thread-safe: one
/// instance is shared by reference across all session drivers in a process.
///
/// All operations are cancellation-safe blocking points; callers own the
/// deadlines (the worker uses `health_timeout` for `start` and a short
/// probe deadline for `health_check`).
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Bring up a browser instance for the session and return its endpoints.
    ///
    /// Idempotent per session id: repeated calls for a session that is
    /// already running return its current endpoints (or fail cleanly). May
    /// mutate `container_id`, `container_network` and the endpoint fields on
    /// the in-memory session. Must fail fast if the sandbox does not become
    /// healthy within the driver's health timeout.
    async fn start(&self, session: &mut Session) -> Result<Endpoints>;

    /// Tear down the instance and every resource labelled with the session
    /// id. Idempotent: stopping a non-existent or already-stopped instance
    /// succeeds.
    async fn stop(&self, session: &Session) -> Result<()>;

    /// Cheap liveness probe against the session's CDP endpoint. Fails if the
    /// instance is gone or unresponsive.
    async fn health_check(&self, session: &Session) -> Result<()>;

    /// Instance-level resource usage. All numbers non-negative.
    async fn get_metrics(&self, session: &Session) -> Result<NewSessionMetrics>;

    /// Driver kind (`docker`, `local`, ...), the factory key.
    fn kind(&self) -> &str;
}
