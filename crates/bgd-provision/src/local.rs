//! Reference `local` driver: runs each session as a headless Chromium child
//! process on the worker host.
//!
//! The CDP endpoint is discovered through the browser's own HTTP debug
//! surface (`/json/version`), which doubles as the health probe. The
//! live-view URL is the DevTools frontend served on the same port. Metrics
//! are best-effort: resident memory from `/proc` where available, zeros
//! otherwise.
//!
//! This driver exists to exercise the full Provisioner contract without a
//! container daemon; production deployments plug a sandboxing driver into
//! the same factory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, warn};
use uuid::Uuid;

use bgd_schemas::{NewSessionMetrics, Session};

use crate::{Endpoints, Provisioner};

pub const ENV_BROWSER_BINARY: &str = "BROWSER_BINARY";

/// Well-known Chromium/Chrome install locations, probed in order when
/// neither the config nor `BROWSER_BINARY` names a binary.
const BINARY_CANDIDATES: [&str; 5] = [
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/opt/google/chrome/chrome",
];

#[derive(Debug, Clone)]
pub struct LocalDriverConfig {
    /// Browser binary; falls back to `BROWSER_BINARY` and then to well-known
    /// install locations.
    pub browser_binary: Option<PathBuf>,
    /// Root directory for per-session profile dirs.
    pub data_root: PathBuf,
    /// How long `start` waits for the CDP surface to come up.
    pub health_timeout: Duration,
}

impl Default for LocalDriverConfig {
    fn default() -> Self {
        Self {
            browser_binary: None,
            data_root: std::env::temp_dir().join("browsergrid"),
            health_timeout: Duration::from_secs(10),
        }
    }
}

struct LocalInstance {
    child: Child,
    pid: u32,
    port: u16,
    ws_url: String,
    live_url: String,
    data_dir: PathBuf,
}

/// Local-process provisioner. Thread-safe: the instance table is behind a
/// mutex that is never held across an await point.
pub struct LocalDriver {
    config: LocalDriverConfig,
    client: reqwest::Client,
    instances: Mutex<HashMap<Uuid, LocalInstance>>,
}

impl Default for LocalDriver {
    fn default() -> Self {
        Self::new(LocalDriverConfig::default())
    }
}

impl LocalDriver {
    pub fn new(config: LocalDriverConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_default();
        Self {
            config,
            client,
            instances: Mutex::new(HashMap::new()),
        }
    }

    fn lookup(&self, id: Uuid) -> Option<(u16, String, String, u32)> {
        let map = self.instances.lock().expect("local driver lock poisoned");
        map.get(&id)
            .map(|i| (i.port, i.ws_url.clone(), i.live_url.clone(), i.pid))
    }

    /// Kill and forget the instance for a session, if any. Returns whether
    /// an instance existed.
    async fn teardown(&self, id: Uuid) -> bool {
        let inst = {
            let mut map = self.instances.lock().expect("local driver lock poisoned");
            map.remove(&id)
        };
        let Some(mut inst) = inst else { return false };

        if let Err(e) = inst.child.start_kill() {
            warn!(session = %id, error = %e, "killing browser process failed");
        }
        let _ = inst.child.wait().await;
        if let Err(e) = tokio::fs::remove_dir_all(&inst.data_dir).await {
            debug!(session = %id, error = %e, "profile dir cleanup failed");
        }
        true
    }

    async fn probe_version(&self, port: u16) -> Result<serde_json::Value> {
        let url = format!("http://127.0.0.1:{port}/json/version");
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("CDP probe {url} unreachable"))?
            .error_for_status()
            .with_context(|| format!("CDP probe {url} returned error status"))?;
        resp.json::<serde_json::Value>()
            .await
            .context("CDP /json/version returned invalid JSON")
    }

    /// Poll `/json/version` until the browser answers or the health timeout
    /// elapses, returning the advertised WebSocket debugger URL.
    async fn wait_for_cdp(&self, port: u16) -> Result<String> {
        let deadline = tokio::time::Instant::now() + self.config.health_timeout;
        loop {
            match self.probe_version(port).await {
                Ok(version) => {
                    let ws = version
                        .get("webSocketDebuggerUrl")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| {
                            anyhow!("/json/version carries no webSocketDebuggerUrl")
                        })?;
                    return Ok(ws.to_string());
                }
                Err(e) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(e.context(format!(
                            "browser did not expose CDP on port {port} within {:?}",
                            self.config.health_timeout
                        )));
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}

#[async_trait]
impl Provisioner for LocalDriver {
    async fn start(&self, session: &mut Session) -> Result<Endpoints> {
        // Idempotency per session id: a session this driver already runs
        // returns its current endpoints while the instance is healthy.
        if let Some((port, ws_url, live_url, _pid)) = self.lookup(session.id) {
            if self.probe_version(port).await.is_ok() {
                session.ws_endpoint = Some(ws_url.clone());
                session.live_url = Some(live_url.clone());
                return Ok(Endpoints { ws_url, live_url });
            }
            // Stale instance: tear down and start fresh.
            self.teardown(session.id).await;
        }

        let binary = resolve_binary(&self.config)?;
        let port = pick_free_port()?;
        let data_dir = self.config.data_root.join(format!("session-{}", session.id));
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("create profile dir {}", data_dir.display()))?;

        let mut cmd = Command::new(&binary);
        cmd.args(build_args(session, port, &data_dir))
            .envs(session.environment.iter())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn browser binary {}", binary.display()))?;
        let pid = child.id().unwrap_or_default();

        let ws_url = match self.wait_for_cdp(port).await {
            Ok(ws) => ws,
            Err(e) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                let _ = tokio::fs::remove_dir_all(&data_dir).await;
                return Err(e.context(format!("start failed for session {}", session.id)));
            }
        };
        let live_url = format!("http://127.0.0.1:{port}");

        session.container_id = Some(pid.to_string());
        session.container_network = None;
        session.ws_endpoint = Some(ws_url.clone());
        session.live_url = Some(live_url.clone());

        self.instances
            .lock()
            .expect("local driver lock poisoned")
            .insert(
                session.id,
                LocalInstance {
                    child,
                    pid,
                    port,
                    ws_url: ws_url.clone(),
                    live_url: live_url.clone(),
                    data_dir,
                },
            );

        debug!(session = %session.id, port, pid, "local browser started");
        Ok(Endpoints { ws_url, live_url })
    }

    async fn stop(&self, session: &Session) -> Result<()> {
        if !self.teardown(session.id).await {
            debug!(session = %session.id, "stop: no local instance, treating as already stopped");
        }
        Ok(())
    }

    async fn health_check(&self, session: &Session) -> Result<()> {
        let port = match self.lookup(session.id) {
            Some((port, ..)) => port,
            None => session
                .ws_endpoint
                .as_deref()
                .and_then(port_from_ws_url)
                .ok_or_else(|| {
                    anyhow!("session {} has no known CDP endpoint to probe", session.id)
                })?,
        };
        self.probe_version(port).await.map(|_| ())
    }

    async fn get_metrics(&self, session: &Session) -> Result<NewSessionMetrics> {
        let pid = match self.lookup(session.id) {
            Some((.., pid)) => Some(pid),
            None => session
                .container_id
                .as_deref()
                .and_then(|s| s.parse::<u32>().ok()),
        };

        let mut metrics = NewSessionMetrics::zeroed(session.id);
        if let Some(pid) = pid {
            if let Some(rss_mb) = read_rss_mb(pid) {
                metrics.memory_mb = rss_mb;
            }
        }
        Ok(metrics)
    }

    fn kind(&self) -> &str {
        "local"
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn resolve_binary(config: &LocalDriverConfig) -> Result<PathBuf> {
    if let Some(p) = &config.browser_binary {
        return Ok(p.clone());
    }
    if let Ok(p) = std::env::var(ENV_BROWSER_BINARY) {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }
    for candidate in BINARY_CANDIDATES {
        if Path::new(candidate).exists() {
            return Ok(PathBuf::from(candidate));
        }
    }
    bail!(
        "no browser binary found; set {} or install one of: {}",
        ENV_BROWSER_BINARY,
        BINARY_CANDIDATES.join(", ")
    );
}

/// Bind port 0 and let the kernel pick. The listener is dropped before the
/// browser binds; a lost race surfaces as a start failure on the next probe.
fn pick_free_port() -> Result<u16> {
    let listener =
        std::net::TcpListener::bind(("127.0.0.1", 0)).context("no free local port")?;
    Ok(listener.local_addr().context("local_addr on probe socket")?.port())
}

fn build_args(session: &Session, port: u16, data_dir: &Path) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={port}"),
        "--remote-debugging-address=127.0.0.1".to_string(),
        format!("--user-data-dir={}", data_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-gpu".to_string(),
        // Required when running as root / inside unprivileged sandboxes.
        "--no-sandbox".to_string(),
        format!("--window-size={},{}", session.screen.width, session.screen.height),
        format!("--force-device-scale-factor={}", session.screen.scale),
    ];
    if session.headless {
        args.push("--headless=new".to_string());
    }
    args.push("about:blank".to_string());
    args
}

/// Extract the port from a CDP WebSocket URL
/// (`ws://127.0.0.1:9222/devtools/browser/<id>`).
fn port_from_ws_url(url: &str) -> Option<u16> {
    let rest = url.strip_prefix("ws://").or_else(|| url.strip_prefix("wss://"))?;
    let authority = rest.split('/').next()?;
    let port = authority.rsplit(':').next()?;
    port.parse().ok()
}

/// Resident set size of a process in MB, from `/proc/<pid>/status`.
/// Returns `None` off Linux or when the process is gone.
fn read_rss_mb(pid: u32) -> Option<f64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: f64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb / 1024.0);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use bgd_schemas::{Browser, OperatingSystem, Screen, SessionStatus};
    use chrono::Utc;

    fn make_session(headless: bool) -> Session {
        Session {
            id: Uuid::new_v4(),
            browser: Browser::Chrome,
            version: "latest".into(),
            operating_system: OperatingSystem::Linux,
            screen: Screen::default(),
            headless,
            environment: BTreeMap::new(),
            status: SessionStatus::Starting,
            work_pool_id: None,
            worker_id: None,
            ws_endpoint: None,
            live_url: None,
            provider: "local".into(),
            container_id: None,
            container_network: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn args_carry_port_profile_and_geometry() {
        let s = make_session(true);
        let args = build_args(&s, 9333, Path::new("/tmp/bg/profile"));
        assert!(args.contains(&"--remote-debugging-port=9333".to_string()));
        assert!(args.contains(&"--user-data-dir=/tmp/bg/profile".to_string()));
        assert!(args.contains(&"--window-size=1920,1080".to_string()));
        assert!(args.contains(&"--headless=new".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("about:blank"));
    }

    #[test]
    fn headful_sessions_omit_headless_flag() {
        let s = make_session(false);
        let args = build_args(&s, 9333, Path::new("/tmp/p"));
        assert!(!args.iter().any(|a| a.starts_with("--headless")));
    }

    #[test]
    fn ws_url_port_extraction() {
        assert_eq!(
            port_from_ws_url("ws://127.0.0.1:9222/devtools/browser/abc"),
            Some(9222)
        );
        assert_eq!(port_from_ws_url("wss://10.0.0.2:33061/devtools"), Some(33061));
        assert_eq!(port_from_ws_url("http://127.0.0.1:9222/"), None);
        assert_eq!(port_from_ws_url("ws://nohost/devtools"), None);
    }

    #[test]
    fn pick_free_port_returns_nonzero() {
        let port = pick_free_port().unwrap();
        assert!(port > 0);
    }

    #[tokio::test]
    async fn stop_without_instance_is_idempotent() {
        let driver = LocalDriver::default();
        let s = make_session(true);
        driver.stop(&s).await.unwrap();
        driver.stop(&s).await.unwrap();
    }

    #[tokio::test]
    async fn health_check_without_endpoint_fails() {
        let driver = LocalDriver::default();
        let s = make_session(true);
        assert!(driver.health_check(&s).await.is_err());
    }
}
