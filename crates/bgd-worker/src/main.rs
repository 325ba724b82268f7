//! bgd-worker entry point.
//!
//! Thin by design: parse flags, register drivers into the factory, resolve
//! the provisioner, connect and register, then hand off to the runtime
//! loop. Startup failures (unreachable store, unknown provider, invalid
//! pool) exit non-zero; graceful shutdown exits 0.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::info;
use uuid::Uuid;

use bgd_provision::{register_global, LocalDriver};
use bgd_worker::{WorkerConfig, WorkerRuntime};

#[derive(Parser)]
#[command(name = "bgd-worker")]
#[command(about = "BrowserGrid session worker", long_about = None)]
struct Args {
    /// Target pool id; if absent the worker attaches to default-<provider>.
    #[arg(long)]
    pool: Option<Uuid>,

    /// Worker display name (default: worker-<hostname>).
    #[arg(long)]
    name: Option<String>,

    /// Provisioner kind.
    #[arg(long, default_value = "docker")]
    provider: String,

    /// Max concurrent sessions.
    #[arg(long, default_value_t = 1)]
    concurrency: i32,

    /// Backing store URL.
    #[arg(long = "db", env = bgd_db::ENV_DB_URL)]
    db_url: String,

    /// Poll tick, e.g. "10s", "500ms" or plain seconds.
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    poll_interval: Duration,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist — production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let args = Args::parse();

    // Driver registration happens once, before any lookup; the factory is
    // read-only from here on.
    register_global(Arc::new(LocalDriver::default()))
        .map_err(|e| anyhow!("registering local driver: {e}"))?;

    let provisioner =
        bgd_provision::global_get(&args.provider).map_err(|e| anyhow!("{e}"))?;

    let db = bgd_db::connect(&args.db_url)
        .await
        .context("backing store unreachable")?;

    let config = WorkerConfig {
        pool_id: args.pool,
        name: args.name,
        provider: args.provider,
        max_slots: args.concurrency,
        poll_interval: args.poll_interval,
        ..WorkerConfig::default()
    };

    let runtime = Arc::new(WorkerRuntime::connect(db, provisioner, config).await?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    spawn_signal_listener(shutdown_tx)?;

    info!(worker = %runtime.worker_id(), "bgd-worker running");
    runtime.run(shutdown_rx).await?;

    info!("bgd-worker stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// Flip the shutdown flag on SIGINT or SIGTERM.
#[cfg(unix)]
fn spawn_signal_listener(tx: tokio::sync::watch::Sender<bool>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        let _ = tx.send(true);
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_signal_listener(tx: tokio::sync::watch::Sender<bool>) -> Result<()> {
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = tx.send(true);
    });
    Ok(())
}

/// Parse "10s", "500ms", "2m" or plain seconds.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (value, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: u64 = value
        .parse()
        .map_err(|_| format!("invalid duration '{s}'"))?;
    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" | "" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(format!("unknown duration unit '{other}' in '{s}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse_with_units() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn bare_numbers_are_seconds() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn garbage_durations_are_rejected() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10 parsecs").is_err());
        assert!(parse_duration("-5s").is_err());
    }
}
