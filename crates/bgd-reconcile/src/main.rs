//! bgd-reconciler entry point.
//!
//! One reconcile loop per process: scale-up, idle expiry and terminal
//! retention for every pool in the store. Intentionally thin — the loop
//! itself lives in the library so tests can drive single ticks.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use bgd_reconcile::{Reconciler, ReconcilerConfig};
use bgd_schemas::WORKER_TTL_SECS;

#[derive(Parser)]
#[command(name = "bgd-reconciler")]
#[command(about = "BrowserGrid pool reconciler", long_about = None)]
struct Args {
    /// Backing store URL.
    #[arg(long = "db", env = bgd_db::ENV_DB_URL)]
    db_url: String,

    /// Seconds between reconcile ticks.
    #[arg(long, default_value_t = 30)]
    tick_interval: u64,

    /// Seconds terminal sessions are retained before deletion.
    #[arg(long, default_value_t = 24 * 60 * 60)]
    retention: i64,

    /// Scale on pool policy alone, ignoring online worker slots.
    #[arg(long)]
    coarse: bool,

    /// Worker liveness window in seconds.
    #[arg(long, default_value_t = WORKER_TTL_SECS)]
    worker_ttl: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist — production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let args = Args::parse();
    let db = bgd_db::connect(&args.db_url).await?;

    let config = ReconcilerConfig {
        tick_interval: Duration::from_secs(args.tick_interval),
        retention_secs: args.retention,
        strict_capacity: !args.coarse,
        worker_ttl_secs: args.worker_ttl,
    };
    let reconciler = Reconciler::new(db, config);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    info!("bgd-reconciler running");
    reconciler.run(shutdown_rx).await;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
