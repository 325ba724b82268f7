use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use bgd_db::{SessionFilter, WorkPoolUpdate};
use bgd_schemas::{
    Browser, NewSession, NewWorkPool, OperatingSystem, Screen, SessionStatus, WORKER_TTL_SECS,
};

#[derive(Parser)]
#[command(name = "bgd")]
#[command(about = "BrowserGrid operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Pool commands
    Pool {
        #[command(subcommand)]
        cmd: PoolCmd,
    },

    /// Worker commands
    Worker {
        #[command(subcommand)]
        cmd: WorkerCmd,
    },

    /// Session commands
    Session {
        #[command(subcommand)]
        cmd: SessionCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[derive(Subcommand)]
enum PoolCmd {
    /// Create a pool and print its id.
    Create {
        #[arg(long)]
        name: String,

        #[arg(long, default_value = "docker")]
        provider: String,

        #[arg(long, default_value_t = 0)]
        min_size: i32,

        #[arg(long, default_value_t = 10)]
        max_concurrency: i32,

        /// Seconds an idle session may sit before expiry (0 disables).
        #[arg(long, default_value_t = 0)]
        max_idle_time: i64,

        /// Seconds a session may run (0 means the worker default).
        #[arg(long, default_value_t = 1800)]
        max_session_duration: i64,

        #[arg(long)]
        auto_scale: bool,

        /// Default image, merged into sessions as BROWSER_IMAGE.
        #[arg(long)]
        image: Option<String>,
    },

    List,

    Get {
        id: Uuid,
    },

    /// Update pool policy fields.
    Update {
        id: Uuid,

        #[arg(long)]
        min_size: Option<i32>,

        #[arg(long)]
        max_concurrency: Option<i32>,

        #[arg(long)]
        max_idle_time: Option<i64>,

        #[arg(long)]
        max_session_duration: Option<i64>,

        #[arg(long)]
        auto_scale: Option<bool>,

        #[arg(long)]
        paused: Option<bool>,
    },

    /// Stop all scheduling on a pool: paused=true, auto_scale=false, min_size=0.
    Drain {
        id: Uuid,
    },

    Delete {
        id: Uuid,
    },
}

#[derive(Subcommand)]
enum WorkerCmd {
    /// List workers, optionally only the ones currently online.
    List {
        #[arg(long)]
        pool: Option<Uuid>,

        #[arg(long)]
        online: bool,
    },

    /// Pause or resume a worker's dequeueing.
    Pause {
        id: Uuid,

        #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
        paused: bool,
    },

    /// Remove a worker registration.
    Delete {
        id: Uuid,
    },
}

#[derive(Subcommand)]
enum SessionCmd {
    /// Submit a session request and print its id.
    Create {
        #[arg(long)]
        pool: Uuid,

        #[arg(long, default_value = "chrome")]
        browser: String,

        #[arg(long, default_value = "latest")]
        version: String,

        #[arg(long, default_value = "linux")]
        os: String,

        #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
        headless: bool,

        /// Environment entries as KEY=VALUE (repeatable).
        #[arg(long = "env")]
        env: Vec<String>,
    },

    List {
        #[arg(long)]
        pool: Option<Uuid>,

        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    Get {
        id: Uuid,
    },

    /// Recent metrics samples for a session.
    Metrics {
        id: Uuid,

        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let cli = Cli::parse();

    let pool = bgd_db::connect_from_env().await?;

    match cli.cmd {
        Commands::Db { cmd } => match cmd {
            DbCmd::Status => {
                let s = bgd_db::status(&pool).await?;
                println!("db_ok={} has_sessions_table={}", s.ok, s.has_sessions_table);
            }
            DbCmd::Migrate => {
                bgd_db::migrate(&pool).await?;
                println!("migrations_applied=true");
            }
        },

        Commands::Pool { cmd } => match cmd {
            PoolCmd::Create {
                name,
                provider,
                min_size,
                max_concurrency,
                max_idle_time,
                max_session_duration,
                auto_scale,
                image,
            } => {
                let mut input = NewWorkPool::named(name, provider);
                input.min_size = min_size;
                input.max_concurrency = max_concurrency;
                input.max_idle_time = max_idle_time;
                input.max_session_duration = max_session_duration;
                input.auto_scale = auto_scale;
                input.default_image = image;

                let created = bgd_db::create_work_pool(&pool, &input).await?;
                println!("pool_id={}", created.id);
                println!("name={}", created.name);
            }
            PoolCmd::List => {
                for p in bgd_db::list_work_pools(&pool, None).await? {
                    println!(
                        "{} name={} provider={} min_size={} max_concurrency={} auto_scale={} paused={}",
                        p.id, p.name, p.provider, p.min_size, p.max_concurrency, p.auto_scale,
                        p.paused
                    );
                }
            }
            PoolCmd::Get { id } => {
                let p = bgd_db::get_work_pool(&pool, id).await?;
                println!("{}", serde_json::to_string_pretty(&p)?);
            }
            PoolCmd::Update {
                id,
                min_size,
                max_concurrency,
                max_idle_time,
                max_session_duration,
                auto_scale,
                paused,
            } => {
                let update = WorkPoolUpdate {
                    min_size,
                    max_concurrency,
                    max_idle_time,
                    max_session_duration,
                    auto_scale,
                    paused,
                    ..WorkPoolUpdate::default()
                };
                let p = bgd_db::update_work_pool(&pool, id, &update).await?;
                println!("updated={}", p.id);
            }
            PoolCmd::Drain { id } => {
                bgd_db::drain_work_pool(&pool, id).await?;
                println!("drained={id}");
            }
            PoolCmd::Delete { id } => {
                bgd_db::delete_work_pool(&pool, id).await?;
                println!("deleted={id}");
            }
        },

        Commands::Worker { cmd } => match cmd {
            WorkerCmd::List { pool: pool_id, online } => {
                let workers =
                    bgd_db::list_workers(&pool, pool_id, online, WORKER_TTL_SECS).await?;
                for w in workers {
                    println!(
                        "{} pool={} hostname={} slots={} active={} paused={} last_beat={}",
                        w.id, w.pool_id, w.hostname, w.max_slots, w.active, w.paused, w.last_beat
                    );
                }
            }
            WorkerCmd::Pause { id, paused } => {
                bgd_db::pause_worker(&pool, id, paused).await?;
                println!("worker={id} paused={paused}");
            }
            WorkerCmd::Delete { id } => {
                bgd_db::delete_worker(&pool, id).await?;
                println!("deleted={id}");
            }
        },

        Commands::Session { cmd } => match cmd {
            SessionCmd::Create {
                pool: pool_id,
                browser,
                version,
                os,
                headless,
                env,
            } => {
                let target = bgd_db::get_work_pool(&pool, pool_id).await?;
                let mut input = NewSession::with_pool_defaults(&target);
                input.browser = Browser::parse(&browser)?;
                input.version = version;
                input.operating_system = OperatingSystem::parse(&os)?;
                input.screen = Screen::default();
                input.headless = headless;
                for entry in env {
                    let (k, v) = entry
                        .split_once('=')
                        .ok_or_else(|| anyhow!("--env expects KEY=VALUE, got '{entry}'"))?;
                    input.environment.insert(k.to_string(), v.to_string());
                }

                let s = bgd_db::create_session(&pool, &input).await?;
                println!("session_id={}", s.id);
                println!("status={}", s.status.as_str());
            }
            SessionCmd::List { pool: pool_id, status, limit } => {
                let filter = SessionFilter {
                    status: status.as_deref().map(SessionStatus::parse).transpose()?,
                    work_pool_id: pool_id,
                    since: None,
                    limit: Some(limit),
                };
                for s in bgd_db::list_sessions(&pool, &filter).await? {
                    println!(
                        "{} status={} pool={} worker={} created_at={}",
                        s.id,
                        s.status.as_str(),
                        s.work_pool_id.map(|p| p.to_string()).unwrap_or_default(),
                        s.worker_id.map(|w| w.to_string()).unwrap_or_default(),
                        s.created_at
                    );
                }
            }
            SessionCmd::Get { id } => {
                let s = bgd_db::get_session(&pool, id).await?;
                println!("{}", serde_json::to_string_pretty(&s)?);
            }
            SessionCmd::Metrics { id, limit } => {
                for m in bgd_db::list_session_metrics(&pool, id, limit).await? {
                    println!(
                        "{} cpu_percent={:.2} memory_mb={:.1} rx={} tx={}",
                        m.captured_at, m.cpu_percent, m.memory_mb, m.network_rx_bytes,
                        m.network_tx_bytes
                    );
                }
            }
        },
    }

    Ok(())
}
