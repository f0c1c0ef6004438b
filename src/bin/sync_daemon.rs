use clap::Parser;
use eyre::{eyre, Result};
use fs2::FileExt;
use osm_changeset_sync::config::Config;
use osm_changeset_sync::replication::ReplicationClient;
use osm_changeset_sync::scheduler::Scheduler;
use osm_changeset_sync::{db, spawn_signal_handler};
use std::fs::OpenOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "sync-daemon",
    version,
    about = "Keeps the local changeset store synchronized with the OSM replication feed"
)]
struct Args {
    /// Run a single synchronization pass (catch-up/backfill/gaps plus
    /// retries) and exit instead of following the tip.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let cfg = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level)),
        )
        .init();

    tracing::info!(
        base_url = %cfg.base_url,
        state_url = %cfg.state_url,
        db = %cfg.redacted_db_url(),
        num_workers = cfg.num_workers,
        batch_size = cfg.batch_size,
        queue_size = cfg.queue_size,
        throttle_ms = cfg.throttle_delay.as_millis() as u64,
        polling_interval_s = cfg.polling_interval.as_secs(),
        max_retries = cfg.max_retries,
        once = args.once,
        "sync daemon starting"
    );

    // Single-instance guard: two daemons ingesting into the same store would
    // race the sequence table.
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&cfg.lock_file)
        .map_err(|e| eyre!("failed to open lock file {}: {e}", cfg.lock_file.display()))?;
    lock_file.try_lock_exclusive().map_err(|e| {
        eyre!(
            "daemon already running or lock unavailable ({}): {e}",
            cfg.lock_file.display()
        )
    })?;
    // Keep file handle alive.
    let _lock_guard = lock_file;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let pool = db::connect(&cfg).await?;
    db::ensure_schema(&pool).await?;

    let client = Arc::new(ReplicationClient::new(&cfg, cancel.clone())?);
    let scheduler = Scheduler::new(cfg, pool.clone(), client, cancel.clone(), args.once);
    scheduler.run().await?;

    pool.close().await;
    tracing::info!("sync daemon exiting");
    Ok(())
}
