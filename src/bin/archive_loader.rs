use chrono::{DateTime, NaiveDate, Utc};
use clap::Parser;
use eyre::{eyre, Result};
use osm_changeset_sync::config::Config;
use osm_changeset_sync::parser::{parse_datetime, DateWindow};
use osm_changeset_sync::{archive, db, spawn_signal_handler};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "archive-loader",
    version,
    about = "One-shot import of a compressed changeset archive into the local store"
)]
struct Args {
    /// Input changeset archive (.osm.bz2).
    #[arg(long, env = "LOADER_CHANGESET_FILE")]
    file: PathBuf,

    /// Keep only changesets created at or after this instant
    /// (RFC 3339 or YYYY-MM-DD).
    #[arg(long, value_parser = parse_date_arg)]
    from: Option<DateTime<Utc>>,

    /// Keep only changesets created at or before this instant
    /// (RFC 3339 or YYYY-MM-DD).
    #[arg(long, value_parser = parse_date_arg)]
    to: Option<DateTime<Utc>>,
}

fn parse_date_arg(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Some(dt) = parse_datetime(raw) {
        return Ok(dt);
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(DateTime::from_naive_utc_and_offset(midnight, Utc));
        }
    }
    Err(format!("expected RFC 3339 timestamp or YYYY-MM-DD, got '{raw}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let cfg = Config::from_env_archive()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level)),
        )
        .init();

    if !args.file.is_file() {
        return Err(eyre!("changeset file not found: {}", args.file.display()));
    }

    tracing::info!(
        file = %args.file.display(),
        db = %cfg.redacted_db_url(),
        num_workers = cfg.num_workers,
        batch_size = cfg.batch_size,
        queue_size = cfg.queue_size,
        buffer_size = cfg.buffer_size,
        retention_days = cfg.retention_days,
        from = ?args.from,
        to = ?args.to,
        "archive loader starting"
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let pool = db::connect(&cfg).await?;
    db::ensure_schema(&pool).await?;

    let window = DateWindow {
        from: args.from,
        to: args.to,
    };

    let started = std::time::Instant::now();
    let summary = archive::load_archive(&cfg, &pool, &args.file, window, cancel.clone()).await?;
    pool.close().await;

    tracing::info!(
        parsed = summary.parsed,
        queued = summary.queued,
        skipped = summary.skipped,
        inserted = summary.inserted,
        batches = summary.batches,
        failed_batches = summary.failed_batches,
        elapsed_s = started.elapsed().as_secs(),
        "archive load complete"
    );

    if summary.failed_batches > 0 {
        return Err(eyre!(
            "{} batches failed to write; re-run after resolving the store errors",
            summary.failed_batches
        ));
    }

    Ok(())
}
