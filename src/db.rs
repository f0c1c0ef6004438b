use crate::config::Config;
use crate::model::SequenceStatus;
use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use std::time::Duration;

/// Build the connection pool: capped connections, and a server-side
/// statement timeout applied to every connection as it joins the pool.
pub async fn connect(cfg: &Config) -> Result<PgPool> {
    let statement_timeout_ms = cfg.statement_timeout.as_millis() as u64;

    let pool = PgPoolOptions::new()
        .max_connections(cfg.max_db_connections)
        .acquire_timeout(Duration::from_secs(30))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                let stmt = format!("SET statement_timeout = '{statement_timeout_ms}ms'");
                conn.execute(stmt.as_str()).await?;
                Ok(())
            })
        })
        .connect(&cfg.db_url)
        .await
        .wrap_err_with(|| format!("failed to connect to {}", cfg.redacted_db_url()))?;

    Ok(pool)
}

/// Apply the idempotent bootstrap DDL.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(include_str!("../schema.sql"))
        .execute(pool)
        .await
        .wrap_err("schema bootstrap failed")?;
    Ok(())
}

/// The backfill cutoff: the most recent closed_at already present.
pub async fn most_recent_closed_at(pool: &PgPool) -> Result<Option<DateTime<Utc>>> {
    let max: Option<DateTime<Utc>> = sqlx::query_scalar("SELECT MAX(closed_at) FROM changesets")
        .fetch_one(pool)
        .await
        .wrap_err("cutoff date query failed")?;
    Ok(max)
}

/// Record a sequence's state transition. Terminal transitions also refresh
/// the legacy metadata row (monotonic; never regresses).
pub async fn mark_sequence(
    pool: &PgPool,
    sequence: u64,
    status: SequenceStatus,
    error_message: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sequences (sequence_number, status, error_message, ingested_at)
        VALUES ($1, $2, $3, now())
        ON CONFLICT (sequence_number) DO UPDATE
        SET status = EXCLUDED.status,
            error_message = EXCLUDED.error_message,
            ingested_at = now()
        "#,
    )
    .bind(sequence as i64)
    .bind(status.as_str())
    .bind(error_message)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("failed to mark sequence {sequence} {status}"))?;

    if status.is_terminal() {
        sqlx::query(
            r#"
            INSERT INTO metadata (id, state, timestamp)
            VALUES (1, $1, now())
            ON CONFLICT (id) DO UPDATE
            SET state = EXCLUDED.state, timestamp = now()
            WHERE metadata.state IS NULL
               OR metadata.state::bigint < EXCLUDED.state::bigint
            "#,
        )
        .bind(sequence.to_string())
        .execute(pool)
        .await
        .wrap_err("failed to refresh metadata row")?;
    }

    Ok(())
}

/// Lowest and highest sequence with a terminal row, if any.
pub async fn terminal_bounds(pool: &PgPool) -> Result<Option<(u64, u64)>> {
    let row: (Option<i64>, Option<i64>) = sqlx::query_as(
        "SELECT MIN(sequence_number), MAX(sequence_number)
         FROM sequences WHERE status IN ('backfilled', 'empty')",
    )
    .fetch_one(pool)
    .await
    .wrap_err("terminal bounds query failed")?;

    match row {
        (Some(lo), Some(hi)) => Ok(Some((lo as u64, hi as u64))),
        _ => Ok(None),
    }
}

/// Sequence numbers in [lo, hi] whose row is missing or non-terminal.
pub async fn sequence_gaps(pool: &PgPool, lo: u64, hi: u64) -> Result<Vec<u64>> {
    if lo > hi {
        return Ok(Vec::new());
    }
    let rows: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT gs.seq
        FROM generate_series($1::bigint, $2::bigint) AS gs(seq)
        LEFT JOIN sequences s ON s.sequence_number = gs.seq
        WHERE s.sequence_number IS NULL
           OR s.status NOT IN ('backfilled', 'empty')
        ORDER BY gs.seq
        "#,
    )
    .bind(lo as i64)
    .bind(hi as i64)
    .fetch_all(pool)
    .await
    .wrap_err("gap scan failed")?;

    Ok(rows.into_iter().map(|v| v as u64).collect())
}

/// Flip `processing` rows older than the grace interval to `failed` so they
/// re-enter the retry path. Returns the reclaimed sequence numbers.
pub async fn reclaim_stale_processing(pool: &PgPool, grace: Duration) -> Result<Vec<u64>> {
    let rows: Vec<i64> = sqlx::query_scalar(
        r#"
        UPDATE sequences
        SET status = 'failed',
            error_message = 'processing timed out; reclaimed',
            ingested_at = now()
        WHERE status = 'processing'
          AND ingested_at < now() - make_interval(secs => $1)
        RETURNING sequence_number
        "#,
    )
    .bind(grace.as_secs_f64())
    .fetch_all(pool)
    .await
    .wrap_err("stale processing reclaim failed")?;

    Ok(rows.into_iter().map(|v| v as u64).collect())
}
