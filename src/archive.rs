use crate::config::Config;
use crate::model::Changeset;
use crate::parser::{ChangesetReader, DateWindow};
use crate::upsert;
use bzip2::read::MultiBzDecoder;
use chrono::{DateTime, Utc};
use eyre::{eyre, Result, WrapErr};
use futures::future::join_all;
use sqlx::PgPool;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Totals from the producer side of the pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProducerTotals {
    pub parsed: u64,
    pub queued: u64,
    pub skipped: u64,
}

/// Final accounting for one archive run.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArchiveSummary {
    pub parsed: u64,
    pub queued: u64,
    pub skipped: u64,
    pub inserted: u64,
    pub batches: u64,
    pub failed_batches: u64,
}

/// Stream one compressed archive into the store.
///
/// One blocking producer thread decompresses, parses, and filters; a bounded
/// channel of batches feeds the writer tasks. Backpressure is the channel:
/// the producer blocks when the writers fall behind.
pub async fn load_archive(
    cfg: &Config,
    pool: &PgPool,
    path: &Path,
    window: DateWindow,
    cancel: CancellationToken,
) -> Result<ArchiveSummary> {
    let retention_cutoff = retention_cutoff(cfg.retention_days, Utc::now());
    if let Some(cutoff) = retention_cutoff {
        tracing::info!(%cutoff, "applying retention window");
    }

    let file = File::open(path)
        .wrap_err_with(|| format!("failed to open archive {}", path.display()))?;

    let (tx, rx) = async_channel::bounded::<Vec<Changeset>>(cfg.queue_size);

    let inserted = Arc::new(AtomicU64::new(0));
    let batches = Arc::new(AtomicU64::new(0));
    let failed_batches = Arc::new(AtomicU64::new(0));

    let mut writer_handles = Vec::with_capacity(cfg.num_workers);
    for _ in 0..cfg.num_workers {
        let rx = rx.clone();
        let pool = pool.clone();
        let cancel = cancel.clone();
        let inserted = inserted.clone();
        let batches = batches.clone();
        let failed_batches = failed_batches.clone();
        writer_handles.push(tokio::spawn(async move {
            loop {
                let batch = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(batch) => batch,
                        Err(_) => break,
                    },
                };
                match upsert::upsert_changesets(&pool, &batch).await {
                    Ok(outcome) => {
                        batches.fetch_add(1, Ordering::Relaxed);
                        inserted.fetch_add(outcome.inserted as u64, Ordering::Relaxed);
                        tracing::debug!(
                            rows = outcome.total,
                            inserted = outcome.inserted,
                            "archive batch written"
                        );
                    }
                    Err(err) => {
                        // The transaction rolled back; later batches are
                        // independent, so keep draining.
                        failed_batches.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(rows = batch.len(), error = %err, "archive batch failed");
                    }
                }
            }
        }));
    }
    drop(rx);

    let producer_cancel = cancel.clone();
    let batch_size = cfg.batch_size;
    let buffer_size = cfg.buffer_size;
    let producer = tokio::task::spawn_blocking(move || {
        let decoder = MultiBzDecoder::new(file);
        read_batches(
            decoder,
            window,
            retention_cutoff,
            batch_size,
            buffer_size,
            || producer_cancel.is_cancelled(),
            |batch| tx.send_blocking(batch).is_ok(),
        )
    });

    let producer_result = producer
        .await
        .map_err(|err| eyre!("archive producer panicked: {err}"))?;

    // Producer done and its sender dropped: writers drain the channel and
    // exit on closure. Join them before surfacing any parse error so no
    // write is lost from the report.
    join_all(writer_handles).await;

    let totals = producer_result.wrap_err("archive parse failed")?;

    Ok(ArchiveSummary {
        parsed: totals.parsed,
        queued: totals.queued,
        skipped: totals.skipped,
        inserted: inserted.load(Ordering::Relaxed),
        batches: batches.load(Ordering::Relaxed),
        failed_batches: failed_batches.load(Ordering::Relaxed),
    })
}

/// Parse the stream, filter, and hand off full batches. `emit` returning
/// false means the pipeline is gone and the read stops.
pub fn read_batches<R: Read>(
    source: R,
    window: DateWindow,
    retention_cutoff: Option<DateTime<Utc>>,
    batch_size: usize,
    buffer_size: usize,
    cancelled: impl Fn() -> bool,
    mut emit: impl FnMut(Vec<Changeset>) -> bool,
) -> Result<ProducerTotals> {
    let reader = BufReader::with_capacity(buffer_size.max(4096), source);
    let mut totals = ProducerTotals::default();
    let mut batch: Vec<Changeset> = Vec::with_capacity(batch_size.max(1));

    for item in ChangesetReader::with_window(reader, window) {
        if cancelled() {
            tracing::info!("archive read cancelled");
            return Ok(totals);
        }

        let cs = item?;
        totals.parsed += 1;

        if within_retention(&cs, retention_cutoff) {
            totals.queued += 1;
            batch.push(cs);
            if batch.len() >= batch_size.max(1) {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size.max(1)));
                if !emit(full) {
                    return Ok(totals);
                }
            }
        } else {
            totals.skipped += 1;
        }

        if totals.parsed % 10_000 == 0 {
            tracing::info!(
                parsed = totals.parsed,
                queued = totals.queued,
                skipped = totals.skipped,
                "archive progress"
            );
        }
    }

    if !batch.is_empty() {
        emit(batch);
    }

    tracing::info!(
        parsed = totals.parsed,
        queued = totals.queued,
        skipped = totals.skipped,
        "archive read complete"
    );
    Ok(totals)
}

/// Records closed before the cutoff are dropped; open records and records
/// without a box on the window pass through.
fn within_retention(cs: &Changeset, cutoff: Option<DateTime<Utc>>) -> bool {
    match (cutoff, cs.closed_at) {
        (Some(cutoff), Some(closed)) => closed >= cutoff,
        _ => true,
    }
}

fn retention_cutoff(retention_days: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if retention_days == 0 {
        return None;
    }
    Some(now - chrono::Duration::days(i64::from(retention_days)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_datetime;
    use bzip2::write::BzEncoder;
    use bzip2::Compression;
    use std::io::Write;

    const ARCHIVE_XML: &str = r#"<osm>
      <changeset id="1" created_at="2023-01-01T00:00:00Z" closed_at="2023-01-01T01:00:00Z" open="false"/>
      <changeset id="2" created_at="2024-05-01T00:00:00Z" closed_at="2024-05-01T01:00:00Z" open="false"/>
      <changeset id="3" created_at="2024-06-01T00:00:00Z" open="true"/>
    </osm>"#;

    fn bz2(data: &str) -> Vec<u8> {
        let mut encoder = BzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn reads_batches_through_bz2() {
        let compressed = bz2(ARCHIVE_XML);
        let mut seen: Vec<Vec<Changeset>> = Vec::new();

        let totals = read_batches(
            MultiBzDecoder::new(&compressed[..]),
            DateWindow::default(),
            None,
            2,
            4096,
            || false,
            |batch| {
                seen.push(batch);
                true
            },
        )
        .unwrap();

        assert_eq!(totals.parsed, 3);
        assert_eq!(totals.queued, 3);
        assert_eq!(totals.skipped, 0);
        // Batch size 2: one full batch plus the remainder.
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].len(), 2);
        assert_eq!(seen[1].len(), 1);
    }

    #[test]
    fn retention_drops_old_closed_records_only() {
        let cutoff = parse_datetime("2024-01-01T00:00:00Z");
        let compressed = bz2(ARCHIVE_XML);
        let mut kept = Vec::new();

        let totals = read_batches(
            MultiBzDecoder::new(&compressed[..]),
            DateWindow::default(),
            cutoff,
            10,
            4096,
            || false,
            |batch| {
                kept.extend(batch);
                true
            },
        )
        .unwrap();

        assert_eq!(totals.parsed, 3);
        assert_eq!(totals.skipped, 1);
        let ids: Vec<i64> = kept.iter().map(|cs| cs.id).collect();
        // The 2023 changeset is dropped; the open one passes.
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn date_window_filters_before_retention() {
        let window = DateWindow {
            from: parse_datetime("2024-01-01T00:00:00Z"),
            to: None,
        };
        let compressed = bz2(ARCHIVE_XML);
        let mut kept = Vec::new();

        let totals = read_batches(
            MultiBzDecoder::new(&compressed[..]),
            window,
            None,
            10,
            4096,
            || false,
            |batch| {
                kept.extend(batch);
                true
            },
        )
        .unwrap();

        // The 2023 record never leaves the parser.
        assert_eq!(totals.parsed, 2);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn closed_emit_stops_the_read() {
        let compressed = bz2(ARCHIVE_XML);
        let totals = read_batches(
            MultiBzDecoder::new(&compressed[..]),
            DateWindow::default(),
            None,
            1,
            4096,
            || false,
            |_| false,
        )
        .unwrap();
        assert_eq!(totals.queued, 1);
    }

    #[test]
    fn retention_cutoff_disabled_at_zero_days() {
        let now = parse_datetime("2024-06-01T00:00:00Z").unwrap();
        assert_eq!(retention_cutoff(0, now), None);
        assert_eq!(
            retention_cutoff(31, now),
            parse_datetime("2024-05-01T00:00:00Z")
        );
    }
}
