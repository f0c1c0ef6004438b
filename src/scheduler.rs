use crate::config::Config;
use crate::db;
use crate::model::{Changeset, SequenceStatus};
use crate::parser::ChangesetReader;
use crate::replication::{FetchError, ReplicationClient};
use crate::retry::RetryQueue;
use crate::upsert;
use chrono::{DateTime, Utc};
use eyre::{eyre, Result, WrapErr};
use futures::future::join_all;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Range work decided at startup from the remote tip and the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialWork {
    /// Ascending catch-up from the last local tip to the remote tip.
    CatchUp { from: u64, to: u64 },
    /// Descending historical backfill; ends at the cutoff date or the floor.
    Backfill { from: u64, down_to: u64 },
    UpToDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialPlan {
    pub work: InitialWork,
    /// Range to scan for missing or non-terminal sequence rows.
    pub gap_scan: Option<(u64, u64)>,
}

/// Pure planning step: what to enqueue given the remote tip and the local
/// terminal bounds.
pub fn plan_initial(
    tip: u64,
    terminal_bounds: Option<(u64, u64)>,
    min_sequence: u64,
    start_override: Option<u64>,
) -> InitialPlan {
    match terminal_bounds {
        None => {
            let from = start_override.unwrap_or(tip);
            InitialPlan {
                work: InitialWork::Backfill {
                    from,
                    down_to: min_sequence.min(from),
                },
                gap_scan: None,
            }
        }
        Some((lo, hi)) => {
            let work = if hi < tip {
                InitialWork::CatchUp { from: hi + 1, to: tip }
            } else {
                InitialWork::UpToDate
            };
            InitialPlan {
                work,
                gap_scan: Some((lo, hi)),
            }
        }
    }
}

/// True when a descending worker has walked past everything new: the file
/// parsed to a non-empty set, nothing in it was new to the store, and every
/// record closed at or before the cutoff.
pub fn descent_reached_cutoff(
    records: &[Changeset],
    newly_inserted: usize,
    cutoff: Option<DateTime<Utc>>,
) -> bool {
    let Some(cutoff) = cutoff else {
        return false;
    };
    !records.is_empty()
        && newly_inserted == 0
        && records
            .iter()
            .all(|cs| cs.closed_at.map_or(false, |closed| closed <= cutoff))
}

/// Shared counters, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub sequences: AtomicU64,
    pub backfilled: AtomicU64,
    pub empty: AtomicU64,
    pub failures: AtomicU64,
    pub retries: AtomicU64,
    pub changesets_seen: AtomicU64,
    pub changesets_inserted: AtomicU64,
}

impl IngestStats {
    pub fn log_summary(&self) {
        tracing::info!(
            sequences = self.sequences.load(Ordering::Relaxed),
            backfilled = self.backfilled.load(Ordering::Relaxed),
            empty = self.empty.load(Ordering::Relaxed),
            failures = self.failures.load(Ordering::Relaxed),
            retries = self.retries.load(Ordering::Relaxed),
            changesets_seen = self.changesets_seen.load(Ordering::Relaxed),
            changesets_inserted = self.changesets_inserted.load(Ordering::Relaxed),
            "ingest totals"
        );
    }
}

#[derive(Debug, Clone, Copy)]
struct Job {
    sequence: u64,
    descending: bool,
    /// Re-dispatches so far; 0 on the first attempt.
    attempt: u32,
}

#[derive(Debug, Clone, Copy)]
struct FailedJob {
    sequence: u64,
    descending: bool,
    attempt: u32,
}

#[derive(Debug, Default)]
struct SequenceOutcome {
    parsed: usize,
    inserted: usize,
    reached_cutoff: bool,
}

/// The replication ingester: plans the initial ranges, runs the worker pool,
/// follows the tip, and retries failures until their budget runs out.
pub struct Scheduler {
    cfg: Config,
    pool: PgPool,
    client: Arc<ReplicationClient>,
    cancel: CancellationToken,
    stats: Arc<IngestStats>,
    once: bool,
}

impl Scheduler {
    pub fn new(
        cfg: Config,
        pool: PgPool,
        client: Arc<ReplicationClient>,
        cancel: CancellationToken,
        once: bool,
    ) -> Self {
        Self {
            cfg,
            pool,
            client,
            cancel,
            stats: Arc::new(IngestStats::default()),
            once,
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub async fn run(self) -> Result<()> {
        let tip = self
            .client
            .current_sequence()
            .await
            .map_err(|err| eyre!("failed to read replication state: {err}"))?;
        let bounds = db::terminal_bounds(&self.pool).await?;
        let cutoff = db::most_recent_closed_at(&self.pool).await?;
        let plan = plan_initial(tip, bounds, self.cfg.min_sequence, self.cfg.start_sequence);

        let gaps = match plan.gap_scan {
            Some((lo, hi)) => db::sequence_gaps(&self.pool, lo, hi).await?,
            None => Vec::new(),
        };

        tracing::info!(
            tip,
            terminal_bounds = ?bounds,
            cutoff = ?cutoff,
            work = ?plan.work,
            gaps = gaps.len(),
            once = self.once,
            "starting replication ingest"
        );

        let (tx, rx) = async_channel::bounded::<Job>(self.cfg.queue_size);
        let (fail_tx, fail_rx) = mpsc::unbounded_channel::<FailedJob>();
        let cutoff_hit = Arc::new(AtomicBool::new(false));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let feeder_done = Arc::new(AtomicBool::new(false));
        let watermark = Arc::new(AtomicU64::new(tip));

        let mut worker_handles = Vec::with_capacity(self.cfg.num_workers);
        for _ in 0..self.cfg.num_workers {
            let worker = Worker {
                pool: self.pool.clone(),
                client: self.client.clone(),
                cancel: self.cancel.clone(),
                stats: self.stats.clone(),
                cutoff,
                cutoff_hit: cutoff_hit.clone(),
                in_flight: in_flight.clone(),
                fail_tx: fail_tx.clone(),
                batch_size: self.cfg.batch_size,
            };
            worker_handles.push(tokio::spawn(worker.run(rx.clone())));
        }
        drop(fail_tx);
        drop(rx);

        let feeder_handle = tokio::spawn(run_feeder(
            plan.work,
            gaps,
            self.pool.clone(),
            tx.clone(),
            self.cancel.clone(),
            cutoff_hit.clone(),
            feeder_done.clone(),
        ));

        let retry_handle = tokio::spawn(run_retry_manager(
            self.pool.clone(),
            RetryQueue::new(self.cfg.max_retries, self.cfg.retry_interval),
            tx.clone(),
            fail_rx,
            self.cancel.clone(),
            self.stats.clone(),
            self.cfg.stale_grace,
            self.cfg.stale_scan_interval,
            self.once,
            feeder_done,
            in_flight,
        ));

        let poller_handle = if self.once {
            None
        } else {
            Some(tokio::spawn(run_tip_poller(
                self.client.clone(),
                self.pool.clone(),
                tx.clone(),
                self.cancel.clone(),
                watermark,
                self.cfg.polling_interval,
            )))
        };
        drop(tx);

        let _ = feeder_handle.await;

        if !self.once {
            // Continuous mode runs until the cancellation token trips.
            self.cancel.cancelled().await;
        }

        join_all(worker_handles).await;
        let _ = retry_handle.await;
        if let Some(handle) = poller_handle {
            let _ = handle.await;
        }

        self.stats.log_summary();
        Ok(())
    }
}

/// Enqueue the startup ranges: gap fill first, then catch-up or descent.
async fn run_feeder(
    work: InitialWork,
    gaps: Vec<u64>,
    pool: PgPool,
    tx: async_channel::Sender<Job>,
    cancel: CancellationToken,
    cutoff_hit: Arc<AtomicBool>,
    feeder_done: Arc<AtomicBool>,
) {
    if !gaps.is_empty() {
        tracing::info!(count = gaps.len(), "filling sequence gaps");
    }
    for sequence in gaps {
        if cancel.is_cancelled() {
            break;
        }
        if !dispatch(&pool, &tx, &cancel, sequence, false, 0).await {
            break;
        }
    }

    match work {
        InitialWork::CatchUp { from, to } => {
            for sequence in from..=to {
                if cancel.is_cancelled() {
                    break;
                }
                if !dispatch(&pool, &tx, &cancel, sequence, false, 0).await {
                    break;
                }
            }
        }
        InitialWork::Backfill { from, down_to } => {
            for sequence in (down_to..=from).rev() {
                if cancel.is_cancelled() || cutoff_hit.load(Ordering::SeqCst) {
                    break;
                }
                if !dispatch(&pool, &tx, &cancel, sequence, true, 0).await {
                    break;
                }
            }
        }
        InitialWork::UpToDate => {}
    }

    feeder_done.store(true, Ordering::SeqCst);
}

/// Create the pending row and hand the sequence to a worker. Returns false
/// when the pipeline is shutting down.
async fn dispatch(
    pool: &PgPool,
    tx: &async_channel::Sender<Job>,
    cancel: &CancellationToken,
    sequence: u64,
    descending: bool,
    attempt: u32,
) -> bool {
    if let Err(err) = db::mark_sequence(pool, sequence, SequenceStatus::Pending, None).await {
        tracing::error!(sequence, error = %err, "failed to mark sequence pending");
    }
    let job = Job {
        sequence,
        descending,
        attempt,
    };
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(job) => sent.is_ok(),
    }
}

/// Owns the retry heap: failed sequences come in, due retries go back out,
/// and stale `processing` rows are periodically reclaimed into the same path.
#[allow(clippy::too_many_arguments)]
async fn run_retry_manager(
    pool: PgPool,
    mut queue: RetryQueue,
    tx: async_channel::Sender<Job>,
    mut fail_rx: mpsc::UnboundedReceiver<FailedJob>,
    cancel: CancellationToken,
    stats: Arc<IngestStats>,
    stale_grace: Duration,
    stale_scan_interval: Duration,
    once: bool,
    feeder_done: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let mut stale_tick = tokio::time::interval(stale_scan_interval);
    stale_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            failed = fail_rx.recv() => {
                match failed {
                    Some(f) => note_failure(&mut queue, &stats, f),
                    None => break,
                }
            }
            _ = tick.tick() => {
                while let Some(entry) = queue.pop_due(tokio::time::Instant::now()) {
                    tracing::info!(
                        sequence = entry.sequence,
                        attempt = entry.attempts,
                        "re-dispatching failed sequence"
                    );
                    if !dispatch(&pool, &tx, &cancel, entry.sequence, entry.descending, entry.attempts).await {
                        return;
                    }
                }

                // In single-pass mode the pipeline ends once nothing is queued,
                // running, or awaiting retry; closing the channel is the stop
                // token the workers exit on.
                if once
                    && feeder_done.load(Ordering::SeqCst)
                    && in_flight.load(Ordering::SeqCst) == 0
                    && tx.is_empty()
                    && queue.is_empty()
                {
                    // Workers are idle, so any failure reports are already
                    // buffered; account for them before concluding.
                    let mut drained = false;
                    while let Ok(f) = fail_rx.try_recv() {
                        note_failure(&mut queue, &stats, f);
                        drained = true;
                    }
                    if !drained && queue.is_empty() {
                        tracing::info!("single pass complete; stopping workers");
                        tx.close();
                        break;
                    }
                }
            }
            _ = stale_tick.tick() => {
                match db::reclaim_stale_processing(&pool, stale_grace).await {
                    Ok(reclaimed) => {
                        for sequence in reclaimed {
                            tracing::warn!(sequence, "reclaimed stale processing sequence");
                            if queue.schedule(sequence, false, 0, tokio::time::Instant::now()) {
                                stats.retries.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    Err(err) => tracing::error!(error = %err, "stale processing scan failed"),
                }
            }
        }
    }
}

fn note_failure(queue: &mut RetryQueue, stats: &IngestStats, failed: FailedJob) {
    if queue.schedule(
        failed.sequence,
        failed.descending,
        failed.attempt,
        tokio::time::Instant::now(),
    ) {
        stats.retries.fetch_add(1, Ordering::Relaxed);
    } else {
        tracing::error!(
            sequence = failed.sequence,
            attempts = failed.attempt + 1,
            "retry budget exhausted; sequence left failed for operator attention"
        );
    }
}

/// Watch the remote state file and enqueue newly published sequences.
async fn run_tip_poller(
    client: Arc<ReplicationClient>,
    pool: PgPool,
    tx: async_channel::Sender<Job>,
    cancel: CancellationToken,
    watermark: Arc<AtomicU64>,
    interval: Duration,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        match client.current_sequence().await {
            Ok(tip) => {
                let last = watermark.load(Ordering::SeqCst);
                if tip > last {
                    tracing::info!(from = last + 1, to = tip, "tip advanced; enqueueing");
                    for sequence in last + 1..=tip {
                        if !dispatch(&pool, &tx, &cancel, sequence, false, 0).await {
                            return;
                        }
                        watermark.store(sequence, Ordering::SeqCst);
                    }
                }
            }
            Err(FetchError::Aborted) => break,
            Err(err) => tracing::warn!(error = %err, "tip poll failed"),
        }
    }
}

#[derive(Clone)]
struct Worker {
    pool: PgPool,
    client: Arc<ReplicationClient>,
    cancel: CancellationToken,
    stats: Arc<IngestStats>,
    cutoff: Option<DateTime<Utc>>,
    cutoff_hit: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    fail_tx: mpsc::UnboundedSender<FailedJob>,
    batch_size: usize,
}

impl Worker {
    async fn run(self, rx: async_channel::Receiver<Job>) {
        loop {
            let job = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(job) => job,
                    Err(_) => break,
                },
            };

            if job.descending && self.cutoff_hit.load(Ordering::SeqCst) {
                // Queue drain after cutoff: skip without touching the store.
                continue;
            }

            self.in_flight.fetch_add(1, Ordering::SeqCst);
            self.process(job).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn process(&self, job: Job) {
        let sequence = job.sequence;
        let started = std::time::Instant::now();

        if let Err(err) =
            db::mark_sequence(&self.pool, sequence, SequenceStatus::Processing, None).await
        {
            self.fail(job, format!("failed to mark processing: {err}")).await;
            return;
        }

        match self.client.fetch_sequence(sequence).await {
            Ok(xml) => match self.ingest(sequence, &xml, job.descending).await {
                Ok(outcome) => self.finish(job, outcome, started).await,
                Err(err) => self.fail(job, err.to_string()).await,
            },
            Err(FetchError::NotFound) => {
                // A missing file is a normal terminal outcome.
                match db::mark_sequence(&self.pool, sequence, SequenceStatus::Empty, None).await {
                    Ok(()) => {
                        self.stats.sequences.fetch_add(1, Ordering::Relaxed);
                        self.stats.empty.fetch_add(1, Ordering::Relaxed);
                        tracing::info!(sequence, "no file at sequence; marked empty");
                    }
                    Err(err) => self.fail(job, err.to_string()).await,
                }
            }
            Err(FetchError::Aborted) => {
                // Shutdown mid-fetch; the processing row is reclaimed as
                // stale on a later run.
                tracing::debug!(sequence, "fetch aborted by shutdown");
            }
            Err(err) => self.fail(job, err.to_string()).await,
        }
    }

    async fn ingest(&self, sequence: u64, xml: &[u8], descending: bool) -> Result<SequenceOutcome> {
        let mut records = Vec::new();
        for item in ChangesetReader::new(xml) {
            records.push(item.wrap_err_with(|| format!("parse error in sequence {sequence}"))?);
        }

        let mut inserted = 0usize;
        for chunk in records.chunks(self.batch_size.max(1)) {
            let outcome = upsert::upsert_changesets(&self.pool, chunk).await?;
            inserted += outcome.inserted;
        }

        let reached_cutoff = descending && descent_reached_cutoff(&records, inserted, self.cutoff);

        Ok(SequenceOutcome {
            parsed: records.len(),
            inserted,
            reached_cutoff,
        })
    }

    async fn finish(&self, job: Job, outcome: SequenceOutcome, started: std::time::Instant) {
        let sequence = job.sequence;
        let status = if outcome.inserted > 0 {
            SequenceStatus::Backfilled
        } else {
            SequenceStatus::Empty
        };

        if let Err(err) = db::mark_sequence(&self.pool, sequence, status, None).await {
            self.fail(job, format!("failed to mark {status}: {err}")).await;
            return;
        }

        self.stats.sequences.fetch_add(1, Ordering::Relaxed);
        self.stats
            .changesets_seen
            .fetch_add(outcome.parsed as u64, Ordering::Relaxed);
        self.stats
            .changesets_inserted
            .fetch_add(outcome.inserted as u64, Ordering::Relaxed);
        match status {
            SequenceStatus::Backfilled => {
                self.stats.backfilled.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.stats.empty.fetch_add(1, Ordering::Relaxed);
            }
        }

        if outcome.reached_cutoff && !self.cutoff_hit.swap(true, Ordering::SeqCst) {
            tracing::info!(sequence, "cutoff reached; draining historical descent");
        }

        tracing::info!(
            sequence,
            parsed = outcome.parsed,
            inserted = outcome.inserted,
            status = %status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sequence processed"
        );
    }

    async fn fail(&self, job: Job, message: String) {
        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        tracing::error!(sequence = job.sequence, error = %message, "sequence failed");

        if let Err(err) = db::mark_sequence(
            &self.pool,
            job.sequence,
            SequenceStatus::Failed,
            Some(&message),
        )
        .await
        {
            tracing::error!(sequence = job.sequence, error = %err, "failed to record failure");
        }

        let _ = self.fail_tx.send(FailedJob {
            sequence: job.sequence,
            descending: job.descending,
            attempt: job.attempt,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_datetime;
    use std::collections::BTreeMap;

    #[test]
    fn empty_store_plans_a_full_descent() {
        let plan = plan_initial(1000, None, 1, None);
        assert_eq!(
            plan.work,
            InitialWork::Backfill {
                from: 1000,
                down_to: 1
            }
        );
        assert_eq!(plan.gap_scan, None);
    }

    #[test]
    fn start_override_applies_only_to_descent() {
        let plan = plan_initial(1000, None, 1, Some(500));
        assert_eq!(
            plan.work,
            InitialWork::Backfill {
                from: 500,
                down_to: 1
            }
        );

        // With terminal rows the override is irrelevant.
        let plan = plan_initial(1000, Some((10, 900)), 1, Some(500));
        assert_eq!(plan.work, InitialWork::CatchUp { from: 901, to: 1000 });
    }

    #[test]
    fn behind_tip_plans_catch_up_with_gap_scan() {
        let plan = plan_initial(1000, Some((10, 950)), 1, None);
        assert_eq!(plan.work, InitialWork::CatchUp { from: 951, to: 1000 });
        assert_eq!(plan.gap_scan, Some((10, 950)));
    }

    #[test]
    fn at_tip_plans_no_range_work() {
        let plan = plan_initial(1000, Some((10, 1000)), 1, None);
        assert_eq!(plan.work, InitialWork::UpToDate);
        assert_eq!(plan.gap_scan, Some((10, 1000)));
    }

    #[test]
    fn min_sequence_bounds_the_descent() {
        let plan = plan_initial(1000, None, 800, None);
        assert_eq!(
            plan.work,
            InitialWork::Backfill {
                from: 1000,
                down_to: 800
            }
        );
    }

    fn closed_cs(id: i64, closed_at: &str) -> Changeset {
        Changeset {
            id,
            username: None,
            uid: 0,
            created_at: parse_datetime("2024-01-01T00:00:00Z").unwrap(),
            closed_at: parse_datetime(closed_at),
            open: false,
            num_changes: 1,
            comments_count: 0,
            bbox: None,
            tags: BTreeMap::new(),
            comments: Vec::new(),
        }
    }

    #[test]
    fn cutoff_requires_all_old_and_nothing_new() {
        let cutoff = parse_datetime("2024-05-01T00:00:00Z");
        let old = vec![
            closed_cs(1, "2024-04-01T00:00:00Z"),
            closed_cs(2, "2024-05-01T00:00:00Z"),
        ];

        assert!(descent_reached_cutoff(&old, 0, cutoff));
        // Anything newly inserted means the descent is still finding data.
        assert!(!descent_reached_cutoff(&old, 1, cutoff));

        // A record newer than the cutoff keeps the descent going.
        let mixed = vec![
            closed_cs(1, "2024-04-01T00:00:00Z"),
            closed_cs(2, "2024-05-02T00:00:00Z"),
        ];
        assert!(!descent_reached_cutoff(&mixed, 0, cutoff));

        // An open record has no closed_at and never satisfies the cutoff.
        let mut open = closed_cs(3, "2024-04-01T00:00:00Z");
        open.closed_at = None;
        open.open = true;
        assert!(!descent_reached_cutoff(&[open], 0, cutoff));

        // No cutoff date (empty store) means the descent runs to the floor.
        assert!(!descent_reached_cutoff(&old, 0, None));

        // An empty file says nothing about the cutoff.
        assert!(!descent_reached_cutoff(&[], 0, cutoff));
    }
}
