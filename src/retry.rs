use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;
use tokio::time::Instant;

/// One scheduled re-dispatch of a failed sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryEntry {
    pub retry_at: Instant,
    /// Dispatch attempt this entry represents: 1 for the first retry.
    pub attempts: u32,
    pub sequence: u64,
    pub descending: bool,
}

impl Ord for RetryEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.retry_at, self.sequence).cmp(&(other.retry_at, other.sequence))
    }
}

impl PartialOrd for RetryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of failed sequences awaiting another pass.
///
/// Each failure pushes the sequence `retry_interval` into the future with a
/// bumped attempt count; a sequence past its budget is left in `failed` for
/// operator attention.
pub struct RetryQueue {
    heap: BinaryHeap<Reverse<RetryEntry>>,
    max_retries: u32,
    interval: Duration,
}

impl RetryQueue {
    pub fn new(max_retries: u32, interval: Duration) -> Self {
        Self {
            heap: BinaryHeap::new(),
            max_retries,
            interval,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Schedule another dispatch for a sequence that has already been
    /// attempted `attempts_so_far` times beyond its first run. Returns false
    /// when the retry budget is exhausted.
    pub fn schedule(
        &mut self,
        sequence: u64,
        descending: bool,
        attempts_so_far: u32,
        now: Instant,
    ) -> bool {
        if attempts_so_far >= self.max_retries {
            return false;
        }
        self.heap.push(Reverse(RetryEntry {
            retry_at: now + self.interval,
            attempts: attempts_so_far + 1,
            sequence,
            descending,
        }));
        true
    }

    /// Remove and return the earliest entry whose time has come.
    pub fn pop_due(&mut self, now: Instant) -> Option<RetryEntry> {
        match self.heap.peek() {
            Some(Reverse(entry)) if entry.retry_at <= now => self.heap.pop().map(|r| r.0),
            _ => None,
        }
    }

    pub fn next_due_at(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(e)| e.retry_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_come_due_in_order() {
        let mut q = RetryQueue::new(3, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(q.schedule(500, false, 0, t0));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(q.schedule(600, true, 0, Instant::now()));
        assert_eq!(q.len(), 2);

        // Nothing is due yet.
        assert!(q.pop_due(Instant::now()).is_none());

        tokio::time::advance(Duration::from_secs(31)).await;
        let first = q.pop_due(Instant::now()).unwrap();
        assert_eq!(first.sequence, 500);
        assert_eq!(first.attempts, 1);
        assert!(q.pop_due(Instant::now()).is_none());

        tokio::time::advance(Duration::from_secs(30)).await;
        let second = q.pop_due(Instant::now()).unwrap();
        assert_eq!(second.sequence, 600);
        assert!(second.descending);
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn budget_is_bounded() {
        let mut q = RetryQueue::new(3, Duration::from_secs(1));
        let now = Instant::now();
        assert!(q.schedule(7, false, 0, now));
        assert!(q.schedule(7, false, 1, now));
        assert!(q.schedule(7, false, 2, now));
        // A fourth re-dispatch exceeds the budget.
        assert!(!q.schedule(7, false, 3, now));
        assert_eq!(q.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn same_instant_pops_by_sequence() {
        let mut q = RetryQueue::new(3, Duration::from_secs(1));
        let now = Instant::now();
        q.schedule(9, false, 0, now);
        q.schedule(3, false, 0, now);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(q.pop_due(Instant::now()).unwrap().sequence, 3);
        assert_eq!(q.pop_due(Instant::now()).unwrap().sequence, 9);
    }
}
