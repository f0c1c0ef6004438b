use crate::config::Config;
use eyre::Result;
use flate2::read::GzDecoder;
use reqwest::StatusCode;
use std::io::Read;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Fetch failures the caller must tell apart: a missing file is a normal
/// terminal outcome for a sequence, everything else marks it failed.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("file not found upstream (404)")]
    NotFound,

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected http status {0}")]
    Status(StatusCode),

    #[error("gzip decode failed: {0}")]
    Gzip(#[source] std::io::Error),

    #[error("state file has no 'sequence' key")]
    MalformedState,

    #[error("aborted by shutdown")]
    Aborted,
}

impl FetchError {
    /// Worth another attempt within the same fetch.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Http(_) => true,
            FetchError::Status(status) => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

/// Global pacing for upstream HTTP calls: every request passes through one of
/// these, so the whole process issues at most one request per delay.
pub struct Throttle {
    delay: Duration,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last: Mutex::new(None),
        }
    }

    /// Waits until the configured spacing from the previous request has
    /// elapsed. Holding the lock across the sleep is what serializes callers.
    pub async fn acquire(&self) {
        if self.delay.is_zero() {
            return;
        }
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let due = prev + self.delay;
            let now = Instant::now();
            if due > now {
                tokio::time::sleep(due - now).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Client for the replication feed: sequence→URL mapping, the state file,
/// and throttled fetches with bounded in-fetch retries.
pub struct ReplicationClient {
    http: reqwest::Client,
    base_url: String,
    state_url: String,
    throttle: Throttle,
    attempts: u32,
    cancel: CancellationToken,
}

impl ReplicationClient {
    pub fn new(cfg: &Config, cancel: CancellationToken) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(cfg.http_connect_timeout)
            .timeout(cfg.http_timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: cfg.base_url.clone(),
            state_url: cfg.state_url.clone(),
            throttle: Throttle::new(cfg.throttle_delay),
            attempts: cfg.fetch_attempts,
            cancel,
        })
    }

    /// A sequence number zero-padded to 9 digits `aaabbbccc` maps to
    /// `{base}/aaa/bbb/ccc.osm.gz`.
    pub fn sequence_url(&self, sequence: u64) -> String {
        sequence_url(&self.base_url, sequence)
    }

    /// Read the upstream tip from the state file.
    pub async fn current_sequence(&self) -> Result<u64, FetchError> {
        let body = self.get_with_retries(&self.state_url).await?;
        parse_state_body(&String::from_utf8_lossy(&body))
    }

    /// Fetch one replication file and return the decompressed XML bytes.
    pub async fn fetch_sequence(&self, sequence: u64) -> Result<Vec<u8>, FetchError> {
        let url = self.sequence_url(sequence);
        let compressed = self.get_with_retries(&url).await?;
        gunzip(&compressed)
    }

    async fn get_with_retries(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 1u32;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(FetchError::Aborted),
                _ = self.throttle.acquire() => {}
            }

            match self.get_once(url).await {
                Ok(body) => return Ok(body),
                Err(err) if err.is_transient() && attempt < self.attempts => {
                    let delay = backoff_delay(attempt);
                    tracing::warn!(
                        url,
                        attempt,
                        sleep_ms = delay.as_millis() as u64,
                        error = %err,
                        "fetch failed; retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(FetchError::Aborted),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn get_once(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(FetchError::Aborted),
            r = self.http.get(url).send() => r?,
        };

        match response.status() {
            StatusCode::NOT_FOUND => Err(FetchError::NotFound),
            status if !status.is_success() => Err(FetchError::Status(status)),
            _ => {
                let bytes = tokio::select! {
                    _ = self.cancel.cancelled() => return Err(FetchError::Aborted),
                    b = response.bytes() => b?,
                };
                Ok(bytes.to_vec())
            }
        }
    }
}

pub fn sequence_url(base_url: &str, sequence: u64) -> String {
    let seq = format!("{sequence:09}");
    format!(
        "{}/{}/{}/{}.osm.gz",
        base_url,
        &seq[0..3],
        &seq[3..6],
        &seq[6..9]
    )
}

/// 2s, 4s, 8s, ... between in-fetch attempts.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(10);
    Duration::from_secs(2u64 << exp)
}

/// The state file is a key:value stream; only `sequence:` is required.
pub fn parse_state_body(text: &str) -> Result<u64, FetchError> {
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("sequence:") {
            return rest
                .trim()
                .parse::<u64>()
                .map_err(|_| FetchError::MalformedState);
        }
    }
    Err(FetchError::MalformedState)
}

pub fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, FetchError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(FetchError::Gzip)?;
    Ok(out)
}
