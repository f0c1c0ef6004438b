use eyre::{eyre, Result, WrapErr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration for both binaries, loaded from the environment
/// (after `dotenvy` has had a chance to populate it from a local `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    /// Replication feed root.
    pub base_url: String,
    /// State file location; defaults to `{base_url}/state.yaml`.
    pub state_url: String,
    pub db_url: String,

    pub num_workers: usize,
    pub max_db_connections: u32,
    /// Rows per upsert transaction.
    pub batch_size: usize,
    /// Bounded job/batch channel capacity.
    pub queue_size: usize,
    /// Archive read buffer, bytes.
    pub buffer_size: usize,

    /// Global minimum spacing between upstream HTTP calls.
    pub throttle_delay: Duration,
    pub polling_interval: Duration,
    pub retry_interval: Duration,
    /// Re-dispatches per sequence after its first failure.
    pub max_retries: u32,
    /// Age at which a `processing` row is reclaimed to `failed`.
    pub stale_grace: Duration,
    pub stale_scan_interval: Duration,

    pub http_timeout: Duration,
    pub http_connect_timeout: Duration,
    /// Server-side statement timeout applied to every pooled connection.
    pub statement_timeout: Duration,
    /// In-fetch retry attempts (exponential backoff between them).
    pub fetch_attempts: u32,

    /// Archive loader only: drop records whose closed_at is older than
    /// `now - retention_days`. Zero disables the window.
    pub retention_days: u32,
    /// Overrides the descent starting point (instead of the remote tip).
    pub start_sequence: Option<u64>,
    /// Lower bound of historical descent.
    pub min_sequence: u64,

    pub lock_file: PathBuf,
    /// Default tracing filter when RUST_LOG is unset.
    pub log_level: String,
}

const DEFAULT_BASE_URL: &str = "https://planet.osm.org/replication/changesets";

impl Config {
    /// Daemon configuration: replication-sized batches.
    pub fn from_env() -> Result<Self> {
        Self::load(1_000)
    }

    /// Archive loader configuration: bulk-sized batches.
    pub fn from_env_archive() -> Result<Self> {
        Self::load(50_000)
    }

    fn load(default_batch_size: usize) -> Result<Self> {
        let base_url: String = env_or("REPLICATION_BASE_URL", DEFAULT_BASE_URL.to_string())?;
        let base_url = base_url.trim_end_matches('/').to_string();
        let state_url = match std::env::var("REPLICATION_STATE_URL") {
            Ok(v) if !v.is_empty() => v,
            _ => format!("{base_url}/state.yaml"),
        };

        let start_sequence: u64 = env_or("START_SEQUENCE", 0)?;

        let cfg = Config {
            base_url,
            state_url,
            db_url: db_url_from_env()?,
            num_workers: env_or("NUM_WORKERS", 4)?,
            max_db_connections: env_or("MAX_DB_CONNECTIONS", 16)?,
            batch_size: env_or("BATCH_SIZE", default_batch_size)?,
            queue_size: env_or("QUEUE_SIZE", 1_000)?,
            buffer_size: env_or("BUFFER_SIZE", 262_144)?,
            throttle_delay: secs_f64("THROTTLE_DELAY_SECONDS", 1.0)?,
            polling_interval: secs("POLLING_INTERVAL_SECONDS", 60)?,
            retry_interval: secs("RETRY_INTERVAL_SECONDS", 60)?,
            max_retries: env_or("MAX_RETRIES", 3)?,
            stale_grace: secs("STALE_PROCESSING_GRACE_SECONDS", 600)?,
            stale_scan_interval: secs("STALE_SCAN_INTERVAL_SECONDS", 300)?,
            http_timeout: secs("HTTP_TIMEOUT_SECONDS", 180)?,
            http_connect_timeout: secs("HTTP_CONNECT_TIMEOUT_SECONDS", 30)?,
            statement_timeout: secs("STATEMENT_TIMEOUT_SECONDS", 300)?,
            fetch_attempts: env_or("FETCH_ATTEMPTS", 3)?,
            retention_days: env_or("RETENTION_DAYS", 0)?,
            start_sequence: (start_sequence > 0).then_some(start_sequence),
            min_sequence: env_or::<u64>("MIN_SEQUENCE", 1)?.max(1),
            lock_file: PathBuf::from(env_or(
                "LOCK_FILE",
                "osm-changeset-sync.lock".to_string(),
            )?),
            log_level: env_or("LOG_LEVEL", "info".to_string())?,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(eyre!("NUM_WORKERS must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(eyre!("BATCH_SIZE must be > 0"));
        }
        if self.queue_size == 0 {
            return Err(eyre!("QUEUE_SIZE must be > 0"));
        }
        if self.max_db_connections == 0 {
            return Err(eyre!("MAX_DB_CONNECTIONS must be > 0"));
        }
        if self.fetch_attempts == 0 {
            return Err(eyre!("FETCH_ATTEMPTS must be > 0"));
        }
        Ok(())
    }

    /// The database URL with any password replaced, safe for startup logs.
    pub fn redacted_db_url(&self) -> String {
        redact_db_url(&self.db_url)
    }
}

/// `DATABASE_URL` wins; otherwise assemble from the POSTGRES_* parts.
fn db_url_from_env() -> Result<String> {
    if let Ok(url) = std::env::var("DATABASE_URL") {
        if !url.is_empty() {
            return Ok(url);
        }
    }

    let host = std::env::var("POSTGRES_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = std::env::var("POSTGRES_PORT").unwrap_or_else(|_| "5432".to_string());
    let user = std::env::var("POSTGRES_USER")
        .map_err(|_| eyre!("set DATABASE_URL or POSTGRES_USER/POSTGRES_PASSWORD/POSTGRES_DB"))?;
    let password = std::env::var("POSTGRES_PASSWORD").unwrap_or_default();
    let dbname = std::env::var("POSTGRES_DB").map_err(|_| eyre!("POSTGRES_DB is not set"))?;

    Ok(build_db_url(&host, &port, &user, &password, &dbname))
}

fn build_db_url(host: &str, port: &str, user: &str, password: &str, dbname: &str) -> String {
    if password.is_empty() {
        format!("postgres://{user}@{host}:{port}/{dbname}")
    } else {
        format!("postgres://{user}:{password}@{host}:{port}/{dbname}")
    }
}

fn redact_db_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    let Some(at) = rest.find('@') else {
        return url.to_string();
    };
    let userinfo = &rest[..at];
    match userinfo.find(':') {
        Some(colon) => format!(
            "{}://{}:***@{}",
            &url[..scheme_end],
            &userinfo[..colon],
            &rest[at + 1..]
        ),
        None => url.to_string(),
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v
            .parse::<T>()
            .wrap_err_with(|| format!("invalid value for {key}: '{v}'")),
        _ => Ok(default),
    }
}

fn secs(key: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_secs(env_or(key, default)?))
}

fn secs_f64(key: &str, default: f64) -> Result<Duration> {
    let v: f64 = env_or(key, default)?;
    if !v.is_finite() || v < 0.0 {
        return Err(eyre!("{key} must be a non-negative number of seconds"));
    }
    Ok(Duration::from_secs_f64(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_url_with_and_without_password() {
        assert_eq!(
            build_db_url("db", "5432", "osm", "s3cret", "changesets"),
            "postgres://osm:s3cret@db:5432/changesets"
        );
        assert_eq!(
            build_db_url("db", "5432", "osm", "", "changesets"),
            "postgres://osm@db:5432/changesets"
        );
    }

    #[test]
    fn redaction_hides_password_only() {
        assert_eq!(
            redact_db_url("postgres://osm:s3cret@db:5432/changesets"),
            "postgres://osm:***@db:5432/changesets"
        );
        // No password, nothing to hide.
        assert_eq!(
            redact_db_url("postgres://osm@db:5432/changesets"),
            "postgres://osm@db:5432/changesets"
        );
        // Not a URL at all; returned untouched.
        assert_eq!(redact_db_url("not-a-url"), "not-a-url");
    }
}
