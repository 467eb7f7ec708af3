//! Repository configuration.

use crate::error::{RepositoryError, Result};
use serde::Serialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default bulk flush threshold in bytes (5 MiB).
pub const DEFAULT_FLUSH_BYTES: usize = 5 * 1024 * 1024;

/// Default bulk flush interval.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Default interval between bulk stats reports.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(5);

const ENV_PREFIX: &str = "ARMATURE_DOCSTORE_";

/// Repository configuration.
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Cluster node addresses.
    pub addresses: Vec<String>,
    /// Basic auth username.
    pub username: Option<String>,
    /// Basic auth password.
    pub password: Option<String>,
    /// Request timeout.
    pub request_timeout: Duration,
    /// Skip certificate verification.
    pub danger_accept_invalid_certs: bool,
    /// Retry policy for transient backend statuses.
    pub retry: RetryConfig,
    /// Bulk indexer settings.
    pub bulk: BulkConfig,
    /// Template and index bootstrap settings.
    pub mapping: MappingConfig,
    /// Delay between cluster info polls at start-up.
    pub cluster_info_retry_interval: Duration,
    /// Maximum cluster info polls before giving up.
    pub cluster_info_retry_max: u32,
}

impl RepositoryConfig {
    /// Create a new configuration with a single address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            addresses: vec![address.into()],
            username: None,
            password: None,
            request_timeout: Duration::from_secs(30),
            danger_accept_invalid_certs: false,
            retry: RetryConfig::default(),
            bulk: BulkConfig::default(),
            mapping: MappingConfig::default(),
            cluster_info_retry_interval: Duration::from_secs(1),
            cluster_info_retry_max: 10,
        }
    }

    /// Create configuration from a comma-separated address list.
    pub fn with_addresses(mut self, addresses: &str) -> Self {
        self.addresses = split_list(addresses);
        self
    }

    /// Set basic authentication credentials.
    pub fn with_basic_auth(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Skip certificate verification (DANGER: only for development).
    pub fn danger_accept_invalid_certs(mut self) -> Self {
        self.danger_accept_invalid_certs = true;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set bulk indexer settings.
    pub fn with_bulk(mut self, bulk: BulkConfig) -> Self {
        self.bulk = bulk;
        self
    }

    /// Set template bootstrap settings.
    pub fn with_mapping(mut self, mapping: MappingConfig) -> Self {
        self.mapping = mapping;
        self
    }

    /// Set cluster info polling behaviour.
    pub fn with_cluster_info_retry(mut self, interval: Duration, max: u32) -> Self {
        self.cluster_info_retry_interval = interval;
        self.cluster_info_retry_max = max;
        self
    }

    /// Load configuration from `ARMATURE_DOCSTORE_*` environment variables.
    ///
    /// Unset variables keep their defaults. Numeric values that are zero or
    /// unparsable also fall back to defaults; a malformed retry status list
    /// or flush interval is a [`RepositoryError::Config`].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(format!("{}{}", ENV_PREFIX, key)).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    ///
    /// Keys are the variable names without the `ARMATURE_DOCSTORE_` prefix.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new("http://localhost:9200");

        if let Some(addresses) = lookup("ADDRESSES") {
            config = config.with_addresses(&addresses);
        }
        if config.addresses.is_empty() {
            return Err(RepositoryError::Config("no addresses configured".into()));
        }

        config.username = lookup("USERNAME").filter(|v| !v.is_empty());
        config.password = lookup("PASSWORD").filter(|v| !v.is_empty());

        if let Some(enabled) = lookup("RETRY_ENABLE") {
            config.retry.enabled = parse_bool(&enabled);
        }
        if let Some(status) = lookup("RETRY_STATUS") {
            config.retry.status_codes = split_list(&status)
                .iter()
                .map(|s| {
                    s.parse::<u16>().map_err(|e| {
                        RepositoryError::Config(format!("could not parse retry status {:?}: {}", s, e))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
        }
        if let Some(max) = lookup("RETRY_MAX").and_then(|v| positive(v.trim().parse().ok())) {
            config.retry.max_retries = max;
        }

        if let Some(size) = lookup("BULK_FLUSH_SIZE").and_then(|v| parse_size(&v)) {
            config.bulk.flush_bytes = size;
        }
        if let Some(interval) = lookup("BULK_FLUSH_INTERVAL") {
            config.bulk.flush_interval = parse_duration("BULK_FLUSH_INTERVAL", &interval)?;
        }
        if let Some(workers) = lookup("BULK_WORKERS").and_then(|v| positive(v.trim().parse().ok())) {
            config.bulk.workers = workers;
        }
        if let Some(enabled) = lookup("BULK_STATS_ENABLE") {
            config.bulk.stats_enabled = parse_bool(&enabled);
        }

        if let Some(create) = lookup("MAPPING_CREATE") {
            config.mapping.create = parse_bool(&create);
        }
        if let Some(path) = lookup("MAPPING_TEMPLATE_PATH") {
            config.mapping.template_path = PathBuf::from(path.trim());
        }
        if let Some(path) = lookup("MAPPING_INDICES_PATH") {
            config.mapping.indices_path = PathBuf::from(path.trim());
        }

        Ok(config)
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self::new("http://localhost:9200")
    }
}

/// Retry policy for transient backend failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Whether failed requests are retried at all.
    pub enabled: bool,
    /// Status codes that trigger a retry.
    pub status_codes: Vec<u16>,
    /// Maximum retries per request.
    pub max_retries: u32,
    /// First backoff delay.
    pub initial_backoff: Duration,
    /// Upper bound for a single backoff delay.
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            status_codes: vec![502, 503, 504],
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// Create an enabled retry policy with exponential backoff.
    pub fn exponential(max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            enabled: true,
            max_retries,
            initial_backoff,
            ..Default::default()
        }
    }

    /// Set the status codes to retry on.
    pub fn with_status_codes(mut self, codes: Vec<u16>) -> Self {
        self.status_codes = codes;
        self
    }

    /// Check if a status code should trigger a retry.
    pub fn should_retry_status(&self, status: u16) -> bool {
        self.enabled && self.status_codes.contains(&status)
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

/// Bulk indexer settings.
#[derive(Debug, Clone, Serialize)]
pub struct BulkConfig {
    /// Flush a worker's buffer once it would exceed this many bytes.
    pub flush_bytes: usize,
    /// Flush buffered items at least this often.
    pub flush_interval: Duration,
    /// Number of flush workers.
    pub workers: usize,
    /// Request a refresh after each bulk write.
    pub refresh: bool,
    /// Emit periodic stats.
    pub stats_enabled: bool,
    /// Interval between stats reports.
    pub stats_interval: Duration,
    /// Pending items per worker before `add` waits.
    pub queue_capacity: usize,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            flush_bytes: DEFAULT_FLUSH_BYTES,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            refresh: true,
            stats_enabled: false,
            stats_interval: DEFAULT_STATS_INTERVAL,
            queue_capacity: 1024,
        }
    }
}

impl BulkConfig {
    /// Set the flush byte threshold.
    pub fn with_flush_bytes(mut self, bytes: usize) -> Self {
        self.flush_bytes = bytes;
        self
    }

    /// Set the flush interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Enable or disable refresh-on-write.
    pub fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    /// Enable periodic stats reports.
    pub fn with_stats(mut self, interval: Duration) -> Self {
        self.stats_enabled = true;
        self.stats_interval = interval;
        self
    }

    /// Set the per-worker queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}

/// Template and index bootstrap settings.
#[derive(Debug, Clone, Default)]
pub struct MappingConfig {
    /// Run the bootstrap when the repository starts.
    pub create: bool,
    /// Directory holding `ecs/` and `index/` template folders.
    pub template_path: PathBuf,
    /// Path to the indices manifest.
    pub indices_path: PathBuf,
}

impl MappingConfig {
    /// Enable bootstrap with the given locations.
    pub fn new(template_path: impl Into<PathBuf>, indices_path: impl Into<PathBuf>) -> Self {
        Self {
            create: true,
            template_path: template_path.into(),
            indices_path: indices_path.into(),
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_bool(value: &str) -> bool {
    let value = value.trim();
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn positive<T: PartialOrd + Default>(value: Option<T>) -> Option<T> {
    value.filter(|v| *v > T::default())
}

fn parse_size(value: &str) -> Option<usize> {
    let value = value.trim();
    let (digits, multiplier) = [("GiB", 1usize << 30), ("MiB", 1 << 20), ("KiB", 1 << 10), ("B", 1)]
        .iter()
        .find_map(|(suffix, m)| value.strip_suffix(suffix).map(|d| (d.trim(), *m)))
        .unwrap_or((value, 1));

    positive(digits.parse::<usize>().ok()).map(|n| n.saturating_mul(multiplier))
}

/// Parse a human-readable duration such as `250ms`, `2min` or `1h`.
///
/// Plain or fractional seconds (`5`, `1.5s`) are accepted as well. Zero and
/// unparsable values are rejected.
fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    let value = value.trim();
    let duration = humantime::parse_duration(value).or_else(|e| {
        value
            .strip_suffix('s')
            .unwrap_or(value)
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .ok_or_else(|| RepositoryError::Config(format!("could not parse {} {:?}: {}", key, value, e)))
    })?;

    if duration.is_zero() {
        return Err(RepositoryError::Config(format!("{} must be positive", key)));
    }
    Ok(duration)
}
