use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Process configuration, read once at startup from `STAYGRID_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub tenant: TenantConfig,
}

/// Everything a freshly created tenant engine and its background tasks need.
#[derive(Debug, Clone, Default)]
pub struct TenantConfig {
    pub engine: EngineConfig,
    pub cache: CacheConfig,
    pub reaper: ReaperConfig,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hold length used when a caller does not name one.
    pub default_hold_minutes: u32,
    /// How many days before today a check-in may still be accepted.
    pub grace_days: u32,
    /// Bound on waiting for a unit lock before failing with a retryable error.
    pub lock_timeout: Duration,
    /// Settled holds older than this are dropped when the WAL is compacted.
    pub hold_retention: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_hold_minutes: 15,
            grace_days: 1,
            lock_timeout: Duration::from_millis(2_000),
            hold_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Hold-expiry sweep and cache purge period.
    pub interval: Duration,
    /// WAL appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    /// How often the compactor checks the append count.
    pub compact_check_interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            compact_threshold: 1000,
            compact_check_interval: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = TenantConfig::default();
        Self {
            port: env_or("STAYGRID_PORT", 5433),
            bind: env_or("STAYGRID_BIND", "0.0.0.0".to_string()),
            data_dir: PathBuf::from(env_or("STAYGRID_DATA_DIR", "./data".to_string())),
            password: env_or("STAYGRID_PASSWORD", "staygrid".to_string()),
            max_connections: env_or("STAYGRID_MAX_CONNECTIONS", 256),
            metrics_port: env_opt("STAYGRID_METRICS_PORT"),
            tls_cert: env_opt("STAYGRID_TLS_CERT"),
            tls_key: env_opt("STAYGRID_TLS_KEY"),
            tenant: TenantConfig {
                engine: EngineConfig {
                    default_hold_minutes: env_or(
                        "STAYGRID_DEFAULT_HOLD_MINUTES",
                        defaults.engine.default_hold_minutes,
                    ),
                    grace_days: env_or("STAYGRID_GRACE_DAYS", defaults.engine.grace_days),
                    lock_timeout: Duration::from_millis(env_or(
                        "STAYGRID_LOCK_TIMEOUT_MS",
                        defaults.engine.lock_timeout.as_millis() as u64,
                    )),
                    hold_retention: Duration::from_secs(env_or(
                        "STAYGRID_HOLD_RETENTION_SECS",
                        defaults.engine.hold_retention.as_secs(),
                    )),
                },
                cache: CacheConfig {
                    ttl: Duration::from_secs(env_or(
                        "STAYGRID_CACHE_TTL_SECS",
                        defaults.cache.ttl.as_secs(),
                    )),
                    capacity: env_or("STAYGRID_CACHE_CAPACITY", defaults.cache.capacity),
                },
                reaper: ReaperConfig {
                    interval: Duration::from_secs(env_or(
                        "STAYGRID_REAPER_INTERVAL_SECS",
                        defaults.reaper.interval.as_secs(),
                    )),
                    compact_threshold: env_or(
                        "STAYGRID_COMPACT_THRESHOLD",
                        defaults.reaper.compact_threshold,
                    ),
                    compact_check_interval: defaults.reaper.compact_check_interval,
                },
            },
        }
    }
}

/// Unset or unparsable values fall back to the default.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env_opt(key).unwrap_or(default)
}

fn env_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
