use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_STALE_DAYS: u32 = 10;
pub const DEFAULT_EXPIRE_OVERLAP_SECS: u64 = 3600;
pub const SECS_PER_DAY: u64 = 86_400;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// CRL refresh policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Days past nextUpdate after which an expired CRL is deleted outright
    /// (0 = default of 10)
    #[serde(default = "default_stale_days")]
    pub stale_days: u32,

    /// Seconds before nextUpdate at which a CRL already counts as expired
    /// (0 = default of 3600)
    #[serde(default = "default_expire_overlap_secs")]
    pub expire_overlap_secs: u64,

    /// Treat every cached CRL as expired and stale
    #[serde(default)]
    pub purge_all: bool,

    /// Verify CRL signatures against `trust_anchors_path`
    #[serde(default)]
    pub full_crypto_verify: bool,

    /// Re-fetch expired CRLs from their source URL
    #[serde(default = "default_true")]
    pub do_refresh: bool,

    /// PEM bundle of trust anchors used when `full_crypto_verify` is set
    #[serde(default)]
    pub trust_anchors_path: Option<String>,
}

fn default_stale_days() -> u32 {
    DEFAULT_STALE_DAYS
}

fn default_expire_overlap_secs() -> u64 {
    DEFAULT_EXPIRE_OVERLAP_SECS
}

fn default_true() -> bool {
    true
}

impl Default for RefreshConfig {
    fn default() -> Self {
        RefreshConfig {
            stale_days: DEFAULT_STALE_DAYS,
            expire_overlap_secs: DEFAULT_EXPIRE_OVERLAP_SECS,
            purge_all: false,
            full_crypto_verify: false,
            do_refresh: true,
            trust_anchors_path: None,
        }
    }
}

impl RefreshConfig {
    /// Stale threshold in days; zero falls back to the default
    pub fn effective_stale_days(&self) -> u32 {
        if self.stale_days == 0 {
            DEFAULT_STALE_DAYS
        } else {
            self.stale_days
        }
    }

    /// Expiry overlap in seconds; zero falls back to the default
    pub fn effective_expire_overlap_secs(&self) -> u64 {
        if self.expire_overlap_secs == 0 {
            DEFAULT_EXPIRE_OVERLAP_SECS
        } else {
            self.expire_overlap_secs
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let stale_secs = u64::from(self.effective_stale_days()) * SECS_PER_DAY;
        if self.effective_expire_overlap_secs() > stale_secs {
            return Err(ConfigError::Invalid(format!(
                "expire_overlap_secs ({}) exceeds stale window ({} days)",
                self.effective_expire_overlap_secs(),
                self.effective_stale_days()
            )));
        }
        if self.full_crypto_verify && self.trust_anchors_path.is_none() {
            return Err(ConfigError::Invalid(
                "full_crypto_verify requires trust_anchors_path".to_string(),
            ));
        }
        Ok(())
    }
}

/// Network retrieval settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Whole-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// TCP connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Largest response body accepted, in bytes
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Honour HTTP(S)_PROXY / NO_PROXY and the platform proxy settings
    #[serde(default = "default_true")]
    pub use_system_proxy: bool,
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_response_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_user_agent() -> String {
    format!("ocspd/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_response_bytes: default_max_response_bytes(),
            user_agent: default_user_agent(),
            use_system_proxy: true,
        }
    }
}

impl FetchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Background sweep schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Delay before the first sweep after startup
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,

    /// Delay between the end of one sweep and the start of the next
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_initial_delay_secs() -> u64 {
    30
}

fn default_interval_secs() -> u64 {
    6 * 60 * 60
}

impl Default for SweeperConfig {
    fn default() -> Self {
        SweeperConfig {
            enabled: true,
            initial_delay_secs: default_initial_delay_secs(),
            interval_secs: default_interval_secs(),
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory of the on-disk revocation cache
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,

    /// Listen address of the admin/lookup HTTP surface
    #[serde(default = "default_admin_listen")]
    pub admin_listen: String,

    /// Enable verbose logging (deprecated: use log_level instead)
    #[serde(default)]
    pub verbose: bool,

    /// Log level: "trace", "debug", "info", "warn", "error" (default: "info")
    #[serde(default)]
    pub log_level: Option<String>,

    /// Tokio worker threads (default: number of CPUs)
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Lookups served concurrently; further requests queue
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Largest artifact the cache will store, in bytes
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: u64,

    /// How long a CRL lookup waits on its fetch before answering Timeout
    #[serde(default = "default_crl_wait_ceiling_ms")]
    pub crl_wait_ceiling_ms: u64,

    /// Exit after this many seconds without requests or fetches (None = never)
    #[serde(default)]
    pub idle_exit_secs: Option<u64>,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub refresh: RefreshConfig,

    #[serde(default)]
    pub sweeper: SweeperConfig,
}

fn default_cache_dir() -> String {
    "/var/db/ocspd".to_string()
}

fn default_admin_listen() -> String {
    "127.0.0.1:8089".to_string()
}

fn default_max_concurrent_requests() -> usize {
    64
}

fn default_max_payload_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_crl_wait_ceiling_ms() -> u64 {
    3000
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: default_cache_dir(),
            admin_listen: default_admin_listen(),
            verbose: false,
            log_level: None,
            worker_threads: None,
            max_concurrent_requests: default_max_concurrent_requests(),
            max_payload_bytes: default_max_payload_bytes(),
            crl_wait_ceiling_ms: default_crl_wait_ceiling_ms(),
            idle_exit_secs: None,
            fetch: FetchConfig::default(),
            refresh: RefreshConfig::default(),
            sweeper: SweeperConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn admin_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.admin_listen
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("Invalid admin_listen: {}", self.admin_listen)))
    }

    pub fn cache_path(&self) -> PathBuf {
        PathBuf::from(&self.cache_dir)
    }

    pub fn crl_wait_ceiling(&self) -> Duration {
        Duration::from_millis(self.crl_wait_ceiling_ms)
    }

    /// Effective log level, honouring the deprecated `verbose` flag
    pub fn effective_log_level(&self) -> &str {
        match self.log_level.as_deref() {
            Some(level) => level,
            None if self.verbose => "debug",
            None => "info",
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_dir.is_empty() {
            return Err(ConfigError::Invalid("cache_dir cannot be empty".to_string()));
        }

        self.admin_addr()?;

        if let Some(level) = &self.log_level {
            if !matches!(level.as_str(), "trace" | "debug" | "info" | "warn" | "error") {
                return Err(ConfigError::Invalid(format!("Unknown log_level: {}", level)));
            }
        }

        if self.worker_threads == Some(0) {
            return Err(ConfigError::Invalid("worker_threads cannot be 0".to_string()));
        }

        if self.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_requests cannot be 0".to_string(),
            ));
        }

        if self.max_payload_bytes == 0 {
            return Err(ConfigError::Invalid("max_payload_bytes cannot be 0".to_string()));
        }

        if self.fetch.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "fetch.request_timeout_secs cannot be 0".to_string(),
            ));
        }

        if self.sweeper.enabled && self.sweeper.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sweeper.interval_secs cannot be 0".to_string(),
            ));
        }

        self.refresh.validate()
    }

    /// Create an example configuration file
    pub fn example() -> Self {
        Config {
            cache_dir: "/var/db/ocspd".to_string(),
            admin_listen: "127.0.0.1:8089".to_string(),
            verbose: false,
            log_level: Some("info".to_string()),
            worker_threads: Some(4),
            max_concurrent_requests: 64,
            max_payload_bytes: default_max_payload_bytes(),
            crl_wait_ceiling_ms: 3000,
            idle_exit_secs: Some(600),
            fetch: FetchConfig::default(),
            refresh: RefreshConfig {
                trust_anchors_path: Some("/etc/ocspd/anchors.pem".to_string()),
                ..RefreshConfig::default()
            },
            sweeper: SweeperConfig::default(),
        }
    }
}
