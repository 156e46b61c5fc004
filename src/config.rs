// ABOUTME: Cluster configuration loaded from TOML with CLI overrides
//
// Defines ClusterConfig with every tunable of the supervisor:
// - Pool size and worker backend
// - Shared listen address and port reuse
// - Heartbeat, graceful close and polling intervals
// - Crash-loop backoff and frame size limit

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pool::PoolSettings;
use crate::worker::{BackendKind, RuntimeSettings};

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for a prefork cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Number of workers kept running
    pub workers: usize,

    /// How worker processes are launched
    pub backend: BackendKind,

    /// Address every worker accepts on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<SocketAddr>,

    /// Bind with SO_REUSEPORT even with a single worker, so a rolling
    /// restart can overlap the old and new worker
    pub reuse_port: bool,

    // === Liveness ===
    /// Interval between heartbeats sent to each worker
    #[serde(with = "duration_serde::secs")]
    pub heartbeat_interval: Duration,

    /// Kill a worker that has not answered for this long
    #[serde(with = "duration_serde::secs")]
    pub heartbeat_timeout: Duration,

    /// Time a worker may take to drain after a graceful close
    #[serde(with = "duration_serde::secs")]
    pub graceful_timeout: Duration,

    /// Interval between worker exit checks
    #[serde(with = "duration_serde::millis")]
    pub poll_interval: Duration,

    // === Restart ===
    /// Workers exiting sooner than this are crash-looping
    #[serde(with = "duration_serde::secs")]
    pub min_uptime: Duration,

    /// Initial restart delay (exponential backoff base)
    #[serde(with = "duration_serde::millis")]
    pub restart_backoff_base: Duration,

    /// Maximum restart delay (exponential backoff cap)
    #[serde(with = "duration_serde::secs")]
    pub restart_backoff_max: Duration,

    // === Protocol ===
    /// Largest accepted control frame payload in bytes
    pub max_payload_size: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            backend: BackendKind::Auto,
            listen: None,
            reuse_port: true,

            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(30),
            graceful_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),

            min_uptime: Duration::from_secs(1),
            restart_backoff_base: Duration::from_millis(100),
            restart_backoff_max: Duration::from_secs(30),

            max_payload_size: 16 * 1024 * 1024,
        }
    }
}

impl ClusterConfig {
    /// Default config file location: `<config dir>/prefork/prefork.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("prefork").join("prefork.toml"))
    }

    /// Load and validate a TOML config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Load `path` if given, else the default file if it exists, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::load(&path),
                None => Ok(Self::default()),
            },
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings the supervisor cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll_interval must be positive".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid("heartbeat_interval must be positive".into()));
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_timeout ({}s) must exceed heartbeat_interval ({}s)",
                self.heartbeat_timeout.as_secs(),
                self.heartbeat_interval.as_secs()
            )));
        }
        if self.max_payload_size == 0 || self.max_payload_size > crate::protocol::MAX_PAYLOAD_SIZE {
            return Err(ConfigError::Invalid(format!(
                "max_payload_size must be between 1 and {} bytes",
                crate::protocol::MAX_PAYLOAD_SIZE
            )));
        }
        Ok(())
    }

    /// Whether workers bind with SO_REUSEPORT; always on with several workers
    pub const fn shares_port(&self) -> bool {
        self.reuse_port || self.workers > 1
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            capacity: self.workers,
            graceful_timeout: self.graceful_timeout,
            heartbeat_timeout: self.heartbeat_timeout,
            poll_interval: self.poll_interval,
            min_uptime: self.min_uptime,
            backoff_base: self.restart_backoff_base,
            backoff_max: self.restart_backoff_max,
        }
    }

    pub const fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            graceful_timeout: self.graceful_timeout,
            max_payload: self.max_payload_size,
        }
    }
}

/// Config durations. Integers are read in the field's unit; strings carry
/// their own (`"250ms"`, `"10s"`, `"2m"`).
mod duration_serde {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Count(u64),
        Text(String),
    }

    fn parse(text: &str) -> Result<Duration, String> {
        let text = text.trim();
        let split = text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len());
        let (digits, unit) = text.split_at(split);
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration {text:?}"))?;
        match unit.trim() {
            "ms" => Ok(Duration::from_millis(value)),
            "s" => Ok(Duration::from_secs(value)),
            "m" => value
                .checked_mul(60)
                .map(Duration::from_secs)
                .ok_or_else(|| format!("duration {text:?} is too large")),
            other => Err(format!("unknown unit {other:?} in duration {text:?}")),
        }
    }

    fn read<'de, D>(deserializer: D, from_count: fn(u64) -> Duration) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Count(count) => Ok(from_count(count)),
            Raw::Text(text) => parse(&text).map_err(D::Error::custom),
        }
    }

    fn saturating_millis(duration: &Duration) -> u64 {
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
    }

    pub mod secs {
        use super::{read, saturating_millis, Deserializer, Duration, Serialize, Serializer};

        pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            // Sub-second values would be truncated as a count
            if duration.subsec_nanos() == 0 {
                duration.as_secs().serialize(serializer)
            } else {
                format!("{}ms", saturating_millis(duration)).serialize(serializer)
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
        where
            D: Deserializer<'de>,
        {
            read(deserializer, Duration::from_secs)
        }
    }

    pub mod millis {
        use super::{read, Deserializer, Duration, Serialize, Serializer};

        pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            super::saturating_millis(duration).serialize(serializer)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
        where
            D: Deserializer<'de>,
        {
            read(deserializer, Duration::from_millis)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ClusterConfig::default();
        assert!(config.workers >= 1);
        assert_eq!(config.backend, BackendKind::Auto);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.max_payload_size, 16 * 1024 * 1024);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ClusterConfig::from_toml(
            r#"
            workers = 3
            backend = "subprocess"
            listen = "127.0.0.1:8080"
            poll_interval = 50
            "#,
        )
        .unwrap();

        assert_eq!(config.workers, 3);
        assert_eq!(config.backend, BackendKind::Subprocess);
        assert_eq!(config.listen, Some("127.0.0.1:8080".parse().unwrap()));
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.graceful_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = ClusterConfig::default();
        config.workers = 4;
        config.listen = Some("0.0.0.0:9000".parse().unwrap());
        let text = config.to_toml().unwrap();
        assert_eq!(ClusterConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_durations_accept_unit_suffixes() {
        let config = ClusterConfig::from_toml(
            r#"
            graceful_timeout = "1500ms"
            heartbeat_timeout = "2m"
            poll_interval = "1s"
            "#,
        )
        .unwrap();

        assert_eq!(config.graceful_timeout, Duration::from_millis(1500));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(120));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_sub_second_timeout_survives_round_trip() {
        let config = ClusterConfig {
            graceful_timeout: Duration::from_millis(1500),
            ..ClusterConfig::default()
        };
        let text = config.to_toml().unwrap();
        assert!(text.contains("graceful_timeout = \"1500ms\""));
        assert!(text.contains("heartbeat_interval = 5\n"));
        assert_eq!(ClusterConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_unknown_duration_unit_is_rejected() {
        let err = ClusterConfig::from_toml(r#"graceful_timeout = "10h""#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("unknown unit"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero_workers = ClusterConfig {
            workers: 0,
            ..ClusterConfig::default()
        };
        assert!(matches!(zero_workers.validate(), Err(ConfigError::Invalid(_))));

        let short_timeout = ClusterConfig {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(10),
            ..ClusterConfig::default()
        };
        assert!(short_timeout.validate().is_err());

        let zero_poll = ClusterConfig {
            poll_interval: Duration::ZERO,
            ..ClusterConfig::default()
        };
        assert!(zero_poll.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "workers = 1\nreuse_port = false").unwrap();

        let config = ClusterConfig::load(file.path()).unwrap();
        assert_eq!(config.workers, 1);
        assert!(!config.reuse_port);
        assert!(!config.shares_port());

        let several = ClusterConfig {
            workers: 2,
            ..config
        };
        assert!(several.shares_port());
    }

    #[test]
    fn test_load_missing_file_reports_path() {
        let err = ClusterConfig::load(Path::new("/nonexistent/prefork.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/prefork.toml"));
    }

    #[test]
    fn test_settings_conversion() {
        let config = ClusterConfig {
            workers: 5,
            graceful_timeout: Duration::from_secs(3),
            ..ClusterConfig::default()
        };
        assert_eq!(config.pool_settings().capacity, 5);
        assert_eq!(config.runtime_settings().graceful_timeout, Duration::from_secs(3));
    }
}
