//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollgateError};

/// Prefix for environment variable overrides, e.g. `TOLLGATE__LIMITER__CAPACITY`.
const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Token bucket parameters
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Idle key sweeper configuration
    #[serde(default)]
    pub sweeper: SweeperConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// What a denied request does to its key's refill clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialPolicy {
    /// Only admitted requests move the clock. Denials leave the bucket untouched,
    /// so a caller is charged for successful usage only.
    #[default]
    CountAccepted,
    /// Every request moves the clock. On denial the refilled token count is
    /// stored and the timestamp advances, so polling keeps the key "recent".
    CountAttempts,
}

/// Parameters of a token bucket shared by every key of a limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Maximum number of tokens a bucket may hold (the burst size)
    #[serde(default = "default_capacity")]
    pub capacity: f64,

    /// Window over which `capacity` tokens are replenished
    #[serde(default = "default_period_secs")]
    pub period_secs: f64,

    /// Whether denied requests advance the refill clock
    #[serde(default)]
    pub denial_policy: DenialPolicy,

    /// Idle time after which a key may be evicted; defaults to the period
    #[serde(default)]
    pub idle_ttl_secs: Option<f64>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            period_secs: default_period_secs(),
            denial_policy: DenialPolicy::default(),
            idle_ttl_secs: None,
        }
    }
}

fn default_capacity() -> f64 {
    100.0
}

fn default_period_secs() -> f64 {
    60.0
}

impl LimiterConfig {
    /// Create a configuration admitting `capacity` requests per `period`.
    pub fn new(capacity: f64, period: Duration) -> Self {
        Self {
            capacity,
            period_secs: period.as_secs_f64(),
            ..Self::default()
        }
    }

    /// Set the denial policy.
    pub fn with_denial_policy(mut self, policy: DenialPolicy) -> Self {
        self.denial_policy = policy;
        self
    }

    /// Set the idle time after which a key's state may be evicted.
    pub fn with_idle_ttl(mut self, idle_ttl: Duration) -> Self {
        self.idle_ttl_secs = Some(idle_ttl.as_secs_f64());
        self
    }

    /// Check the parameters and resolve them into the values a limiter runs on.
    pub fn validate(&self) -> Result<LimiterParams> {
        if !self.capacity.is_finite() || self.capacity < 1.0 {
            return Err(TollgateError::InvalidConfig(format!(
                "capacity must be a finite number >= 1, got {}",
                self.capacity
            )));
        }

        let period = positive_duration("period_secs", self.period_secs)?;

        let idle_ttl = match self.idle_ttl_secs {
            Some(secs) => {
                let ttl = positive_duration("idle_ttl_secs", secs)?;
                if ttl < period {
                    return Err(TollgateError::InvalidConfig(format!(
                        "idle_ttl_secs ({}) must not be shorter than period_secs ({})",
                        secs, self.period_secs
                    )));
                }
                ttl
            }
            None => period,
        };

        let refill_per_sec = self.capacity / period.as_secs_f64();
        if !refill_per_sec.is_finite() {
            return Err(TollgateError::InvalidConfig(format!(
                "refill rate of {} tokens over {}s is not finite",
                self.capacity, self.period_secs
            )));
        }

        Ok(LimiterParams {
            capacity: self.capacity,
            period,
            refill_per_sec,
            denial_policy: self.denial_policy,
            idle_ttl,
        })
    }
}

fn positive_duration(field: &str, secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(TollgateError::InvalidConfig(format!(
            "{} must be a finite positive number, got {}",
            field, secs
        )));
    }
    let duration = Duration::try_from_secs_f64(secs)
        .map_err(|e| TollgateError::InvalidConfig(format!("{}: {}", field, e)))?;
    if duration.is_zero() {
        return Err(TollgateError::InvalidConfig(format!(
            "{} rounds to zero nanoseconds, got {}",
            field, secs
        )));
    }
    Ok(duration)
}

/// Validated limiter parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimiterParams {
    pub capacity: f64,
    pub period: Duration,
    /// Tokens credited per second of elapsed time, `capacity / period`
    pub refill_per_sec: f64,
    pub denial_policy: DenialPolicy,
    pub idle_ttl: Duration,
}

/// Sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Whether to run the idle key sweeper
    #[serde(default = "default_sweeper_enabled")]
    pub enabled: bool,

    /// Seconds between sweeps
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: default_sweeper_enabled(),
            interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweeper_enabled() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    30
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from an optional YAML file, then apply
    /// `TOLLGATE__SECTION__FIELD` environment overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<TollgateConfig>()?;

        Ok(config)
    }
}
