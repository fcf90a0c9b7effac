//! synthgrid.toml configuration parser.
//!
//! Every field has a default, so an empty document is a valid config.
//! Durations are written as strings with an `ms`, `s`, `m` or `h` suffix
//! (`"250ms"`, `"30s"`, `"5m"`); a bare number is read as seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error(
        "largest allowed request costs {worst_case} units but budget capacity is {capacity}; \
         such requests could never be admitted"
    )]
    Unbounded { worst_case: u64, capacity: u32 },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub scheduler: SchedulingConfig,
    pub rate_limit: RateLimitConfig,
    pub cost: CostConfig,
}

/// Budget, queue, pool and deadline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulingConfig {
    /// Total cost units the engine can hold at once.
    pub budget_capacity: u32,
    /// Maximum number of requests waiting for admission.
    pub queue_capacity: usize,
    /// Number of engine handles (parallel generations).
    pub pool_size: usize,
    /// Default queue-wait deadline, counted from submission.
    #[serde(with = "duration_str")]
    pub queue_timeout: Duration,
    /// Default execution deadline, counted from admission.
    #[serde(with = "duration_str")]
    pub execution_timeout: Duration,
    /// Tick of the background queue reaper.
    #[serde(with = "duration_str")]
    pub reaper_interval: Duration,
    /// Automatic re-admissions after a transient engine failure.
    pub transient_retries: u32,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            budget_capacity: 100,
            queue_capacity: 8,
            pool_size: 1,
            queue_timeout: Duration::from_secs(30),
            execution_timeout: Duration::from_secs(300),
            reaper_interval: Duration::from_millis(250),
            transient_retries: 1,
        }
    }
}

/// Per-client token bucket settings.
///
/// Every client has a short-term bucket sized by `burst` and, unless
/// `requests_per_hour` is 0, an hourly bucket. A request must find a token
/// in both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Bucket capacity: the largest burst a client may send.
    pub burst: u32,
    /// Sustained rate; tokens refill at `requests_per_minute / 60` per second.
    pub requests_per_minute: u32,
    /// Capacity of the hourly bucket, refilled evenly over an hour. 0 disables it.
    pub requests_per_hour: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            burst: 10,
            requests_per_minute: 60,
            requests_per_hour: 1000,
        }
    }
}

impl RateLimitConfig {
    /// Tokens added per second.
    pub fn refill_per_sec(&self) -> f64 {
        f64::from(self.requests_per_minute) / 60.0
    }

    /// Tokens added per second to the hourly bucket, if it is enabled.
    pub fn hourly_refill_per_sec(&self) -> Option<f64> {
        (self.requests_per_hour > 0).then(|| f64::from(self.requests_per_hour) / 3600.0)
    }
}

/// Cost formula constants and the parameter bounds the serving layer
/// validates against.
///
/// `units = max(min_units, ceil(width * height * effective_steps / pixel_steps_per_unit))`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CostConfig {
    pub pixel_steps_per_unit: u64,
    pub min_units: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub max_steps: u32,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            pixel_steps_per_unit: 4 * 1024 * 1024,
            min_units: 1,
            max_width: 2048,
            max_height: 2048,
            max_steps: 100,
        }
    }
}

impl SchedulerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check field-level constraints. The cost boundedness check needs the
    /// cost formula and runs when the scheduler's cost estimator is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scheduler;
        require(s.budget_capacity > 0, "scheduler.budget_capacity must be at least 1")?;
        require(s.pool_size > 0, "scheduler.pool_size must be at least 1")?;
        require(!s.queue_timeout.is_zero(), "scheduler.queue_timeout must be non-zero")?;
        require(
            !s.execution_timeout.is_zero(),
            "scheduler.execution_timeout must be non-zero",
        )?;
        require(
            !s.reaper_interval.is_zero(),
            "scheduler.reaper_interval must be non-zero",
        )?;

        let r = &self.rate_limit;
        if r.enabled {
            require(r.burst > 0, "rate_limit.burst must be at least 1")?;
            require(
                r.requests_per_minute > 0,
                "rate_limit.requests_per_minute must be at least 1",
            )?;
        }

        let c = &self.cost;
        require(
            c.pixel_steps_per_unit > 0,
            "cost.pixel_steps_per_unit must be at least 1",
        )?;
        require(c.min_units > 0, "cost.min_units must be at least 1")?;
        require(
            c.max_width > 0 && c.max_height > 0 && c.max_steps > 0,
            "cost.max_width, cost.max_height and cost.max_steps must be non-zero",
        )?;
        Ok(())
    }
}

fn require(condition: bool, message: &str) -> Result<(), ConfigError> {
    if condition {
        Ok(())
    } else {
        Err(ConfigError::Invalid(message.to_string()))
    }
}

/// Parse a duration string such as `"250ms"`, `"30s"`, `"5m"` or `"1h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (number, scale_ms) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1_000)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60_000)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3_600_000)
    } else {
        (s, 1_000)
    };
    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {s:?}"))?;
    value
        .checked_mul(scale_ms)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration out of range: {s:?}"))
}

/// Render a duration in the shortest exact unit.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 1_000 != 0 {
        format!("{ms}ms")
    } else if ms % 3_600_000 == 0 && ms > 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms % 60_000 == 0 && ms > 0 {
        format!("{}m", ms / 60_000)
    } else {
        format!("{}s", ms / 1_000)
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Secs(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => super::parse_duration(&s).map_err(serde::de::Error::custom),
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
        }
    }
}
