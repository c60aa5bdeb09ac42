//! Immutable runtime configuration.
//!
//! Built once at startup by the daemon (from environment variables and
//! command-line flags) and passed by reference to the sensors, the emitter and
//! the scheduler. Nothing reads the environment after that.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::sample::Quantity;
use crate::sysfs::DEFAULT_SYSFS_PATH;

/// Default sampling interval.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);
/// Default I2C address of the BME680 (SDO pulled low).
pub const DEFAULT_INDOOR_I2C_ADDR: u8 = 0x76;
/// Default I2C bus (the header pins on a Raspberry Pi).
pub const DEFAULT_INDOOR_I2C_BUS: u8 = 1;
/// Default oversampling ratio for every indoor channel.
pub const DEFAULT_OVERSAMPLING: u8 = 8;
/// Default StatsD port.
pub const DEFAULT_GRAPHITE_PORT: u16 = 8125;
/// Default bound on a metrics transmission.
pub const DEFAULT_GRAPHITE_TIMEOUT: Duration = Duration::from_secs(1);
/// Default metric name prefix.
pub const DEFAULT_METRICS_PREFIX: &str = "atmo";

/// Oversampling ratios accepted by the BME680.
pub const OVERSAMPLING_RATIOS: [u8; 5] = [1, 2, 4, 8, 16];

/// Characters with meaning in the StatsD line format.
const RESERVED_CHARS: [char; 4] = [':', '|', '@', '#'];

/// Configuration error.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be a positive, finite number of seconds (got {value})")]
    InvalidDuration { name: &'static str, value: f64 },

    #[error("GRAPHITE_HOST must not be empty")]
    EmptyHost,

    #[error("invalid metric name {name:?}: {reason}")]
    InvalidMetricName { name: String, reason: &'static str },

    #[error("I2C address {0:#04x} is not a 7-bit address")]
    InvalidI2cAddr(u16),

    #[error("oversampling ratio must be one of 1, 2, 4, 8, 16 (got {0})")]
    InvalidOversampling(u8),
}

/// Converts a number of seconds from configuration into a [`Duration`].
pub fn duration_from_secs(name: &'static str, value: f64) -> Result<Duration, ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::InvalidDuration { name, value });
    }
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidDuration { name, value })
}

/// Leaf names of the four metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricNames {
    pub temperature_indoor: String,
    pub temperature_outdoor: String,
    pub pressure: String,
    pub humidity: String,
}

impl Default for MetricNames {
    fn default() -> Self {
        Self {
            temperature_indoor: Quantity::TemperatureIndoor.default_name().to_string(),
            temperature_outdoor: Quantity::TemperatureOutdoor.default_name().to_string(),
            pressure: Quantity::Pressure.default_name().to_string(),
            humidity: Quantity::Humidity.default_name().to_string(),
        }
    }
}

impl MetricNames {
    /// Returns the configured leaf name for `quantity`.
    pub fn get(&self, quantity: Quantity) -> &str {
        match quantity {
            Quantity::TemperatureIndoor => &self.temperature_indoor,
            Quantity::Pressure => &self.pressure,
            Quantity::Humidity => &self.humidity,
            Quantity::TemperatureOutdoor => &self.temperature_outdoor,
        }
    }
}

/// Metrics collector settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EmitterConfig {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
    pub prefix: String,
    pub names: MetricNames,
}

impl EmitterConfig {
    /// Creates a configuration for `host` with every other setting at its default.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_GRAPHITE_PORT,
            timeout: DEFAULT_GRAPHITE_TIMEOUT,
            prefix: DEFAULT_METRICS_PREFIX.to_string(),
            names: MetricNames::default(),
        }
    }

    /// Full metric name for `quantity`: `<prefix>.<leaf>`, or just the leaf
    /// when the prefix is empty.
    pub fn metric_name(&self, quantity: Quantity) -> String {
        let leaf = self.names.get(quantity);
        if self.prefix.is_empty() {
            leaf.to_string()
        } else {
            format!("{}.{}", self.prefix, leaf)
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if !self.prefix.is_empty() {
            check_name_segment(&self.prefix)?;
        }
        for quantity in Quantity::ALL {
            let leaf = self.names.get(quantity);
            if leaf.is_empty() {
                return Err(ConfigError::InvalidMetricName {
                    name: leaf.to_string(),
                    reason: "empty",
                });
            }
            check_name_segment(leaf)?;
        }
        Ok(())
    }
}

fn check_name_segment(name: &str) -> Result<(), ConfigError> {
    if name.chars().any(char::is_whitespace) {
        return Err(ConfigError::InvalidMetricName {
            name: name.to_string(),
            reason: "contains whitespace",
        });
    }
    if name.contains(RESERVED_CHARS) {
        return Err(ConfigError::InvalidMetricName {
            name: name.to_string(),
            reason: "contains one of ':', '|', '@', '#'",
        });
    }
    Ok(())
}

/// Indoor (BME680 on I2C) sensor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndoorConfig {
    pub i2c_bus: u8,
    pub i2c_addr: u16,
    pub oversampling: u8,
}

impl Default for IndoorConfig {
    fn default() -> Self {
        Self {
            i2c_bus: DEFAULT_INDOOR_I2C_BUS,
            i2c_addr: u16::from(DEFAULT_INDOOR_I2C_ADDR),
            oversampling: DEFAULT_OVERSAMPLING,
        }
    }
}

/// Outdoor (1-Wire thermometer) sensor settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutdoorConfig {
    /// Device id such as `28-000005e2fdc3`; `None` picks the first probe found.
    pub w1_id: Option<String>,
}

/// Complete daemon configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub interval: Duration,
    pub init_retries: u32,
    pub sysfs_path: PathBuf,
    pub indoor: IndoorConfig,
    pub outdoor: OutdoorConfig,
    pub emitter: EmitterConfig,
}

impl Config {
    /// Creates a configuration for `graphite_host` with every other setting at
    /// its default.
    pub fn new(graphite_host: impl Into<String>) -> Self {
        Self {
            interval: DEFAULT_SAMPLE_INTERVAL,
            init_retries: 0,
            sysfs_path: PathBuf::from(DEFAULT_SYSFS_PATH),
            indoor: IndoorConfig::default(),
            outdoor: OutdoorConfig::default(),
            emitter: EmitterConfig::new(graphite_host),
        }
    }

    /// Checks the invariants that the types alone cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::InvalidDuration {
                name: "SENSORS_SAMPLE_INTERVAL",
                value: 0.0,
            });
        }
        if self.emitter.timeout.is_zero() {
            return Err(ConfigError::InvalidDuration {
                name: "GRAPHITE_TIMEOUT",
                value: 0.0,
            });
        }
        if self.indoor.i2c_addr > 0x7f {
            return Err(ConfigError::InvalidI2cAddr(self.indoor.i2c_addr));
        }
        if !OVERSAMPLING_RATIOS.contains(&self.indoor.oversampling) {
            return Err(ConfigError::InvalidOversampling(self.indoor.oversampling));
        }
        self.emitter.validate()
    }
}
