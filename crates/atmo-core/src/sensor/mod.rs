//! Sensor readers.
//!
//! Each reader is a long-lived handle: created and initialized once at
//! startup, read once per tick and released when dropped at shutdown.
//!
//! ```text
//!   IndoorSensor (trait)            OutdoorSensor (trait)
//!         │                                 │
//!   ┌─────▼──────┐                   ┌──────▼──────┐
//!   │  Bme680    │  iio:deviceN      │  W1Therm    │  w1_slave
//!   └─────┬──────┘                   └──────┬──────┘
//!         └──────────────┬──────────────────┘
//!                 ┌──────▼──────┐
//!                 │  FileSystem │ (RealFs / MockFs)
//!                 └─────────────┘
//! ```

pub mod bme680;
pub mod w1_therm;

use std::path::PathBuf;

use thiserror::Error;

pub use bme680::Bme680;
pub use w1_therm::W1Therm;

/// Fatal error raised while opening a sensor at startup.
#[derive(Debug, Error)]
pub enum SensorInitError {
    #[error("{sensor}: no device found at {}", .path.display())]
    NotFound {
        sensor: &'static str,
        path: PathBuf,
    },

    #[error("{sensor}: device {id} not found")]
    UnknownDevice { sensor: &'static str, id: String },

    #[error("{sensor}: failed to configure {}: {source}", .path.display())]
    Configure {
        sensor: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Recoverable error raised by a single read.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SensorError {
    #[error("sensor not initialized")]
    NotInitialized,

    #[error("read failed: {0}")]
    ReadFailure(String),
}

/// One reading of the indoor sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndoorReading {
    /// Degrees Celsius.
    pub temperature: f64,
    /// Hectopascals.
    pub pressure: f64,
    /// Percent relative humidity.
    pub humidity: f64,
}

/// One reading of the outdoor sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutdoorReading {
    /// Degrees Celsius.
    pub temperature: f64,
}

/// Temperature, pressure and humidity sensor.
pub trait IndoorSensor {
    /// Short human-readable description for logs.
    fn describe(&self) -> String;

    /// Performs one blocking measurement. Never retries.
    fn read(&mut self) -> Result<IndoorReading, SensorError>;
}

/// Single-value temperature probe.
pub trait OutdoorSensor {
    /// Short human-readable description for logs.
    fn describe(&self) -> String;

    /// Performs one blocking measurement. Never retries.
    fn read(&mut self) -> Result<OutdoorReading, SensorError>;
}

/// Parses a kernel fixed-point decimal and multiplies it by `10^shift`.
///
/// The shift is applied to the decimal text before conversion, so
/// `"101.320000000"` with shift 1 yields exactly `1013.2`.
pub(crate) fn parse_fixed_point(raw: &str, shift: i32) -> Option<f64> {
    let s = raw.trim();
    let (negative, unsigned) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };

    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }

    let digits = format!("{int_part}{frac_part}");
    let point = int_part.len() as i64 + i64::from(shift);

    let text = if point <= 0 {
        format!("0.{}{}", "0".repeat(point.unsigned_abs() as usize), digits)
    } else if point as usize >= digits.len() {
        format!("{}{}", digits, "0".repeat(point as usize - digits.len()))
    } else {
        let (head, tail) = digits.split_at(point as usize);
        format!("{head}.{tail}")
    };

    let value: f64 = text.parse().ok()?;
    Some(if negative { -value } else { value })
}
