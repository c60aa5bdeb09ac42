//! 1-Wire thermometer (DS18B20 and relatives) read through the kernel
//! `w1_therm` driver.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{OutdoorReading, OutdoorSensor, SensorError, SensorInitError, parse_fixed_point};
use crate::config::OutdoorConfig;
use crate::sysfs::FileSystem;

const SENSOR: &str = "outdoor";

/// 1-Wire family codes of thermometers handled by `w1_therm`
/// (DS18S20, DS1822, DS18B20, DS1825, DS28EA00).
const THERM_FAMILIES: [&str; 5] = ["10", "22", "28", "3b", "42"];

/// Value latched by a DS18B20 after power-on, before any conversion ran.
const POWER_ON_RESET_VALUE: &str = "85000";

/// Outdoor sensor handle.
pub struct W1Therm<F: FileSystem> {
    fs: F,
    sysfs_path: PathBuf,
    config: OutdoorConfig,
    device_dir: Option<PathBuf>,
}

impl<F: FileSystem> W1Therm<F> {
    /// Creates an unopened handle. [`W1Therm::init`] must succeed before reads.
    pub fn new(fs: F, sysfs_path: impl Into<PathBuf>, config: &OutdoorConfig) -> Self {
        Self {
            fs,
            sysfs_path: sysfs_path.into(),
            config: config.clone(),
            device_dir: None,
        }
    }

    /// Directory listing every device on the 1-Wire bus.
    pub fn devices_dir(&self) -> PathBuf {
        self.sysfs_path.join("bus/w1/devices")
    }

    /// Returns the probe directory once initialized.
    pub fn device_dir(&self) -> Option<&Path> {
        self.device_dir.as_deref()
    }

    /// Selects the configured probe, or the first thermometer on the bus.
    pub fn init(&mut self) -> Result<(), SensorInitError> {
        let devices_dir = self.devices_dir();
        let entries =
            self.fs
                .read_dir(&devices_dir)
                .map_err(|_| SensorInitError::NotFound {
                    sensor: SENSOR,
                    path: devices_dir.clone(),
                })?;

        let mut probes: Vec<PathBuf> = entries
            .into_iter()
            .filter(|path| device_id(path).is_some_and(is_thermometer))
            .collect();
        probes.sort();
        debug!("{}: {} thermometer(s) on the bus", SENSOR, probes.len());

        let probe = match &self.config.w1_id {
            Some(id) => probes
                .into_iter()
                .find(|path| device_id(path) == Some(id.as_str()))
                .ok_or_else(|| SensorInitError::UnknownDevice {
                    sensor: SENSOR,
                    id: id.clone(),
                })?,
            None => probes
                .into_iter()
                .next()
                .ok_or(SensorInitError::NotFound {
                    sensor: SENSOR,
                    path: devices_dir,
                })?,
        };

        info!("Outdoor sensor: {}", probe.display());
        self.device_dir = Some(probe);
        Ok(())
    }
}

fn device_id(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}

fn is_thermometer(id: &str) -> bool {
    id.split_once('-').is_some_and(|(family, _)| {
        THERM_FAMILIES
            .iter()
            .any(|known| family.eq_ignore_ascii_case(known))
    })
}

/// Parses the two-line `w1_slave` attribute into degrees Celsius.
fn parse_w1_slave(raw: &str) -> Result<f64, SensorError> {
    let mut lines = raw.lines();

    let crc_line = lines.next().unwrap_or_default();
    if !crc_line.trim_end().ends_with("YES") {
        return Err(SensorError::ReadFailure("CRC check failed".to_string()));
    }

    let value = lines
        .next()
        .and_then(|line| line.rsplit_once("t="))
        .map(|(_, value)| value.trim())
        .ok_or_else(|| SensorError::ReadFailure("missing temperature field".to_string()))?;

    if value == POWER_ON_RESET_VALUE {
        return Err(SensorError::ReadFailure(
            "power-on reset value (85 °C), no conversion yet".to_string(),
        ));
    }

    parse_fixed_point(value, -3)
        .ok_or_else(|| SensorError::ReadFailure(format!("unparsable value {:?}", value)))
}

impl<F: FileSystem> OutdoorSensor for W1Therm<F> {
    fn describe(&self) -> String {
        match self.device_dir.as_deref().and_then(device_id) {
            Some(id) => format!("1-Wire thermometer {id}"),
            None => "1-Wire thermometer".to_string(),
        }
    }

    fn read(&mut self) -> Result<OutdoorReading, SensorError> {
        let Some(dir) = self.device_dir.as_deref() else {
            return Err(SensorError::NotInitialized);
        };

        let path = dir.join("w1_slave");
        let raw = self
            .fs
            .read_to_string(&path)
            .map_err(|e| SensorError::ReadFailure(format!("{}: {}", path.display(), e)))?;

        Ok(OutdoorReading {
            temperature: parse_w1_slave(&raw)?,
        })
    }
}

impl<F: FileSystem> Drop for W1Therm<F> {
    fn drop(&mut self) {
        if let Some(dir) = self.device_dir.take() {
            debug!("Released outdoor sensor {}", dir.display());
        }
    }
}
