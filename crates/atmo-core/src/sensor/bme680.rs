//! BME680 indoor sensor read through the kernel `bme680` IIO driver.
//!
//! The driver binds the chip at `<bus>-<addr>` on the I2C bus and exposes an
//! `iio:deviceN` directory below it. The driver reports temperature in milli
//! degrees Celsius, pressure in kilopascals and relative humidity in whole
//! percent (unlike the milli percent of the generic IIO ABI).

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{IndoorReading, IndoorSensor, SensorError, SensorInitError, parse_fixed_point};
use crate::config::IndoorConfig;
use crate::sysfs::FileSystem;

const SENSOR: &str = "indoor";

/// Channels whose oversampling ratio is configured at init.
const OVERSAMPLED_CHANNELS: [&str; 3] = ["temp", "pressure", "humidityrelative"];

/// Indoor sensor handle.
pub struct Bme680<F: FileSystem> {
    fs: F,
    sysfs_path: PathBuf,
    config: IndoorConfig,
    /// `iio:deviceN` directory, set by a successful `init`.
    device_dir: Option<PathBuf>,
    /// Set after a failed read; the chip may have been reset.
    needs_configure: bool,
}

impl<F: FileSystem> Bme680<F> {
    /// Creates an unopened handle. [`Bme680::init`] must succeed before reads.
    pub fn new(fs: F, sysfs_path: impl Into<PathBuf>, config: &IndoorConfig) -> Self {
        Self {
            fs,
            sysfs_path: sysfs_path.into(),
            config: config.clone(),
            device_dir: None,
            needs_configure: false,
        }
    }

    /// Directory of the I2C client, e.g. `/sys/bus/i2c/devices/1-0076`.
    pub fn i2c_device_dir(&self) -> PathBuf {
        self.sysfs_path.join("bus/i2c/devices").join(format!(
            "{}-{:04x}",
            self.config.i2c_bus, self.config.i2c_addr
        ))
    }

    /// Returns the IIO device directory once initialized.
    pub fn device_dir(&self) -> Option<&Path> {
        self.device_dir.as_deref()
    }

    /// Locates the IIO device and applies the oversampling settings.
    pub fn init(&mut self) -> Result<(), SensorInitError> {
        let i2c_dir = self.i2c_device_dir();
        let not_found = || SensorInitError::NotFound {
            sensor: SENSOR,
            path: i2c_dir.clone(),
        };

        let entries = self.fs.read_dir(&i2c_dir).map_err(|_| not_found())?;
        let iio_dir = entries
            .into_iter()
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("iio:device"))
            })
            .min()
            .ok_or_else(not_found)?;

        self.configure(&iio_dir)
            .map_err(|(path, source)| SensorInitError::Configure {
                sensor: SENSOR,
                path,
                source,
            })?;

        info!(
            "Indoor sensor: {} (oversampling x{})",
            iio_dir.display(),
            self.config.oversampling
        );
        self.device_dir = Some(iio_dir);
        self.needs_configure = false;
        Ok(())
    }

    fn configure(&self, dir: &Path) -> Result<(), (PathBuf, io::Error)> {
        let ratio = self.config.oversampling.to_string();
        for channel in OVERSAMPLED_CHANNELS {
            let path = dir.join(format!("in_{channel}_oversampling_ratio"));
            if !self.fs.exists(&path) {
                debug!("{}: no oversampling control for {}", SENSOR, channel);
                continue;
            }
            self.fs.write_str(&path, &ratio).map_err(|e| (path, e))?;
        }
        Ok(())
    }

    fn read_channel(&self, dir: &Path, attribute: &str, shift: i32) -> Result<f64, SensorError> {
        let path = dir.join(attribute);
        let raw = self
            .fs
            .read_to_string(&path)
            .map_err(|e| SensorError::ReadFailure(format!("{}: {}", path.display(), e)))?;
        parse_fixed_point(&raw, shift).ok_or_else(|| {
            SensorError::ReadFailure(format!(
                "{}: unparsable value {:?}",
                path.display(),
                raw.trim()
            ))
        })
    }

    fn measure(&self, dir: &Path) -> Result<IndoorReading, SensorError> {
        Ok(IndoorReading {
            temperature: self.read_channel(dir, "in_temp_input", -3)?,
            pressure: self.read_channel(dir, "in_pressure_input", 1)?,
            humidity: self.read_channel(dir, "in_humidityrelative_input", 0)?,
        })
    }
}

impl<F: FileSystem> IndoorSensor for Bme680<F> {
    fn describe(&self) -> String {
        format!(
            "BME680 at i2c-{} {:#04x}",
            self.config.i2c_bus, self.config.i2c_addr
        )
    }

    fn read(&mut self) -> Result<IndoorReading, SensorError> {
        let Some(dir) = self.device_dir.clone() else {
            return Err(SensorError::NotInitialized);
        };

        if self.needs_configure {
            self.configure(&dir).map_err(|(path, e)| {
                SensorError::ReadFailure(format!("reconfigure {}: {}", path.display(), e))
            })?;
            self.needs_configure = false;
            debug!("{}: oversampling re-applied", SENSOR);
        }

        let result = self.measure(&dir);
        if result.is_err() {
            self.needs_configure = true;
        }
        result
    }
}

impl<F: FileSystem> Drop for Bme680<F> {
    fn drop(&mut self) {
        if let Some(dir) = self.device_dir.take() {
            debug!("Released indoor sensor {}", dir.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysfs::MockFs;
    use crate::sysfs::mock::scenarios::INDOOR_IIO_DIR;

    fn open(fs: &MockFs) -> Bme680<MockFs> {
        let mut sensor = Bme680::new(fs.clone(), "/sys", &IndoorConfig::default());
        sensor.init().unwrap();
        sensor
    }

    #[test]
    fn test_read_before_init_fails() {
        let fs = MockFs::weather_station();
        let mut sensor = Bme680::new(fs, "/sys", &IndoorConfig::default());
        assert_eq!(sensor.read(), Err(SensorError::NotInitialized));
    }

    #[test]
    fn test_init_locates_device_and_configures_oversampling() {
        let fs = MockFs::weather_station();
        let sensor = open(&fs);

        assert_eq!(sensor.device_dir(), Some(Path::new(INDOOR_IIO_DIR)));
        for channel in OVERSAMPLED_CHANNELS {
            let attr = format!("{INDOOR_IIO_DIR}/in_{channel}_oversampling_ratio");
            assert_eq!(fs.contents(attr).as_deref(), Some("8"));
        }
    }

    #[test]
    fn test_init_without_device_fails() {
        let fs = MockFs::outdoor_only();
        let mut sensor = Bme680::new(fs, "/sys", &IndoorConfig::default());

        let err = sensor.init().unwrap_err();
        assert!(matches!(err, SensorInitError::NotFound { .. }));
        assert!(err.to_string().contains("1-0076"));
        assert_eq!(sensor.read(), Err(SensorError::NotInitialized));
    }

    #[test]
    fn test_init_uses_configured_address() {
        let fs = MockFs::weather_station();
        let config = IndoorConfig {
            i2c_addr: 0x77,
            ..IndoorConfig::default()
        };
        let mut sensor = Bme680::new(fs, "/sys", &config);
        assert_eq!(
            sensor.i2c_device_dir(),
            PathBuf::from("/sys/bus/i2c/devices/1-0077")
        );
        assert!(sensor.init().is_err());
    }

    #[test]
    fn test_init_fails_when_oversampling_cannot_be_set() {
        let fs = MockFs::weather_station();
        fs.fail_io(format!("{INDOOR_IIO_DIR}/in_pressure_oversampling_ratio"));
        let mut sensor = Bme680::new(fs, "/sys", &IndoorConfig::default());

        assert!(matches!(
            sensor.init(),
            Err(SensorInitError::Configure { .. })
        ));
    }

    #[test]
    fn test_init_skips_missing_oversampling_controls() {
        let fs = MockFs::weather_station();
        fs.remove_file(format!(
            "{INDOOR_IIO_DIR}/in_humidityrelative_oversampling_ratio"
        ));
        let mut sensor = Bme680::new(fs, "/sys", &IndoorConfig::default());
        assert!(sensor.init().is_ok());
    }

    #[test]
    fn test_read_decodes_iio_units() {
        let fs = MockFs::weather_station();
        let mut sensor = open(&fs);

        let reading = sensor.read().unwrap();
        assert_eq!(
            reading,
            IndoorReading {
                temperature: 21.5,
                pressure: 1013.2,
                humidity: 45.0,
            }
        );
    }

    #[test]
    fn test_read_humidity_as_driver_formats_it() {
        let fs = MockFs::weather_station();
        let mut sensor = open(&fs);
        fs.add_file(
            format!("{INDOOR_IIO_DIR}/in_humidityrelative_input"),
            "45.123000000\n",
        );

        assert_eq!(sensor.read().unwrap().humidity, 45.123);
    }

    #[test]
    fn test_read_failure_is_reported_without_retry() {
        let fs = MockFs::weather_station();
        let mut sensor = open(&fs);
        fs.fail_io(format!("{INDOOR_IIO_DIR}/in_humidityrelative_input"));

        assert!(matches!(sensor.read(), Err(SensorError::ReadFailure(_))));
    }

    #[test]
    fn test_unparsable_value_is_read_failure() {
        let fs = MockFs::weather_station();
        let mut sensor = open(&fs);
        fs.add_file(format!("{INDOOR_IIO_DIR}/in_temp_input"), "garbage\n");

        let err = sensor.read().unwrap_err();
        assert!(err.to_string().contains("unparsable"));
    }

    #[test]
    fn test_failed_read_reapplies_oversampling() {
        let fs = MockFs::weather_station();
        let mut sensor = open(&fs);
        let ratio_attr = format!("{INDOOR_IIO_DIR}/in_temp_oversampling_ratio");

        // Simulate a chip reset: transient failure and settings back to default.
        fs.fail_io(format!("{INDOOR_IIO_DIR}/in_temp_input"));
        assert!(sensor.read().is_err());
        fs.heal();
        fs.add_file(&ratio_attr, "1\n");

        assert!(sensor.read().is_ok());
        assert_eq!(fs.contents(&ratio_attr).as_deref(), Some("8"));
    }

    #[test]
    fn test_failed_reconfigure_is_read_failure() {
        let fs = MockFs::weather_station();
        let mut sensor = open(&fs);

        fs.fail_io(format!("{INDOOR_IIO_DIR}/in_temp_input"));
        assert!(sensor.read().is_err());
        fs.heal();
        fs.fail_io(format!("{INDOOR_IIO_DIR}/in_temp_oversampling_ratio"));

        let err = sensor.read().unwrap_err();
        assert!(err.to_string().contains("reconfigure"));
    }
}
