//! Pre-built mock filesystem scenarios for testing.
//!
//! These scenarios provide realistic `/sys` states as exposed by the kernel
//! `bme680` IIO driver and the `w1_therm` 1-Wire driver on a Raspberry Pi.

use super::filesystem::MockFs;

/// IIO device directory of the indoor sensor in the scenarios below.
pub const INDOOR_IIO_DIR: &str = "/sys/bus/i2c/devices/1-0076/iio:device0";

/// Device directory of the outdoor probe in the scenarios below.
pub const OUTDOOR_W1_DIR: &str = "/sys/bus/w1/devices/28-000005e2fdc3";

/// `w1_slave` contents for a valid conversion reading `milli_c`.
pub fn w1_slave(milli_c: i32) -> String {
    format!(
        "f0 00 4b 46 7f ff 10 10 4c : crc=4c YES\nf0 00 4b 46 7f ff 10 10 4c t={}\n",
        milli_c
    )
}

impl MockFs {
    /// Both sensors present: BME680 at `1-0076` reading 21.5 °C, 1013.2 hPa,
    /// 45.0 %RH and a DS18B20 reading 15.0 °C.
    pub fn weather_station() -> Self {
        let fs = Self::indoor_only();
        fs.add_outdoor_probe("28-000005e2fdc3", 15000);
        fs
    }

    /// Only the BME680 is wired up; the 1-Wire bus has its master but no probes.
    pub fn indoor_only() -> Self {
        let fs = Self::new();

        fs.add_file(format!("{INDOOR_IIO_DIR}/name"), "bme680\n");
        fs.add_file(format!("{INDOOR_IIO_DIR}/in_temp_input"), "21500\n");
        fs.add_file(
            format!("{INDOOR_IIO_DIR}/in_pressure_input"),
            "101.320000000\n",
        );
        fs.add_file(
            format!("{INDOOR_IIO_DIR}/in_humidityrelative_input"),
            "45.000000000\n",
        );
        fs.add_file(format!("{INDOOR_IIO_DIR}/in_temp_oversampling_ratio"), "2\n");
        fs.add_file(
            format!("{INDOOR_IIO_DIR}/in_pressure_oversampling_ratio"),
            "4\n",
        );
        fs.add_file(
            format!("{INDOOR_IIO_DIR}/in_humidityrelative_oversampling_ratio"),
            "1\n",
        );
        // Driver-bound I2C device directory also carries non-IIO entries.
        fs.add_file("/sys/bus/i2c/devices/1-0076/name", "bme680\n");

        fs.add_dir("/sys/bus/w1/devices/w1_bus_master1");
        fs
    }

    /// Only a DS18B20 probe is present; no device is bound on the I2C bus.
    pub fn outdoor_only() -> Self {
        let fs = Self::new();
        fs.add_dir("/sys/bus/i2c/devices/i2c-1");
        fs.add_dir("/sys/bus/w1/devices/w1_bus_master1");
        fs.add_outdoor_probe("28-000005e2fdc3", 15000);
        fs
    }

    /// A host without any sensor attached.
    pub fn no_sensors() -> Self {
        let fs = Self::new();
        fs.add_dir("/sys/bus/i2c/devices/i2c-1");
        fs.add_dir("/sys/bus/w1/devices/w1_bus_master1");
        fs
    }

    /// Adds a 1-Wire thermometer with the given device id and reading.
    pub fn add_outdoor_probe(&self, id: &str, milli_c: i32) {
        self.add_file(
            format!("/sys/bus/w1/devices/{id}/w1_slave"),
            w1_slave(milli_c),
        );
    }
}
