//! Readings, sample sets and the per-tick aggregator.

use chrono::Utc;
use serde::Serialize;
use tracing::warn;

use crate::sensor::{IndoorSensor, OutdoorSensor};

/// A measured quantity. Declaration order is the order of a [`SampleSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    TemperatureIndoor,
    Pressure,
    Humidity,
    TemperatureOutdoor,
}

impl Quantity {
    /// All quantities in sample order.
    pub const ALL: [Quantity; 4] = [
        Quantity::TemperatureIndoor,
        Quantity::Pressure,
        Quantity::Humidity,
        Quantity::TemperatureOutdoor,
    ];

    /// Metric leaf name used when no override is configured.
    pub fn default_name(self) -> &'static str {
        match self {
            Quantity::TemperatureIndoor => "temperature_indoor",
            Quantity::Pressure => "pressure",
            Quantity::Humidity => "humidity",
            Quantity::TemperatureOutdoor => "temperature_outdoor",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Quantity::TemperatureIndoor | Quantity::TemperatureOutdoor => "°C",
            Quantity::Pressure => "hPa",
            Quantity::Humidity => "%RH",
        }
    }
}

/// One measured value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    pub quantity: Quantity,
    pub value: f64,
}

impl Reading {
    pub fn new(quantity: Quantity, value: f64) -> Self {
        Self { quantity, value }
    }
}

/// Readings produced in one tick. May be partial or empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleSet {
    /// UNIX timestamp (seconds) of the tick.
    pub timestamp: i64,
    pub readings: Vec<Reading>,
}

impl SampleSet {
    pub fn new(timestamp: i64) -> Self {
        Self {
            timestamp,
            readings: Vec::with_capacity(Quantity::ALL.len()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    /// Returns the value for `quantity`, if it was read this tick.
    pub fn get(&self, quantity: Quantity) -> Option<f64> {
        self.readings
            .iter()
            .find(|r| r.quantity == quantity)
            .map(|r| r.value)
    }

    fn push(&mut self, quantity: Quantity, value: f64) {
        self.readings.push(Reading::new(quantity, value));
    }
}

/// Reads both sensors once per tick and merges the results.
///
/// Owns the sensor handles for the lifetime of the process; dropping the
/// sampler releases them.
pub struct Sampler<I: IndoorSensor, O: OutdoorSensor> {
    indoor: I,
    outdoor: O,
}

impl<I: IndoorSensor, O: OutdoorSensor> Sampler<I, O> {
    pub fn new(indoor: I, outdoor: O) -> Self {
        Self { indoor, outdoor }
    }

    /// Takes one sample from each sensor.
    ///
    /// A failed sensor is logged and its readings are omitted; the other
    /// sensor is still read.
    pub fn sample(&mut self) -> SampleSet {
        let mut set = SampleSet::new(Utc::now().timestamp());

        match self.indoor.read() {
            Ok(reading) => {
                set.push(Quantity::TemperatureIndoor, reading.temperature);
                set.push(Quantity::Pressure, reading.pressure);
                set.push(Quantity::Humidity, reading.humidity);
            }
            Err(e) => warn!("Indoor sensor ({}): {}", self.indoor.describe(), e),
        }

        match self.outdoor.read() {
            Ok(reading) => set.push(Quantity::TemperatureOutdoor, reading.temperature),
            Err(e) => warn!("Outdoor sensor ({}): {}", self.outdoor.describe(), e),
        }

        set
    }

    pub fn indoor(&self) -> &I {
        &self.indoor
    }

    pub fn outdoor(&self) -> &O {
        &self.outdoor
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sensor::{IndoorReading, OutdoorReading, SensorError};
    use std::collections::VecDeque;

    /// Indoor sensor returning scripted results, then repeating the last one.
    pub(crate) struct ScriptedIndoor(pub VecDeque<Result<IndoorReading, SensorError>>);

    impl IndoorSensor for ScriptedIndoor {
        fn describe(&self) -> String {
            "scripted indoor".to_string()
        }

        fn read(&mut self) -> Result<IndoorReading, SensorError> {
            if self.0.len() > 1 {
                self.0.pop_front().unwrap()
            } else {
                self.0.front().cloned().unwrap()
            }
        }
    }

    pub(crate) struct ScriptedOutdoor(pub VecDeque<Result<OutdoorReading, SensorError>>);

    impl OutdoorSensor for ScriptedOutdoor {
        fn describe(&self) -> String {
            "scripted outdoor".to_string()
        }

        fn read(&mut self) -> Result<OutdoorReading, SensorError> {
            if self.0.len() > 1 {
                self.0.pop_front().unwrap()
            } else {
                self.0.front().cloned().unwrap()
            }
        }
    }

    pub(crate) fn indoor_ok() -> Result<IndoorReading, SensorError> {
        Ok(IndoorReading {
            temperature: 21.5,
            pressure: 1013.2,
            humidity: 45.0,
        })
    }

    pub(crate) fn outdoor_ok() -> Result<OutdoorReading, SensorError> {
        Ok(OutdoorReading { temperature: 15.0 })
    }

    pub(crate) fn read_failure() -> SensorError {
        SensorError::ReadFailure("bus timeout".to_string())
    }

    pub(crate) fn sampler(
        indoor: Result<IndoorReading, SensorError>,
        outdoor: Result<OutdoorReading, SensorError>,
    ) -> Sampler<ScriptedIndoor, ScriptedOutdoor> {
        Sampler::new(
            ScriptedIndoor(VecDeque::from([indoor])),
            ScriptedOutdoor(VecDeque::from([outdoor])),
        )
    }

    fn quantities(set: &SampleSet) -> Vec<Quantity> {
        set.readings.iter().map(|r| r.quantity).collect()
    }

    #[test]
    fn test_full_sample_in_fixed_order() {
        let set = sampler(indoor_ok(), outdoor_ok()).sample();

        assert_eq!(quantities(&set), Quantity::ALL.to_vec());
        assert_eq!(set.get(Quantity::TemperatureIndoor), Some(21.5));
        assert_eq!(set.get(Quantity::Pressure), Some(1013.2));
        assert_eq!(set.get(Quantity::Humidity), Some(45.0));
        assert_eq!(set.get(Quantity::TemperatureOutdoor), Some(15.0));
    }

    #[test]
    fn test_indoor_failure_keeps_outdoor() {
        let set = sampler(Err(read_failure()), outdoor_ok()).sample();

        assert_eq!(set.len(), 1);
        assert_eq!(quantities(&set), vec![Quantity::TemperatureOutdoor]);
    }

    #[test]
    fn test_outdoor_failure_keeps_indoor() {
        let set = sampler(indoor_ok(), Err(SensorError::NotInitialized)).sample();

        assert_eq!(
            quantities(&set),
            vec![
                Quantity::TemperatureIndoor,
                Quantity::Pressure,
                Quantity::Humidity
            ]
        );
    }

    #[test]
    fn test_both_failures_give_empty_set() {
        let set = sampler(Err(read_failure()), Err(read_failure())).sample();
        assert!(set.is_empty());
        assert!(set.timestamp > 0);
    }

    #[test]
    fn test_values_are_forwarded_unchanged() {
        let raw = IndoorReading {
            temperature: 21.123456789,
            pressure: 987.654321,
            humidity: 33.333333,
        };
        let set = sampler(Ok(raw), outdoor_ok()).sample();

        assert_eq!(set.get(Quantity::TemperatureIndoor), Some(21.123456789));
        assert_eq!(set.get(Quantity::Pressure), Some(987.654321));
        assert_eq!(set.get(Quantity::Humidity), Some(33.333333));
    }

    #[test]
    fn test_no_stale_values_after_failure() {
        let mut sampler = Sampler::new(
            ScriptedIndoor(VecDeque::from([indoor_ok(), Err(read_failure())])),
            ScriptedOutdoor(VecDeque::from([outdoor_ok()])),
        );

        assert_eq!(sampler.sample().len(), 4);
        assert_eq!(sampler.sample().len(), 1);
    }

    #[test]
    fn test_sample_set_serializes_to_json() {
        let set = sampler(Err(read_failure()), outdoor_ok()).sample();
        let json = serde_json::to_value(&set).unwrap();

        assert_eq!(json["readings"][0]["quantity"], "temperature_outdoor");
        assert_eq!(json["readings"][0]["value"], 15.0);
    }

    #[test]
    fn test_sampler_with_sysfs_sensors() {
        use crate::config::{IndoorConfig, OutdoorConfig};
        use crate::sensor::{Bme680, W1Therm};
        use crate::sysfs::MockFs;

        let fs = MockFs::weather_station();
        let mut indoor = Bme680::new(fs.clone(), "/sys", &IndoorConfig::default());
        let mut outdoor = W1Therm::new(fs, "/sys", &OutdoorConfig::default());
        indoor.init().unwrap();
        outdoor.init().unwrap();

        let set = Sampler::new(indoor, outdoor).sample();
        assert_eq!(quantities(&set), Quantity::ALL.to_vec());
        assert_eq!(set.get(Quantity::Pressure), Some(1013.2));
    }
}
