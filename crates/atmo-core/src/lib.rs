//! atmo-core - library behind the `atmod` weather station daemon.
//!
//! Provides:
//! - `config` - immutable daemon configuration and its validation
//! - `sysfs` - filesystem abstraction over kernel sensor attributes (real and mock)
//! - `sensor` - indoor (BME680) and outdoor (1-Wire) sensor readers
//! - `sample` - readings, sample sets and the per-tick aggregator
//! - `emitter` - StatsD gauge serialization and UDP transport
//! - `scheduler` - the fixed-interval sample-and-emit loop

pub mod config;
pub mod emitter;
pub mod sample;
pub mod scheduler;
pub mod sensor;
pub mod sysfs;
