//! In-memory sysfs for tests and for running the daemon on hosts without sensors.

mod filesystem;
pub mod scenarios;

pub use filesystem::MockFs;
