//! Access to kernel-exposed sensor attributes.
//!
//! Bus protocols (I2C, 1-Wire) are handled by the kernel drivers; the adapters
//! in [`crate::sensor`] only read and write attribute files under `/sys`.
//!
//! ```
//! use std::path::Path;
//! use atmo_core::sysfs::{FileSystem, MockFs};
//!
//! let fs = MockFs::weather_station();
//! assert!(fs.exists(Path::new("/sys/bus/w1/devices/28-000005e2fdc3/w1_slave")));
//! ```

pub mod mock;
pub mod traits;

pub use mock::MockFs;
pub use traits::{FileSystem, RealFs};

/// Default mount point of sysfs.
pub const DEFAULT_SYSFS_PATH: &str = "/sys";
