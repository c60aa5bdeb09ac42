//! Abstractions for sysfs access to enable testing and mocking.
//!
//! The `FileSystem` trait allows the sensor adapters to work with both the real
//! `/sys` tree on Linux and an in-memory implementation for tests and CI.

use std::io;
use std::path::{Path, PathBuf};

/// Abstraction for filesystem operations.
///
/// Sensor drivers live in the kernel; their attributes are plain files, so this
/// is the whole surface the adapters need.
pub trait FileSystem: Send + Sync {
    /// Reads the entire contents of a file as a string.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Writes `contents` to an existing attribute file.
    ///
    /// sysfs attributes cannot be created, so implementations must fail with
    /// `NotFound` when the file does not exist.
    fn write_str(&self, path: &Path, contents: &str) -> io::Result<()>;

    /// Checks if a path exists.
    fn exists(&self, path: &Path) -> bool;

    /// Lists entries in a directory.
    ///
    /// # Returns
    /// A vector of paths to entries in the directory, or an I/O error.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
}

/// Real filesystem implementation that delegates to `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl RealFs {
    /// Creates a new `RealFs` instance.
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn write_str(&self, path: &Path, contents: &str) -> io::Result<()> {
        // Never create: a missing attribute means the driver does not support it.
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(path)?;
        io::Write::write_all(&mut file, contents.as_bytes())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(path)?;
        let mut paths = Vec::new();
        for entry in entries {
            paths.push(entry?.path());
        }
        Ok(paths)
    }
}
