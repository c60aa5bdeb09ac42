//! In-memory mock filesystem for testing sensor adapters without real `/sys`.
//!
//! This module provides `MockFs` which simulates a filesystem in memory,
//! allowing tests to run on any host and in CI environments without hardware.

use crate::sysfs::traits::FileSystem;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Default)]
struct Tree {
    /// Map from path to file contents.
    files: HashMap<PathBuf, String>,
    /// Set of directories (for read_dir support).
    directories: HashSet<PathBuf>,
    /// Files whose reads and writes fail with `EIO`, as a flaky bus would.
    failing: HashSet<PathBuf>,
}

impl Tree {
    fn add_parents(&mut self, path: &Path) {
        let mut parent = path.parent();
        while let Some(p) = parent {
            if !p.as_os_str().is_empty() {
                self.directories.insert(p.to_path_buf());
            }
            parent = p.parent();
        }
    }
}

/// In-memory filesystem for testing.
///
/// Clones share the same tree, so a test can keep a handle, give a clone to a
/// sensor and then change attribute contents between reads or inspect what
/// the sensor wrote.
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    tree: Arc<RwLock<Tree>>,
}

impl MockFs {
    /// Creates a new empty mock filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file with the given content, replacing any previous content.
    ///
    /// Parent directories are automatically created.
    pub fn add_file(&self, path: impl AsRef<Path>, content: impl Into<String>) {
        let path = path.as_ref().to_path_buf();
        let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);
        tree.add_parents(&path);
        tree.files.insert(path, content.into());
    }

    /// Adds an empty directory.
    pub fn add_dir(&self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);
        tree.add_parents(&path);
        tree.directories.insert(path);
    }

    /// Removes a file, as when a device is unplugged.
    pub fn remove_file(&self, path: impl AsRef<Path>) {
        let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);
        tree.files.remove(path.as_ref());
    }

    /// Makes every access to `path` fail with an I/O error until
    /// [`MockFs::heal`] is called.
    pub fn fail_io(&self, path: impl AsRef<Path>) {
        let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);
        tree.failing.insert(path.as_ref().to_path_buf());
    }

    /// Clears all injected I/O failures.
    pub fn heal(&self) {
        let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);
        tree.failing.clear();
    }

    /// Returns the current contents of a file, if it exists.
    pub fn contents(&self, path: impl AsRef<Path>) -> Option<String> {
        let tree = self.tree.read().unwrap_or_else(PoisonError::into_inner);
        tree.files.get(path.as_ref()).cloned()
    }
}

fn injected_failure(path: &Path) -> io::Error {
    io::Error::other(format!("injected I/O error: {:?}", path))
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        let tree = self.tree.read().unwrap_or_else(PoisonError::into_inner);
        if tree.failing.contains(path) {
            return Err(injected_failure(path));
        }
        tree.files.get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("file not found: {:?}", path),
            )
        })
    }

    fn write_str(&self, path: &Path, contents: &str) -> io::Result<()> {
        let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);
        if tree.failing.contains(path) {
            return Err(injected_failure(path));
        }
        match tree.files.get_mut(path) {
            Some(file) => {
                *file = contents.to_string();
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("file not found: {:?}", path),
            )),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        let tree = self.tree.read().unwrap_or_else(PoisonError::into_inner);
        tree.files.contains_key(path) || tree.directories.contains(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let tree = self.tree.read().unwrap_or_else(PoisonError::into_inner);
        if !tree.directories.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("directory not found: {:?}", path),
            ));
        }

        let mut entries = HashSet::new();

        // Find all files and directories that are direct children
        for file_path in tree.files.keys() {
            if file_path.parent().is_some_and(|parent| parent == path) {
                entries.insert(file_path.clone());
            }
        }

        for dir_path in &tree.directories {
            if dir_path.parent().is_some_and(|parent| parent == path) && dir_path != path {
                entries.insert(dir_path.clone());
            }
        }

        Ok(entries.into_iter().collect())
    }
}
