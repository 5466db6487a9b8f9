//! Single-writer lock file.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Exclusive `<db>.lock` file held for the duration of a run.
///
/// Removed on drop. A crashed run leaves the file behind; it must be deleted
/// by hand after checking no other process is running.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Lock path for a database path.
    pub fn path_for(db_path: &Path) -> PathBuf {
        let mut name = db_path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    pub fn acquire(db_path: &Path) -> Result<Self> {
        let path = Self::path_for(db_path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                anyhow::bail!(
                    "Another run holds {}; remove it if no other process is running",
                    path.display()
                );
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create lock {}", path.display()));
            }
        };
        writeln!(file, "{}", std::process::id())?;

        debug!(lock = %path.display(), "Run lock acquired");
        Ok(Self { path })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %e, "Failed to release run lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_lock_is_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("rebalancer.db");

        let first = RunLock::acquire(&db).unwrap();
        assert!(RunLock::path_for(&db).exists());
        assert!(RunLock::acquire(&db).is_err());

        drop(first);
        assert!(!RunLock::path_for(&db).exists());
        assert!(RunLock::acquire(&db).is_ok());
    }
}
