//! State directory management.
//!
//! Provides the directory layout shared by the CLI and the server.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Directory structure under the Kiln state directory:
///
/// ```text
/// <state_dir>/
/// ├── scratch/          # Per-build contexts, removed when each build returns
/// ├── records/          # Append-only execution records (JSON lines)
/// └── functions.json    # Function definitions by name
/// ```
#[derive(Debug, Clone)]
pub struct KilnDirs {
    /// The state directory itself.
    pub state_dir: PathBuf,

    /// Parent of every build context directory.
    pub scratch_dir: PathBuf,

    /// Execution record files.
    pub records_dir: PathBuf,
}

impl KilnDirs {
    /// Create the directory structure, creating directories as needed.
    ///
    /// # Errors
    /// Returns an error if directory creation fails.
    pub fn from_state_dir(state_dir: &Path) -> Result<Self> {
        let scratch_dir = state_dir.join("scratch");
        let records_dir = state_dir.join("records");

        fs::create_dir_all(&scratch_dir)?;
        fs::create_dir_all(&records_dir)?;

        Ok(Self {
            state_dir: state_dir.to_path_buf(),
            scratch_dir,
            records_dir,
        })
    }

    pub fn functions_file(&self) -> PathBuf {
        self.state_dir.join("functions.json")
    }

    pub fn records_file(&self) -> PathBuf {
        self.records_dir.join("executions.jsonl")
    }

    /// Remove build contexts left behind by a previous process.
    ///
    /// Returns the number of entries removed.
    pub fn clean_scratch(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.scratch_dir)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
            removed += 1;
        }
        Ok(removed)
    }

    /// Number of entries currently in the scratch directory.
    pub fn scratch_entries(&self) -> Result<usize> {
        Ok(fs::read_dir(&self.scratch_dir)?.count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_from_state_dir() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let dirs = KilnDirs::from_state_dir(&temp.path().join("kiln")).expect("Failed to create dirs");

        assert!(dirs.scratch_dir.exists());
        assert!(dirs.records_dir.exists());
        assert!(dirs.functions_file().ends_with("functions.json"));
        assert_eq!(dirs.scratch_entries().unwrap(), 0);
    }

    #[test]
    fn test_clean_scratch() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let dirs = KilnDirs::from_state_dir(temp.path()).expect("Failed to create dirs");

        fs::create_dir_all(dirs.scratch_dir.join("kiln-build-stale")).unwrap();
        fs::write(dirs.scratch_dir.join("leftover"), "x").unwrap();

        assert_eq!(dirs.clean_scratch().unwrap(), 2);
        assert_eq!(dirs.scratch_entries().unwrap(), 0);
        assert!(dirs.scratch_dir.exists());
    }
}
