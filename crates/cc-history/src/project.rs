//! Project root detection.

use crate::error::{HistoryError, Result};
use crate::paths;
use git2::Repository;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// A detected project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    /// Absolute, canonical project root
    pub root: PathBuf,

    /// Whether the root is the work directory of a git repository
    pub is_repository: bool,

    /// Whether `<root>/.claude/history` exists
    pub has_local_store: bool,
}

/// Find the project containing `start`.
///
/// The root is the work directory of the enclosing git repository, or `start`
/// itself outside of one (and for bare repositories).
pub fn detect_project(start: &Path) -> Result<ProjectInfo> {
    let start = start.canonicalize().map_err(|e| {
        HistoryError::invalid_input(format!("Cannot resolve {}: {}", start.display(), e))
    })?;

    let workdir = match Repository::discover(&start) {
        Ok(repo) => repo.workdir().and_then(|dir| dir.canonicalize().ok()),
        Err(e) => {
            debug!("No git repository above {}: {}", start.display(), e.message());
            None
        }
    };

    let is_repository = workdir.is_some();
    let root = workdir.unwrap_or(start);

    Ok(ProjectInfo {
        has_local_store: paths::path_exists(&paths::local_history_path(&root)),
        is_repository,
        root,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_detects_repository_root_from_subdirectory() {
        let temp = TempDir::new().unwrap();
        Repository::init(temp.path()).unwrap();
        let nested = temp.path().join("src/deep");
        std::fs::create_dir_all(&nested).unwrap();

        let info = detect_project(&nested).unwrap();
        assert!(info.is_repository);
        assert_eq!(info.root, temp.path().canonicalize().unwrap());
        assert!(!info.has_local_store);
    }

    #[test]
    fn test_falls_back_to_start_directory() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("plain");
        std::fs::create_dir_all(dir.join(".claude/history")).unwrap();

        let info = detect_project(&dir).unwrap();
        assert_eq!(info.root, dir.canonicalize().unwrap());
        assert!(info.has_local_store);
    }

    #[test]
    fn test_missing_directory_is_rejected() {
        let err = detect_project(Path::new("/nonexistent/project")).unwrap_err();
        assert!(matches!(err, HistoryError::InvalidInput(_)));
    }
}
