//! Common test utilities for cc-history integration tests.

#![allow(dead_code)]

use cc_history::{GlobalLayout, SyncEngine, paths};
use filetime::{FileTime, set_file_mtime};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// A global store and one project inside a temporary directory.
pub struct Fixture {
    pub temp: TempDir,
    pub global: PathBuf,
    pub project: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let global = temp.path().join("global");
        let project = temp.path().join("work/app");
        std::fs::create_dir_all(&global).unwrap();
        std::fs::create_dir_all(&project).unwrap();
        Self {
            temp,
            global,
            project,
        }
    }

    pub fn engine(&self, layout: GlobalLayout) -> SyncEngine {
        SyncEngine::new(&self.global, layout)
    }

    /// The project's directory in the per-project global layout.
    pub fn global_project_dir(&self) -> PathBuf {
        paths::global_project_path(&self.global, &self.project)
    }

    /// The shared directory of the flat global layout.
    pub fn global_flat_dir(&self) -> PathBuf {
        paths::global_history_path(&self.global)
    }

    pub fn local_history(&self) -> PathBuf {
        paths::local_history_path(&self.project)
    }

    /// A conversation recorded in this fixture's project.
    pub fn member_conversation(&self) -> String {
        conversation_for(&self.project)
    }
}

/// One JSONL conversation whose working directory is `project`.
pub fn conversation_for(project: &Path) -> String {
    let records = [
        serde_json::json!({"type": "summary", "summary": "Fix flaky test"}),
        serde_json::json!({
            "type": "user",
            "cwd": project.to_string_lossy(),
            "message": {"role": "user", "content": "why does this fail?"}
        }),
        serde_json::json!({
            "type": "assistant",
            "cwd": project.to_string_lossy(),
            "message": {"role": "assistant", "content": "a race in setup"}
        }),
    ];
    records
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Write `content` to `path` (creating parents) and set its mtime.
pub fn write_file(path: &Path, content: &str, mtime_secs: i64) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
    set_mtime(path, mtime_secs);
}

pub fn set_mtime(path: &Path, mtime_secs: i64) {
    set_file_mtime(path, FileTime::from_unix_time(mtime_secs, 0)).unwrap();
}

pub fn mtime_secs(path: &Path) -> i64 {
    FileTime::from_last_modification_time(&std::fs::metadata(path).unwrap()).unix_seconds()
}

pub fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

/// Sorted file names in `dir`.
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn wait_for<F>(condition: F) -> bool
where
    F: FnMut() -> bool,
{
    wait_for_within(Duration::from_secs(2), condition).await
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_for_within<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
