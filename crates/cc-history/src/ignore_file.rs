//! Keeps the mirrored history out of version control.
//!
//! Managed patterns live in the project's `.gitignore` below a marker line so
//! they can be removed again without touching anything else.

use crate::error::Result;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Marker line preceding managed patterns.
pub const IGNORE_MARKER: &str = "# cc-history";

const IGNORE_FILE: &str = ".gitignore";

pub fn ignore_file_path(project_root: &Path) -> PathBuf {
    project_root.join(IGNORE_FILE)
}

/// Append the missing `patterns` under the marker, creating `.gitignore` if
/// needed. Returns how many patterns were added.
pub async fn ensure_ignore_patterns(project_root: &Path, patterns: &[String]) -> Result<usize> {
    let path = ignore_file_path(project_root);
    let existing = read_or_empty(&path).await?;

    let present: Vec<&str> = existing.lines().map(str::trim).collect();
    let mut missing: Vec<&str> = Vec::new();
    for pattern in patterns.iter().map(|p| p.trim()) {
        if !pattern.is_empty() && !present.contains(&pattern) && !missing.contains(&pattern) {
            missing.push(pattern);
        }
    }

    if missing.is_empty() {
        return Ok(0);
    }

    let mut content = existing.clone();
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    if !present.contains(&IGNORE_MARKER) {
        if !content.is_empty() {
            content.push('\n');
        }
        content.push_str(IGNORE_MARKER);
        content.push('\n');
        for pattern in &missing {
            content.push_str(pattern);
            content.push('\n');
        }
    } else {
        content = insert_after_marker(&content, &missing);
    }

    fs::write(&path, content).await?;
    debug!("Added {} pattern(s) to {}", missing.len(), path.display());
    Ok(missing.len())
}

/// Remove `patterns` from the managed block. The marker goes too once the
/// block is empty. Returns how many patterns were removed.
pub async fn remove_ignore_patterns(project_root: &Path, patterns: &[String]) -> Result<usize> {
    let path = ignore_file_path(project_root);
    if !path.exists() {
        return Ok(0);
    }

    let existing = fs::read_to_string(&path).await?;
    let targets: Vec<&str> = patterns.iter().map(|p| p.trim()).collect();

    let mut lines: Vec<&str> = Vec::new();
    let mut removed = 0;
    let mut in_block = false;
    for line in existing.lines() {
        let trimmed = line.trim();
        if trimmed == IGNORE_MARKER {
            in_block = true;
        } else if trimmed.is_empty() || trimmed.starts_with('#') {
            in_block = false;
        } else if in_block && targets.contains(&trimmed) {
            removed += 1;
            continue;
        }
        lines.push(line);
    }

    if removed == 0 {
        return Ok(0);
    }

    let lines = drop_empty_marker(lines);
    let mut content = lines.join("\n");
    while content.ends_with('\n') {
        content.pop();
    }
    if !content.is_empty() {
        content.push('\n');
    }

    fs::write(&path, content).await?;
    debug!("Removed {} pattern(s) from {}", removed, path.display());
    Ok(removed)
}

/// Patterns currently in the managed block.
pub async fn managed_patterns(project_root: &Path) -> Result<Vec<String>> {
    let content = read_or_empty(&ignore_file_path(project_root)).await?;
    let mut in_block = false;
    let mut patterns = Vec::new();

    for line in content.lines().map(str::trim) {
        if line == IGNORE_MARKER {
            in_block = true;
        } else if line.is_empty() || line.starts_with('#') {
            in_block = false;
        } else if in_block {
            patterns.push(line.to_string());
        }
    }
    Ok(patterns)
}

async fn read_or_empty(path: &Path) -> Result<String> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

fn insert_after_marker(content: &str, patterns: &[&str]) -> String {
    let mut out = String::with_capacity(content.len() + patterns.len() * 24);
    let mut inserted = false;
    let mut in_block = false;

    for line in content.lines() {
        let trimmed = line.trim();
        if in_block && !inserted && (trimmed.is_empty() || trimmed.starts_with('#')) {
            push_patterns(&mut out, patterns);
            inserted = true;
        }
        if trimmed == IGNORE_MARKER {
            in_block = true;
        } else if trimmed.is_empty() || trimmed.starts_with('#') {
            in_block = false;
        }
        out.push_str(line);
        out.push('\n');
    }

    if !inserted {
        push_patterns(&mut out, patterns);
    }
    out
}

fn push_patterns(out: &mut String, patterns: &[&str]) {
    for pattern in patterns {
        out.push_str(pattern);
        out.push('\n');
    }
}

/// Drop a marker line that no longer has patterns under it, along with the
/// blank separator line before it.
fn drop_empty_marker(lines: Vec<&str>) -> Vec<&str> {
    let mut result: Vec<&str> = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        if line.trim() == IGNORE_MARKER {
            let next = lines.get(i + 1).map(|l| l.trim());
            let has_patterns = matches!(next, Some(l) if !l.is_empty() && !l.starts_with('#'));
            if !has_patterns {
                if result.last().is_some_and(|l| l.trim().is_empty()) {
                    result.pop();
                }
                continue;
            }
        }
        result.push(line);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn patterns(list: &[&str]) -> Vec<String> {
        list.iter().map(|p| p.to_string()).collect()
    }

    #[tokio::test]
    async fn test_creates_ignore_file() {
        let temp = TempDir::new().unwrap();
        let added = ensure_ignore_patterns(temp.path(), &patterns(&[".claude/history/"]))
            .await
            .unwrap();
        assert_eq!(added, 1);

        let content = std::fs::read_to_string(temp.path().join(".gitignore")).unwrap();
        assert_eq!(content, "# cc-history\n.claude/history/\n");
    }

    #[tokio::test]
    async fn test_is_idempotent_and_keeps_existing_lines() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(".gitignore"), "target/").unwrap();

        let list = patterns(&[".claude/history/"]);
        assert_eq!(ensure_ignore_patterns(temp.path(), &list).await.unwrap(), 1);
        assert_eq!(ensure_ignore_patterns(temp.path(), &list).await.unwrap(), 0);

        let content = std::fs::read_to_string(temp.path().join(".gitignore")).unwrap();
        assert_eq!(content, "target/\n\n# cc-history\n.claude/history/\n");
    }

    #[tokio::test]
    async fn test_adds_into_existing_block() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".gitignore"),
            "# cc-history\n.claude/history/\n\n# build\ntarget/\n",
        )
        .unwrap();

        let added = ensure_ignore_patterns(temp.path(), &patterns(&[".claude/*.log"]))
            .await
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(
            managed_patterns(temp.path()).await.unwrap(),
            vec![".claude/history/", ".claude/*.log"]
        );
    }

    #[tokio::test]
    async fn test_remove_restores_file() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(".gitignore"), "target/\n").unwrap();

        let list = patterns(&[".claude/history/"]);
        ensure_ignore_patterns(temp.path(), &list).await.unwrap();
        assert_eq!(remove_ignore_patterns(temp.path(), &list).await.unwrap(), 1);
        assert_eq!(remove_ignore_patterns(temp.path(), &list).await.unwrap(), 0);

        let content = std::fs::read_to_string(temp.path().join(".gitignore")).unwrap();
        assert_eq!(content, "target/\n");
    }

    #[tokio::test]
    async fn test_remove_leaves_unmanaged_lines() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(".gitignore"), ".claude/history/\n").unwrap();

        let removed = remove_ignore_patterns(temp.path(), &patterns(&[".claude/history/"]))
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }
}
