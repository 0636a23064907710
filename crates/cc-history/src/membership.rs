//! Decides whether a conversation file belongs to a project.
//!
//! Conversation files are either a single JSON document or newline-delimited
//! JSON records. A file belongs to a project when one of its records names the
//! project root as its working directory, or, failing that, when the raw text
//! mentions the project root anywhere. The substring rule is deliberately
//! loose: it also matches conversations that merely reference the project, and
//! it matches `/work/app-old` content for a `/work/app` project.
//!
//! Content that cannot be parsed is reported as [`Membership::Malformed`].
//! Callers skip such files silently and count them instead of failing.

use serde_json::{Map, Value};
use std::path::Path;
use tracing::debug;

/// Record fields that carry a working directory.
const WORKING_DIRECTORY_FIELDS: &[&str] = &["cwd", "workingDirectory", "projectPath"];

/// Outcome of a membership check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Member,
    NotMember,
    /// The content could not be parsed; the file is skipped, not failed.
    Malformed,
}

impl Membership {
    pub fn is_member(&self) -> bool {
        matches!(self, Self::Member)
    }
}

/// Parsed view of a conversation file.
#[derive(Debug, Clone)]
pub struct ConversationContent {
    records: Vec<Map<String, Value>>,
}

impl ConversationContent {
    /// Parse a whole document first, then fall back to one record per line.
    ///
    /// Returns `None` when the content is empty or any non-empty line is not a
    /// JSON object.
    pub fn parse(content: &str) -> Option<Self> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return None;
        }

        if let Ok(record) = serde_json::from_str::<Map<String, Value>>(trimmed) {
            return Some(Self {
                records: vec![record],
            });
        }

        let mut records = Vec::new();
        for line in trimmed.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Map<String, Value>>(line) {
                Ok(record) => records.push(record),
                Err(_) => return None,
            }
        }

        if records.is_empty() {
            None
        } else {
            Some(Self { records })
        }
    }

    /// Every recorded working directory, in file order.
    pub fn working_directories(&self) -> impl Iterator<Item = &str> {
        self.records.iter().flat_map(|record| {
            WORKING_DIRECTORY_FIELDS
                .iter()
                .filter_map(move |field| record.get(*field).and_then(Value::as_str))
        })
    }

    /// The first recorded working directory.
    pub fn working_directory(&self) -> Option<&str> {
        self.working_directories().next()
    }

    /// Number of messages.
    ///
    /// A record with a `messages` array contributes its length; any other
    /// record with a `message` payload, or typed as a user/assistant turn,
    /// counts once.
    pub fn message_count(&self) -> usize {
        self.records
            .iter()
            .map(|record| match record.get("messages") {
                Some(Value::Array(messages)) => messages.len(),
                _ => {
                    let is_turn = matches!(
                        record.get("type").and_then(Value::as_str),
                        Some("user") | Some("assistant")
                    );
                    usize::from(record.contains_key("message") || is_turn)
                }
            })
            .sum()
    }

    /// A `title`, or failing that a `summary`, from the first record that has one.
    pub fn title(&self) -> Option<&str> {
        self.records
            .iter()
            .find_map(|record| record.get("title").and_then(Value::as_str))
            .or_else(|| {
                self.records
                    .iter()
                    .find_map(|record| record.get("summary").and_then(Value::as_str))
            })
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

/// Check whether `content` belongs to the project rooted at `project_root`.
pub fn belongs_to_project(content: &str, project_root: &Path) -> Membership {
    let Some(parsed) = ConversationContent::parse(content) else {
        return Membership::Malformed;
    };

    let root = project_root.to_string_lossy();
    if root.is_empty() {
        return Membership::NotMember;
    }

    if parsed.working_directories().any(|dir| dir == root) {
        return Membership::Member;
    }

    if content.contains(root.as_ref()) {
        return Membership::Member;
    }

    Membership::NotMember
}

/// Read `path` and check its membership. Unreadable files count as malformed.
pub async fn file_belongs_to_project(path: &Path, project_root: &Path) -> Membership {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => belongs_to_project(&content, project_root),
        Err(e) => {
            debug!("Skipping unreadable conversation {}: {}", path.display(), e);
            Membership::Malformed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cwd_match() {
        let content = r#"{"cwd": "/work/app", "messages": []}"#;
        assert_eq!(
            belongs_to_project(content, Path::new("/work/app")),
            Membership::Member
        );
        assert_eq!(
            belongs_to_project(content, Path::new("/work/other")),
            Membership::NotMember
        );
    }

    #[test]
    fn test_jsonl_records() {
        let content = concat!(
            r#"{"type":"summary","summary":"Refactor parser"}"#,
            "\n",
            r#"{"type":"user","cwd":"/work/app","message":{"role":"user","content":"hi"}}"#,
            "\n",
            r#"{"type":"assistant","cwd":"/work/app","message":{"role":"assistant","content":"hello"}}"#,
            "\n",
        );
        assert!(belongs_to_project(content, Path::new("/work/app")).is_member());

        let parsed = ConversationContent::parse(content).unwrap();
        assert_eq!(parsed.record_count(), 3);
        assert_eq!(parsed.message_count(), 2);
        assert_eq!(parsed.working_directory(), Some("/work/app"));
        assert_eq!(parsed.title(), Some("Refactor parser"));
    }

    #[test]
    fn test_substring_match_is_permissive() {
        // No working directory field, but the path appears in a message body.
        let content = r#"{"messages": [{"content": "look at /work/app/src/main.rs"}]}"#;
        assert!(belongs_to_project(content, Path::new("/work/app")).is_member());

        // A sibling project whose path extends ours also matches.
        let sibling = r#"{"cwd": "/work/app-old", "messages": []}"#;
        assert!(belongs_to_project(sibling, Path::new("/work/app")).is_member());
    }

    #[test]
    fn test_malformed_content() {
        let root = Path::new("/work/app");
        assert_eq!(belongs_to_project("", root), Membership::Malformed);
        assert_eq!(
            belongs_to_project("not json at all /work/app", root),
            Membership::Malformed
        );
        assert_eq!(
            belongs_to_project("{\"cwd\":\"/work/app\"}\n{broken", root),
            Membership::Malformed
        );
        assert_eq!(belongs_to_project("[1, 2, 3]", root), Membership::Malformed);
    }

    #[test]
    fn test_message_count_from_array() {
        let content = r#"{"title": "Setup", "messages": [{"a":1},{"b":2},{"c":3}]}"#;
        let parsed = ConversationContent::parse(content).unwrap();
        assert_eq!(parsed.message_count(), 3);
        assert_eq!(parsed.title(), Some("Setup"));
        assert_eq!(parsed.working_directory(), None);
    }

    #[test]
    fn test_alternate_working_directory_fields() {
        let content = r#"{"workingDirectory": "/srv/site", "messages": []}"#;
        assert!(belongs_to_project(content, Path::new("/srv/site")).is_member());

        let content = r#"{"projectPath": "/srv/api", "messages": []}"#;
        assert!(belongs_to_project(content, Path::new("/srv/api")).is_member());
    }

    #[tokio::test]
    async fn test_unreadable_file_is_malformed() {
        let membership =
            file_belongs_to_project(Path::new("/nonexistent/file.jsonl"), Path::new("/work")).await;
        assert_eq!(membership, Membership::Malformed);
    }
}
