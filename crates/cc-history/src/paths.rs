//! Path resolution for the global and per-project history stores.
//!
//! Everything here is a pure path transform. Existence checks go through
//! [`path_exists`] so callers decide when to touch the filesystem.
//!
//! # Layout
//!
//! ```text
//! <project-root>/.claude/            # local store
//! ├── history/                       # mirrored conversation files
//! └── README.md
//!
//! ~/.claude/                         # global store (overridable)
//! ├── history/                       # flat layout
//! └── projects/<encoded-path>/       # per-project layout
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the local store directory inside a project.
pub const LOCAL_STORE_DIR: &str = ".claude";

/// Name of the history directory inside a store.
pub const HISTORY_DIR: &str = "history";

/// Name of the per-project directory inside the global store.
pub const PROJECTS_DIR: &str = "projects";

/// Character that replaces path separators in encoded project paths.
pub const ENCODED_SEPARATOR: char = '-';

/// File extensions recognized as conversation logs (newline-delimited and plain).
pub const CONVERSATION_EXTENSIONS: &[&str] = &["jsonl", "json"];

/// How the external application lays out the global store.
///
/// Both conventions exist in the wild, so the caller picks one; the resolver
/// never guesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalLayout {
    /// A single `history/` directory holding every project's conversations.
    /// Files are attributed to projects by the membership filter.
    Flat,
    /// One `projects/<encoded-path>/` directory per project.
    #[default]
    PerProject,
}

impl GlobalLayout {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flat => "flat",
            Self::PerProject => "per_project",
        }
    }

    /// Whether files in the global source directory still need the membership
    /// filter to decide which project they belong to.
    pub fn requires_membership_filter(&self) -> bool {
        matches!(self, Self::Flat)
    }
}

impl std::str::FromStr for GlobalLayout {
    type Err = crate::HistoryError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_lowercase().as_str() {
            "flat" => Ok(Self::Flat),
            "per_project" | "per-project" | "projects" => Ok(Self::PerProject),
            _ => Err(crate::HistoryError::config(format!(
                "Invalid layout '{}'. Must be one of: flat, per_project",
                s
            ))),
        }
    }
}

impl std::fmt::Display for GlobalLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the mirror a location belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Global,
    Local,
}

/// A store directory and whether it currently exists. Recomputed on every query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLocation {
    pub path: PathBuf,
    pub kind: StoreKind,
    pub exists: bool,
}

/// `<project_root>/.claude`
pub fn local_store_path(project_root: &Path) -> PathBuf {
    project_root.join(LOCAL_STORE_DIR)
}

/// `<store_root>/history`
pub fn history_path(store_root: &Path) -> PathBuf {
    store_root.join(HISTORY_DIR)
}

/// `<project_root>/.claude/history`
pub fn local_history_path(project_root: &Path) -> PathBuf {
    history_path(&local_store_path(project_root))
}

/// Default global store root (`~/.claude`), unless an override is configured.
///
/// Falls back to a relative `.claude` when no home directory can be determined.
pub fn global_store_path(override_path: Option<&Path>) -> PathBuf {
    if let Some(path) = override_path {
        return path.to_path_buf();
    }

    dirs::home_dir()
        .map(|home| home.join(LOCAL_STORE_DIR))
        .unwrap_or_else(|| PathBuf::from(LOCAL_STORE_DIR))
}

/// Encode an absolute project path into a single path segment.
///
/// Every separator becomes [`ENCODED_SEPARATOR`], so `/home/me/app` encodes to
/// `-home-me-app`. The encoding is lossy: `/a/b-c` and `/a-b/c` both encode to
/// `-a-b-c` and therefore share one global directory. Collisions are not
/// detected.
pub fn encode_project_path(project_root: &Path) -> String {
    project_root
        .to_string_lossy()
        .chars()
        .map(|c| {
            if std::path::is_separator(c) {
                ENCODED_SEPARATOR
            } else {
                c
            }
        })
        .collect()
}

/// `<global_root>/projects/<encoded project path>`
pub fn global_project_path(global_root: &Path, project_root: &Path) -> PathBuf {
    global_root
        .join(PROJECTS_DIR)
        .join(encode_project_path(project_root))
}

/// `<global_root>/history`, the flat layout's shared pool.
pub fn global_history_path(global_root: &Path) -> PathBuf {
    history_path(global_root)
}

/// The global directory a project's conversations live in under `layout`.
pub fn global_source_path(global_root: &Path, layout: GlobalLayout, project_root: &Path) -> PathBuf {
    match layout {
        GlobalLayout::Flat => global_history_path(global_root),
        GlobalLayout::PerProject => global_project_path(global_root, project_root),
    }
}

/// Existence check, kept apart from the pure resolvers above.
pub fn path_exists(path: &Path) -> bool {
    path.exists()
}

/// Whether `path` has one of the [`CONVERSATION_EXTENSIONS`].
pub fn is_conversation_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| CONVERSATION_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// Both storage locations for a project, with fresh existence flags.
pub fn storage_locations(
    global_root: &Path,
    layout: GlobalLayout,
    project_root: &Path,
) -> Vec<StorageLocation> {
    let global = global_source_path(global_root, layout, project_root);
    let local = local_history_path(project_root);

    vec![
        StorageLocation {
            exists: path_exists(&global),
            path: global,
            kind: StoreKind::Global,
        },
        StorageLocation {
            exists: path_exists(&local),
            path: local,
            kind: StoreKind::Local,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_paths() {
        let root = Path::new("/work/app");
        assert_eq!(local_store_path(root), PathBuf::from("/work/app/.claude"));
        assert_eq!(
            local_history_path(root),
            PathBuf::from("/work/app/.claude/history")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_encode_project_path() {
        assert_eq!(encode_project_path(Path::new("/home/me/app")), "-home-me-app");
        assert_eq!(
            global_project_path(Path::new("/home/me/.claude"), Path::new("/home/me/app")),
            PathBuf::from("/home/me/.claude/projects/-home-me-app")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_encoding_collision_is_accepted() {
        let a = encode_project_path(Path::new("/a/b-c"));
        let b = encode_project_path(Path::new("/a-b/c"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_global_store_override() {
        let custom = Path::new("/srv/claude");
        assert_eq!(global_store_path(Some(custom)), custom.to_path_buf());
        assert!(global_store_path(None).ends_with(".claude"));
    }

    #[test]
    fn test_global_source_path_by_layout() {
        let global = Path::new("/g");
        let project = Path::new("/p");
        assert_eq!(
            global_source_path(global, GlobalLayout::Flat, project),
            PathBuf::from("/g/history")
        );
        assert!(
            global_source_path(global, GlobalLayout::PerProject, project)
                .starts_with("/g/projects")
        );
    }

    #[test]
    fn test_conversation_extensions() {
        assert!(is_conversation_file(Path::new("abc.jsonl")));
        assert!(is_conversation_file(Path::new("abc.json")));
        assert!(!is_conversation_file(Path::new("abc.txt")));
        assert!(!is_conversation_file(Path::new("README")));
    }

    #[test]
    fn test_layout_parsing() {
        assert_eq!("flat".parse::<GlobalLayout>().unwrap(), GlobalLayout::Flat);
        assert_eq!(
            "per-project".parse::<GlobalLayout>().unwrap(),
            GlobalLayout::PerProject
        );
        assert!("nested".parse::<GlobalLayout>().is_err());
    }

    #[test]
    fn test_storage_locations_missing() {
        let locations = storage_locations(
            Path::new("/nonexistent/global"),
            GlobalLayout::PerProject,
            Path::new("/nonexistent/project"),
        );
        assert_eq!(locations.len(), 2);
        assert_eq!(locations[0].kind, StoreKind::Global);
        assert_eq!(locations[1].kind, StoreKind::Local);
        assert!(locations.iter().all(|l| !l.exists));
    }
}
