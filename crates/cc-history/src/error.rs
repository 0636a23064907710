//! Error types for history synchronization.

use std::path::PathBuf;

/// Result type alias for history operations.
pub type Result<T> = std::result::Result<T, HistoryError>;

/// Main error type for the history store.
///
/// Sync passes never surface per-file failures through this type; those are
/// collected into [`SyncResult::errors`](crate::engine::SyncResult) so a batch
/// keeps going. `HistoryError` covers the operations that either succeed or
/// fail as a whole.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File watcher errors
    #[error("Watch error: {0}")]
    Watch(String),

    /// The local store of a project has never been initialized
    #[error("Local store not initialized at {}", path.display())]
    NotInitialized { path: PathBuf },

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl HistoryError {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new not-initialized error
    pub fn not_initialized(path: impl Into<PathBuf>) -> Self {
        Self::NotInitialized { path: path.into() }
    }
}

impl From<notify::Error> for HistoryError {
    fn from(err: notify::Error) -> Self {
        Self::Watch(err.to_string())
    }
}

impl From<toml::de::Error> for HistoryError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("Failed to parse config file: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_initialized_message() {
        let err = HistoryError::not_initialized("/work/app/.claude/history");
        let msg = err.to_string();
        assert!(msg.contains("not initialized"));
        assert!(msg.contains("/work/app/.claude/history"));
    }

    #[test]
    fn test_watch_conversion() {
        let err: HistoryError = notify::Error::path_not_found().into();
        assert!(matches!(err, HistoryError::Watch(_)));
        assert!(err.to_string().starts_with("Watch error"));
    }

    #[test]
    fn test_config_parse_conversion() {
        let parse = toml::from_str::<toml::Table>("key = ").unwrap_err();
        let err: HistoryError = parse.into();
        assert!(matches!(err, HistoryError::Config(_)));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: HistoryError = io.into();
        assert!(matches!(err, HistoryError::Io(_)));
    }
}
