//! Keeps Claude conversation history mirrored between the global store
//! (`~/.claude`) and per-project local stores (`<project>/.claude/history`).
//!
//! - [`engine`] copies conversation files under a newest-wins timestamp rule
//! - [`watcher`] keeps one project current while it is being worked on
//! - [`daemon`] does the same for every project below a set of search roots
//!
//! # Example
//!
//! ```no_run
//! use cc_history::{HistoryConfig, SyncEngine, SyncOptions};
//! use std::path::Path;
//!
//! # async fn example() -> cc_history::Result<()> {
//! let config = HistoryConfig::load_or_default().await?;
//! let engine = SyncEngine::from_config(&config);
//!
//! let result = engine
//!     .sync_to_local(Path::new("/work/app"), SyncOptions::bidirectional())
//!     .await;
//! println!("copied {} file(s)", result.files_processed);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod ignore_file;
pub mod membership;
pub mod paths;
pub mod project;
pub mod watch;
pub mod watcher;

pub use config::{HistoryConfig, HistoryMode};
pub use daemon::{DaemonConfig, DaemonStatus, SyncDaemon};
pub use engine::{
    ConversationMetadata, MetadataScan, SyncDirection, SyncEngine, SyncOptions, SyncResult,
};
pub use error::{HistoryError, Result};
pub use paths::{GlobalLayout, StorageLocation, StoreKind};
pub use project::{ProjectInfo, detect_project};
pub use watch::{ChangeEvent, ChangeKind, EventSource, ManualEventSource, NotifyEventSource};
pub use watcher::{ChangeWatcher, ListenerId, WatchOptions};
