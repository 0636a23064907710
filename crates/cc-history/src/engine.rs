//! Sync engine: mirrors conversation files between the global store and a
//! project's local store.
//!
//! Every copy follows one freshness rule: copy when the destination is missing
//! or its modification time is strictly older than the source's. Copies carry
//! the source modification time over to the destination, so after a pass both
//! sides compare equal and a second pass (in either direction) copies nothing.
//!
//! Passes never fail as a whole. Per-file problems are collected into
//! [`SyncResult::errors`] and the remaining files are still processed. Files
//! whose content cannot be parsed during a membership check are counted in
//! [`SyncResult::files_skipped`] and never reported as errors.

use crate::error::{HistoryError, Result};
use crate::membership::{self, ConversationContent, Membership};
use crate::paths::{self, GlobalLayout};
use chrono::{DateTime, Utc};
use filetime::FileTime;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};
use tokio::fs;
use tracing::{debug, info, warn};

/// Fixed content of `<project>/.claude/README.md`.
pub const LOCAL_STORE_README: &str = "# Claude conversation history\n\
\n\
This directory is managed by cc-history.\n\
\n\
`history/` mirrors the conversations recorded for this project in the global\n\
Claude store, so they can travel with the project. Files are copied whole; the\n\
newer copy (by modification time) wins.\n\
\n\
Run `cc-history sync` to refresh the mirror, or `cc-history clean` to remove it.\n";

/// Direction of a sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Global → local
    ToLocal,
    /// Local → global
    ToGlobal,
    Bidirectional,
}

/// Options for [`SyncEngine::sync_to_local`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Also push local files back to the global side.
    pub bidirectional: bool,
}

impl SyncOptions {
    pub fn bidirectional() -> Self {
        Self {
            bidirectional: true,
        }
    }

    pub fn one_way() -> Self {
        Self {
            bidirectional: false,
        }
    }
}

/// Outcome of one sync pass. Built fresh for every call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    /// True when no errors were recorded
    pub success: bool,

    /// Number of files copied
    pub files_processed: usize,

    /// Number of files skipped because their content could not be parsed
    pub files_skipped: usize,

    /// Per-file and setup errors, in the order they happened
    pub errors: Vec<String>,

    /// Duration of the pass
    pub duration_ms: u64,

    pub direction: SyncDirection,

    pub project_root: PathBuf,

    pub timestamp: DateTime<Utc>,
}

/// Result of a single freshness-gated copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    Copied,
    /// The destination was already at least as new as the source.
    UpToDate,
}

/// Metadata extracted from one conversation file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMetadata {
    /// File stem
    pub id: String,

    pub path: PathBuf,

    /// Working directory recorded in the conversation, if any
    pub project_path: Option<String>,

    /// Filesystem creation time, or modification time where creation time is unsupported
    pub created_at: DateTime<Utc>,

    pub modified_at: DateTime<Utc>,

    pub message_count: usize,

    pub title: Option<String>,

    pub size_bytes: u64,
}

/// Conversations found in a directory, plus how many files were unparseable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataScan {
    /// Newest first
    pub conversations: Vec<ConversationMetadata>,

    pub skipped: usize,
}

/// Running totals for one pass.
#[derive(Debug, Default)]
struct Tally {
    processed: usize,
    skipped: usize,
    errors: Vec<String>,
}

impl Tally {
    fn finish(self, direction: SyncDirection, project_root: &Path, start: Instant) -> SyncResult {
        SyncResult {
            success: self.errors.is_empty(),
            files_processed: self.processed,
            files_skipped: self.skipped,
            errors: self.errors,
            duration_ms: start.elapsed().as_millis() as u64,
            direction,
            project_root: project_root.to_path_buf(),
            timestamp: Utc::now(),
        }
    }
}

/// Mirrors conversation files between the global store and local stores.
///
/// The global root and layout are fixed at construction; later configuration
/// changes need a new engine.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    global_root: PathBuf,
    layout: GlobalLayout,
}

impl SyncEngine {
    /// Create an engine for the global store at `global_root`.
    pub fn new(global_root: impl Into<PathBuf>, layout: GlobalLayout) -> Self {
        Self {
            global_root: global_root.into(),
            layout,
        }
    }

    /// Create an engine from configuration, honoring the global path override.
    pub fn from_config(config: &crate::config::HistoryConfig) -> Self {
        Self::new(
            paths::global_store_path(config.global_path.as_deref()),
            config.layout,
        )
    }

    pub fn global_root(&self) -> &Path {
        &self.global_root
    }

    pub fn layout(&self) -> GlobalLayout {
        self.layout
    }

    /// The global directory holding `project_root`'s conversations.
    pub fn global_dir_for(&self, project_root: &Path) -> PathBuf {
        paths::global_source_path(&self.global_root, self.layout, project_root)
    }

    /// Whether the project's local store has its history directory.
    pub fn is_initialized(&self, project_root: &Path) -> bool {
        paths::path_exists(&paths::local_history_path(project_root))
    }

    /// Create `<project>/.claude/history` and write the README. Idempotent.
    pub async fn initialize_local_store(&self, project_root: &Path) -> Result<()> {
        let store = paths::local_store_path(project_root);
        let history = paths::history_path(&store);

        fs::create_dir_all(&history).await?;
        fs::write(store.join("README.md"), LOCAL_STORE_README).await?;

        debug!("Initialized local store at {}", store.display());
        Ok(())
    }

    /// Pull the project's conversations from the global store into local history.
    ///
    /// Initializes the local store first when needed. A missing global
    /// directory is not an error. With `bidirectional`, local files are then
    /// pushed back under the same freshness rule, creating the global
    /// directory if needed.
    pub async fn sync_to_local(&self, project_root: &Path, options: SyncOptions) -> SyncResult {
        let start = Instant::now();
        let direction = if options.bidirectional {
            SyncDirection::Bidirectional
        } else {
            SyncDirection::ToLocal
        };
        let mut tally = Tally::default();

        let local_history = paths::local_history_path(project_root);
        let source = self.global_dir_for(project_root);

        if !paths::path_exists(&local_history) {
            if let Err(e) = self.initialize_local_store(project_root).await {
                tally.errors.push(format!(
                    "Failed to initialize local store for {}: {}",
                    project_root.display(),
                    e
                ));
                return tally.finish(direction, project_root, start);
            }
        }

        let membership_root = self
            .layout
            .requires_membership_filter()
            .then_some(project_root);

        if paths::path_exists(&source) {
            mirror_directory(&source, &local_history, membership_root, &mut tally).await;
        } else {
            debug!("No global conversations at {}", source.display());
        }

        if options.bidirectional {
            match fs::create_dir_all(&source).await {
                Ok(()) => mirror_directory(&local_history, &source, None, &mut tally).await,
                Err(e) => tally.errors.push(format!(
                    "Failed to create global directory {}: {}",
                    source.display(),
                    e
                )),
            }
        }

        let result = tally.finish(direction, project_root, start);
        info!(
            "Sync to local completed for {}: {} files, {} skipped, {} errors, {}ms",
            project_root.display(),
            result.files_processed,
            result.files_skipped,
            result.errors.len(),
            result.duration_ms
        );
        result
    }

    /// Copy every local history file into the global store, ignoring timestamps.
    ///
    /// Used to restore a project's history on a fresh machine. Refuses to run
    /// when the local store was never initialized.
    pub async fn sync_to_global(&self, project_root: &Path) -> SyncResult {
        let start = Instant::now();
        let mut tally = Tally::default();
        let local_history = paths::local_history_path(project_root);

        if !paths::path_exists(&local_history) {
            tally
                .errors
                .push(HistoryError::not_initialized(&local_history).to_string());
            return tally.finish(SyncDirection::ToGlobal, project_root, start);
        }

        let destination = self.global_dir_for(project_root);
        if let Err(e) = fs::create_dir_all(&destination).await {
            tally.errors.push(format!(
                "Failed to create global directory {}: {}",
                destination.display(),
                e
            ));
            return tally.finish(SyncDirection::ToGlobal, project_root, start);
        }

        match list_candidates(&local_history).await {
            Ok(candidates) => {
                for src in candidates {
                    let dst = destination.join(file_name(&src));
                    match copy_preserving_mtime(&src, &dst).await {
                        Ok(()) => tally.processed += 1,
                        Err(e) => tally.errors.push(copy_error(&src, &dst, &e)),
                    }
                }
            }
            Err(e) => tally.errors.push(format!(
                "Failed to list {}: {}",
                local_history.display(),
                e
            )),
        }

        let result = tally.finish(SyncDirection::ToGlobal, project_root, start);
        info!(
            "Sync to global completed for {}: {} files, {} errors, {}ms",
            project_root.display(),
            result.files_processed,
            result.errors.len(),
            result.duration_ms
        );
        result
    }

    /// Push local history files that are newer than their global copies.
    ///
    /// Unlike [`sync_to_global`](Self::sync_to_global) this honors the
    /// freshness rule, so it never overwrites a newer global file. Used for
    /// change-triggered pushes.
    pub async fn sync_newer_to_global(&self, project_root: &Path) -> SyncResult {
        let start = Instant::now();
        let mut tally = Tally::default();
        let local_history = paths::local_history_path(project_root);

        if !paths::path_exists(&local_history) {
            tally
                .errors
                .push(HistoryError::not_initialized(&local_history).to_string());
            return tally.finish(SyncDirection::ToGlobal, project_root, start);
        }

        let destination = self.global_dir_for(project_root);
        match fs::create_dir_all(&destination).await {
            Ok(()) => mirror_directory(&local_history, &destination, None, &mut tally).await,
            Err(e) => tally.errors.push(format!(
                "Failed to create global directory {}: {}",
                destination.display(),
                e
            )),
        }

        let result = tally.finish(SyncDirection::ToGlobal, project_root, start);
        debug!(
            "Pushed {} newer file(s) for {} in {}ms",
            result.files_processed,
            project_root.display(),
            result.duration_ms
        );
        result
    }

    /// Remove local history. Unless `preserve_config` is set, the whole local
    /// store goes too; otherwise files beside `history/` are left in place.
    pub async fn clean_local_store(&self, project_root: &Path, preserve_config: bool) -> Result<()> {
        let store = paths::local_store_path(project_root);
        let history = paths::history_path(&store);

        if paths::path_exists(&history) {
            fs::remove_dir_all(&history).await?;
        }

        if !preserve_config && paths::path_exists(&store) {
            fs::remove_dir_all(&store).await?;
        }

        info!(
            "Cleaned local store for {} (preserve_config: {})",
            project_root.display(),
            preserve_config
        );
        Ok(())
    }

    /// Metadata for every conversation in `<store_root>/history`.
    pub async fn conversation_metadata(&self, store_root: &Path) -> Result<MetadataScan> {
        conversation_metadata_in(&paths::history_path(store_root)).await
    }
}

/// Metadata for every conversation file directly inside `dir`.
///
/// A missing directory yields an empty scan. Unparseable files are counted in
/// [`MetadataScan::skipped`].
pub async fn conversation_metadata_in(dir: &Path) -> Result<MetadataScan> {
    let mut scan = MetadataScan::default();
    if !paths::path_exists(dir) {
        return Ok(scan);
    }

    for path in list_candidates(dir).await? {
        match read_metadata(&path).await {
            Some(metadata) => scan.conversations.push(metadata),
            None => {
                debug!("Skipping unparseable conversation {}", path.display());
                scan.skipped += 1;
            }
        }
    }

    scan.conversations
        .sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
    Ok(scan)
}

async fn read_metadata(path: &Path) -> Option<ConversationMetadata> {
    let content = fs::read_to_string(path).await.ok()?;
    let parsed = ConversationContent::parse(&content)?;
    let meta = fs::metadata(path).await.ok()?;

    let modified = meta.modified().ok()?;
    let created = meta.created().unwrap_or(modified);

    Some(ConversationMetadata {
        id: path.file_stem()?.to_string_lossy().into_owned(),
        path: path.to_path_buf(),
        project_path: parsed.working_directory().map(str::to_string),
        created_at: DateTime::<Utc>::from(created),
        modified_at: DateTime::<Utc>::from(modified),
        message_count: parsed.message_count(),
        title: parsed.title().map(str::to_string),
        size_bytes: meta.len(),
    })
}

/// Copy `src` to `dst` when `dst` is missing or strictly older than `src`.
///
/// Equal modification times never copy. The copy keeps `src`'s modification
/// time.
pub async fn copy_if_newer(src: &Path, dst: &Path) -> io::Result<CopyOutcome> {
    let src_modified = fs::metadata(src).await?.modified()?;

    match fs::metadata(dst).await {
        Ok(dst_meta) => {
            if dst_meta.modified()? >= src_modified {
                return Ok(CopyOutcome::UpToDate);
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    copy_with_mtime(src, dst, src_modified).await?;
    Ok(CopyOutcome::Copied)
}

/// Copy unconditionally, keeping the source modification time.
pub async fn copy_preserving_mtime(src: &Path, dst: &Path) -> io::Result<()> {
    let src_modified = fs::metadata(src).await?.modified()?;
    copy_with_mtime(src, dst, src_modified).await
}

async fn copy_with_mtime(src: &Path, dst: &Path, modified: SystemTime) -> io::Result<()> {
    fs::copy(src, dst).await?;

    let dst = dst.to_path_buf();
    let mtime = FileTime::from_system_time(modified);
    tokio::task::spawn_blocking(move || filetime::set_file_mtime(&dst, mtime))
        .await
        .map_err(io::Error::other)?
}

/// Conversation files directly inside `dir`, sorted by name.
///
/// Entries are matched by extension only, the way a glob would.
pub async fn list_candidates(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut candidates = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if paths::is_conversation_file(&path) {
            candidates.push(path);
        }
    }

    candidates.sort();
    Ok(candidates)
}

/// Apply the freshness rule to every candidate in `src_dir`.
///
/// With `membership_root`, only files belonging to that project are copied.
async fn mirror_directory(
    src_dir: &Path,
    dst_dir: &Path,
    membership_root: Option<&Path>,
    tally: &mut Tally,
) {
    let candidates = match list_candidates(src_dir).await {
        Ok(candidates) => candidates,
        Err(e) => {
            tally
                .errors
                .push(format!("Failed to list {}: {}", src_dir.display(), e));
            return;
        }
    };

    for src in candidates {
        if let Some(root) = membership_root {
            match membership::file_belongs_to_project(&src, root).await {
                Membership::Member => {}
                Membership::NotMember => continue,
                Membership::Malformed => {
                    debug!("Skipping malformed conversation {}", src.display());
                    tally.skipped += 1;
                    continue;
                }
            }
        }

        let dst = dst_dir.join(file_name(&src));
        match copy_if_newer(&src, &dst).await {
            Ok(CopyOutcome::Copied) => {
                debug!("Copied {} -> {}", src.display(), dst.display());
                tally.processed += 1;
            }
            Ok(CopyOutcome::UpToDate) => {}
            Err(e) => {
                warn!("Failed to copy {}: {}", src.display(), e);
                tally.errors.push(copy_error(&src, &dst, &e));
            }
        }
    }
}

fn file_name(path: &Path) -> &std::ffi::OsStr {
    path.file_name().unwrap_or(path.as_os_str())
}

fn copy_error(src: &Path, dst: &Path, err: &io::Error) -> String {
    format!(
        "Failed to copy {} -> {}: {}",
        src.display(),
        dst.display(),
        err
    )
}
