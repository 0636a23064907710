//! Multi-project sync daemon.
//!
//! The daemon discovers every project with an initialized local store below
//! its search roots and keeps each one in sync:
//!
//! - on discovery, one bidirectional sync
//! - local history changes push newer files to the global store
//! - global store changes pull into every monitored project
//!
//! Syncs of one project are rate limited: a trigger arriving within the
//! cooldown of that project's last completed sync is dropped. Projects stay
//! monitored until the daemon stops.
//!
//! Project roots are kept in canonical form, so a project reached through a
//! symlinked search root maps to the same global directory as a one-shot
//! sync of that project. New projects are found by watching the directories
//! within the depth ceiling (never a recursive watch on a search root) and
//! rescanning the search root whenever one of them gains a subdirectory.

use crate::config::HistoryConfig;
use crate::engine::{SyncEngine, SyncOptions, SyncResult};
use crate::error::{HistoryError, Result};
use crate::paths;
use crate::watch::{
    BatchHandler, ChangeEvent, ChangeKind, DirectoryWatch, EventSource, NotifyEventSource,
    WatchConfig,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

/// Directories never searched for projects.
const SKIPPED_DIRS: &[&str] = &["node_modules", "target"];

/// Daemon settings.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub search_roots: Vec<PathBuf>,

    /// Deepest project root below a search root (the root itself is depth 0)
    pub max_depth: usize,

    /// Minimum time between two syncs of one project
    pub cooldown: Duration,

    /// Watch search roots for projects initialized later
    pub watch_search_roots: bool,

    pub watch: WatchConfig,
}

impl DaemonConfig {
    pub fn from_config(config: &HistoryConfig) -> Self {
        Self {
            search_roots: config.daemon.effective_search_roots(),
            max_depth: config.daemon.max_depth,
            cooldown: Duration::from_secs(config.daemon.cooldown_secs),
            watch_search_roots: config.daemon.watch_search_roots,
            watch: WatchConfig::from(&config.watcher),
        }
    }
}

/// One monitored project, as reported by [`SyncDaemon::status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectStatus {
    pub root: PathBuf,
    pub monitored_since: DateTime<Utc>,
    pub last_sync: Option<DateTime<Utc>>,
    pub sync_count: u64,
}

/// Snapshot of the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub project_count: usize,
    pub projects: Vec<ProjectStatus>,
    pub global_root: PathBuf,
    pub syncs_completed: u64,
    pub syncs_skipped: u64,
}

struct MonitoredProject {
    root: PathBuf,
    monitored_since: DateTime<Utc>,
    last_sync: Mutex<Option<(Instant, DateTime<Utc>)>>,
    sync_count: AtomicU64,
    watch: Mutex<Option<DirectoryWatch>>,
}

impl MonitoredProject {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            monitored_since: Utc::now(),
            last_sync: Mutex::new(None),
            sync_count: AtomicU64::new(0),
            watch: Mutex::new(None),
        }
    }

    fn record_sync(&self) {
        *self.last_sync.lock() = Some((Instant::now(), Utc::now()));
        self.sync_count.fetch_add(1, Ordering::Relaxed);
    }

    fn within_cooldown(&self, cooldown: Duration) -> bool {
        self.last_sync
            .lock()
            .map(|(at, _)| at.elapsed() < cooldown)
            .unwrap_or(false)
    }

    fn close(&self) {
        if let Some(watch) = self.watch.lock().take() {
            watch.close();
        }
    }

    fn status(&self) -> ProjectStatus {
        ProjectStatus {
            root: self.root.clone(),
            monitored_since: self.monitored_since,
            last_sync: self.last_sync.lock().map(|(_, at)| at),
            sync_count: self.sync_count.load(Ordering::Relaxed),
        }
    }
}

struct DaemonInner {
    engine: SyncEngine,
    config: DaemonConfig,
    source: Arc<dyn EventSource>,
    projects: DashMap<PathBuf, Arc<MonitoredProject>>,
    global_watch: Mutex<Option<DirectoryWatch>>,
    /// Discovery watch per canonical search root
    discovery: Mutex<HashMap<PathBuf, DiscoveryWatch>>,
    running: AtomicBool,
    syncs_completed: AtomicU64,
    syncs_skipped: AtomicU64,
}

/// Keeps every discovered project in sync with the global store.
///
/// Cloning gives another handle to the same daemon. Separate daemons never
/// share state.
#[derive(Clone)]
pub struct SyncDaemon {
    inner: Arc<DaemonInner>,
}

impl SyncDaemon {
    pub fn new(engine: SyncEngine, config: DaemonConfig, source: Arc<dyn EventSource>) -> Self {
        Self {
            inner: Arc::new(DaemonInner {
                engine,
                config,
                source,
                projects: DashMap::new(),
                global_watch: Mutex::new(None),
                discovery: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                syncs_completed: AtomicU64::new(0),
                syncs_skipped: AtomicU64::new(0),
            }),
        }
    }

    /// Daemon backed by filesystem notifications.
    pub fn with_notify(engine: SyncEngine, config: DaemonConfig) -> Self {
        let source = Arc::new(NotifyEventSource::new(&config.watch));
        Self::new(engine, config, source)
    }

    /// Discover projects, start watching, and return the number of monitored
    /// projects. Does nothing if already running.
    pub async fn start(&self) -> Result<usize> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(self.inner.projects.len());
        }

        info!(
            "Starting sync daemon ({} search root(s), max depth {})",
            self.inner.config.search_roots.len(),
            self.inner.config.max_depth
        );

        let scans = self.inner.scan_roots(self.inner.search_roots()).await;
        for project in scans.iter().flat_map(|scan| &scan.projects) {
            if let Err(e) = self.inner.monitor_project(project.clone()).await {
                warn!("Failed to monitor {}: {}", project.display(), e);
            }
        }

        self.inner.start_global_watch();
        if self.inner.config.watch_search_roots {
            for scan in scans {
                self.inner.refresh_discovery_watch(scan);
            }
        }

        let count = self.inner.projects.len();
        info!("Sync daemon started, monitoring {} project(s)", count);
        Ok(count)
    }

    /// Stop every watch and forget all projects. Safe to call repeatedly.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(watch) = self.inner.global_watch.lock().take() {
            watch.close();
        }
        for (_, discovery) in self.inner.discovery.lock().drain() {
            discovery.watch.close();
        }
        for entry in self.inner.projects.iter() {
            entry.value().close();
        }
        self.inner.projects.clear();

        info!("Sync daemon stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Monitor an exact project root, regardless of search roots and depth.
    ///
    /// The root is resolved to its canonical path first. Returns false when
    /// the project is already monitored.
    pub async fn add_project(&self, project_root: &Path) -> Result<bool> {
        if !self.is_running() {
            return Err(HistoryError::invalid_input("Sync daemon is not running"));
        }
        let root = project_root.canonicalize().map_err(|e| {
            HistoryError::invalid_input(format!("Cannot resolve {}: {}", project_root.display(), e))
        })?;
        if !root.is_dir() {
            return Err(HistoryError::invalid_input(format!(
                "Not a directory: {}",
                root.display()
            )));
        }
        self.inner.monitor_project(root).await
    }

    /// Canonical project roots with an initialized local store below the
    /// search roots.
    pub async fn discover(&self) -> Vec<PathBuf> {
        self.inner
            .scan_roots(self.inner.search_roots())
            .await
            .into_iter()
            .flat_map(|scan| scan.projects)
            .collect()
    }

    /// React to a local history change: push newer files unless rate limited.
    ///
    /// Returns `None` when the trigger was dropped or the project is unknown.
    pub async fn handle_local_change(&self, project_root: &Path) -> Option<SyncResult> {
        self.inner.handle_local_change(&canonical(project_root)).await
    }

    /// React to a global store change: pull into every project not rate
    /// limited. Returns how many projects were synced.
    pub async fn handle_global_change(&self) -> usize {
        self.inner.handle_global_change().await
    }

    pub fn status(&self) -> DaemonStatus {
        let mut projects: Vec<ProjectStatus> = self
            .inner
            .projects
            .iter()
            .map(|entry| entry.value().status())
            .collect();
        projects.sort_by(|a, b| a.root.cmp(&b.root));

        DaemonStatus {
            running: self.is_running(),
            project_count: projects.len(),
            projects,
            global_root: self.inner.engine.global_root().to_path_buf(),
            syncs_completed: self.inner.syncs_completed.load(Ordering::Relaxed),
            syncs_skipped: self.inner.syncs_skipped.load(Ordering::Relaxed),
        }
    }

    pub fn is_monitoring(&self, project_root: &Path) -> bool {
        self.inner.projects.contains_key(&canonical(project_root))
    }
}

impl DaemonInner {
    async fn monitor_project(self: &Arc<Self>, root: PathBuf) -> Result<bool> {
        let project = Arc::new(MonitoredProject::new(root.clone()));
        match self.projects.entry(root.clone()) {
            Entry::Occupied(_) => return Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&project));
            }
        }

        let result = self
            .engine
            .sync_to_local(&root, SyncOptions::bidirectional())
            .await;
        project.record_sync();
        self.syncs_completed.fetch_add(1, Ordering::Relaxed);
        if !result.success {
            warn!(
                "Initial sync of {} finished with {} error(s): {}",
                root.display(),
                result.errors.len(),
                result.errors.join("; ")
            );
        }

        let handler = Arc::new(LocalChangeHandler {
            daemon: Arc::downgrade(self),
            root: root.clone(),
        });
        match DirectoryWatch::spawn(
            self.source.as_ref(),
            &paths::local_history_path(&root),
            false,
            &self.config.watch,
            handler,
        ) {
            Ok(watch) => {
                // The daemon may have stopped while the initial sync ran.
                if self.running.load(Ordering::SeqCst) {
                    *project.watch.lock() = Some(watch);
                } else {
                    watch.close();
                }
            }
            Err(e) => warn!("Failed to watch {}: {}", root.display(), e),
        }

        info!("Monitoring {}", root.display());
        Ok(true)
    }

    async fn handle_local_change(&self, root: &Path) -> Option<SyncResult> {
        if !self.running.load(Ordering::SeqCst) {
            return None;
        }
        let project = self.projects.get(root).map(|entry| Arc::clone(entry.value()))?;

        if project.within_cooldown(self.config.cooldown) {
            debug!("Dropping local trigger for {} (cooldown)", root.display());
            self.syncs_skipped.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let result = self.engine.sync_newer_to_global(root).await;
        project.record_sync();
        self.syncs_completed.fetch_add(1, Ordering::Relaxed);
        if !result.success {
            warn!(
                "Push for {} finished with {} error(s)",
                root.display(),
                result.errors.len()
            );
        }
        Some(result)
    }

    async fn handle_global_change(&self) -> usize {
        if !self.running.load(Ordering::SeqCst) {
            return 0;
        }

        let projects: Vec<Arc<MonitoredProject>> = self
            .projects
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut synced = 0;
        for project in projects {
            if project.within_cooldown(self.config.cooldown) {
                debug!("Dropping global trigger for {} (cooldown)", project.root.display());
                self.syncs_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let result = self
                .engine
                .sync_to_local(&project.root, SyncOptions::one_way())
                .await;
            project.record_sync();
            self.syncs_completed.fetch_add(1, Ordering::Relaxed);
            synced += 1;

            if !result.success {
                warn!(
                    "Pull for {} finished with {} error(s)",
                    project.root.display(),
                    result.errors.len()
                );
            }
        }
        synced
    }

    fn start_global_watch(self: &Arc<Self>) {
        let global_root = self.engine.global_root();
        if !global_root.exists() {
            warn!(
                "Global store {} does not exist, not watching it",
                global_root.display()
            );
            return;
        }

        let handler = Arc::new(GlobalChangeHandler {
            daemon: Arc::downgrade(self),
        });
        match DirectoryWatch::spawn(
            self.source.as_ref(),
            global_root,
            true,
            &self.config.watch,
            handler,
        ) {
            Ok(watch) => *self.global_watch.lock() = Some(watch),
            Err(e) => warn!("Failed to watch {}: {}", global_root.display(), e),
        }
    }

    /// Configured search roots in canonical form. Roots that cannot be
    /// resolved are skipped.
    fn search_roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = Vec::new();
        for root in &self.config.search_roots {
            match root.canonicalize() {
                Ok(resolved) if resolved.is_dir() => {
                    if !roots.contains(&resolved) {
                        roots.push(resolved);
                    }
                }
                Ok(resolved) => warn!("Search root {} is not a directory", resolved.display()),
                Err(e) => warn!("Skipping search root {}: {}", root.display(), e),
            }
        }
        roots
    }

    async fn scan_roots(&self, roots: Vec<PathBuf>) -> Vec<DiscoveryScan> {
        let max_depth = self.config.max_depth;
        let global_store = canonical(self.engine.global_root());

        let scans = tokio::task::spawn_blocking(move || {
            roots
                .iter()
                .map(|root| scan_search_root(root, max_depth, &global_store))
                .collect::<Vec<_>>()
        })
        .await;

        match scans {
            Ok(scans) => scans,
            Err(e) => {
                warn!("Project discovery failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Walk one search root again, monitor projects not seen before and
    /// bring its discovery watch up to date.
    async fn rescan(self: &Arc<Self>, search_root: &Path) {
        let Some(scan) = self.scan_roots(vec![search_root.to_path_buf()]).await.pop() else {
            return;
        };

        for root in &scan.projects {
            if self.projects.contains_key(root) {
                continue;
            }
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            match self.monitor_project(root.clone()).await {
                Ok(true) => info!("Picked up new project {}", root.display()),
                Ok(false) => {}
                Err(e) => warn!("Failed to monitor {}: {}", root.display(), e),
            }
        }

        self.refresh_discovery_watch(scan);
    }

    /// Watch the directories of `scan`, replacing the search root's previous
    /// watch when the set changed.
    fn refresh_discovery_watch(self: &Arc<Self>, scan: DiscoveryScan) {
        let mut discovery = self.discovery.lock();
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        if discovery
            .get(&scan.search_root)
            .is_some_and(|current| current.dirs == scan.watch_dirs)
        {
            return;
        }

        let handler = Arc::new(DiscoveryHandler {
            daemon: Arc::downgrade(self),
            search_root: scan.search_root.clone(),
        });
        match DirectoryWatch::spawn_dirs(
            self.source.as_ref(),
            &scan.search_root,
            &scan.watch_dirs,
            &self.config.watch,
            handler,
        ) {
            Ok(watch) => {
                debug!(
                    "Watching {} director(ies) below {} for new projects",
                    scan.watch_dirs.len(),
                    scan.search_root.display()
                );
                let previous = discovery.insert(
                    scan.search_root,
                    DiscoveryWatch {
                        dirs: scan.watch_dirs,
                        watch,
                    },
                );
                if let Some(previous) = previous {
                    previous.watch.close();
                }
            }
            Err(e) => warn!(
                "Failed to watch search root {}: {}",
                scan.search_root.display(),
                e
            ),
        }
    }
}

/// Canonical form of `path`, or `path` itself when it cannot be resolved.
fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

struct DiscoveryWatch {
    dirs: Vec<PathBuf>,
    watch: DirectoryWatch,
}

/// What one bounded walk of a search root found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryScan {
    pub search_root: PathBuf,

    /// Project roots with an initialized local store
    pub projects: Vec<PathBuf>,

    /// Directories whose direct children can reveal a new project: every
    /// directory within the depth ceiling, plus local stores still missing
    /// their history directory
    pub watch_dirs: Vec<PathBuf>,
}

/// Walk `search_root` for project roots with an initialized local store.
///
/// Project roots deeper than `max_depth` are not found. Hidden directories,
/// `node_modules` and `target` are not entered, and the global store itself
/// (which looks like a local store under the home directory) is never
/// reported.
pub fn discover_projects(search_root: &Path, max_depth: usize, global_store: &Path) -> Vec<PathBuf> {
    scan_search_root(search_root, max_depth, global_store).projects
}

/// Walk `search_root` down to `max_depth`, collecting projects and the
/// directories to watch for new ones. Symlinks are not followed.
pub fn scan_search_root(search_root: &Path, max_depth: usize, global_store: &Path) -> DiscoveryScan {
    let walker = WalkDir::new(search_root)
        .max_depth(max_depth)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_skipped(entry));

    let mut scan = DiscoveryScan {
        search_root: search_root.to_path_buf(),
        ..DiscoveryScan::default()
    };
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Skipping unreadable entry during discovery: {}", e);
                continue;
            }
        };

        if !entry.file_type().is_dir() {
            continue;
        }

        let dir = entry.path();
        scan.watch_dirs.push(dir.to_path_buf());

        let store = paths::local_store_path(dir);
        if store == global_store {
            continue;
        }
        if paths::local_history_path(dir).is_dir() {
            debug!("Discovered project {}", dir.display());
            scan.projects.push(dir.to_path_buf());
        } else if store.is_dir() {
            scan.watch_dirs.push(store);
        }
    }

    scan.projects.sort();
    scan.watch_dirs.sort();
    scan
}

fn is_skipped(entry: &DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_ref())
}

struct LocalChangeHandler {
    daemon: Weak<DaemonInner>,
    root: PathBuf,
}

#[async_trait]
impl BatchHandler for LocalChangeHandler {
    async fn handle(&self, batch: Vec<ChangeEvent>) {
        let relevant = batch
            .iter()
            .any(|e| e.kind.has_content() && paths::is_conversation_file(&e.path));
        if !relevant {
            return;
        }
        if let Some(daemon) = self.daemon.upgrade() {
            daemon.handle_local_change(&self.root).await;
        }
    }
}

struct GlobalChangeHandler {
    daemon: Weak<DaemonInner>,
}

#[async_trait]
impl BatchHandler for GlobalChangeHandler {
    async fn handle(&self, batch: Vec<ChangeEvent>) {
        let relevant = batch
            .iter()
            .any(|e| e.kind.has_content() && paths::is_conversation_file(&e.path));
        if !relevant {
            return;
        }
        if let Some(daemon) = self.daemon.upgrade() {
            let synced = daemon.handle_global_change().await;
            debug!("Global change synced {} project(s)", synced);
        }
    }
}

struct DiscoveryHandler {
    daemon: Weak<DaemonInner>,
    search_root: PathBuf,
}

#[async_trait]
impl BatchHandler for DiscoveryHandler {
    async fn handle(&self, batch: Vec<ChangeEvent>) {
        // Only a new directory can reveal a project
        let grew = batch
            .iter()
            .any(|e| e.kind == ChangeKind::Added && e.path.is_dir());
        if !grew {
            return;
        }
        if let Some(daemon) = self.daemon.upgrade() {
            if daemon.running.load(Ordering::SeqCst) {
                daemon.rescan(&self.search_root).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_project(path: &Path) {
        std::fs::create_dir_all(paths::local_history_path(path)).unwrap();
    }

    #[test]
    fn test_discovery_depth_bound() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        make_project(&root.join("a"));
        make_project(&root.join("a/b/c/d"));
        make_project(&root.join("a/b/c/d/e"));

        let found = discover_projects(root, 4, Path::new("/nonexistent/.claude"));
        assert_eq!(found, vec![root.join("a"), root.join("a/b/c/d")]);
    }

    #[test]
    fn test_discovery_skips_hidden_and_global_store() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        make_project(&root.join(".cache/proj"));
        make_project(&root.join("node_modules/pkg"));
        // The search root itself looks like a project when the global store lives there
        std::fs::create_dir_all(root.join(".claude/history")).unwrap();

        let found = discover_projects(root, 4, &root.join(".claude"));
        assert!(found.is_empty());
    }

    #[test]
    fn test_scan_watches_only_within_depth_ceiling() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        make_project(&root.join("app"));
        std::fs::create_dir_all(root.join("pending/.claude")).unwrap();
        std::fs::create_dir_all(root.join("a/b/c/d/e")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/pkg")).unwrap();

        let scan = scan_search_root(root, 2, Path::new("/nonexistent/.claude"));
        assert_eq!(scan.projects, vec![root.join("app")]);

        let mut expected = vec![
            root.to_path_buf(),
            root.join("a"),
            root.join("a/b"),
            root.join("app"),
            root.join("pending"),
            // Its history directory may still appear
            root.join("pending/.claude"),
        ];
        expected.sort();
        assert_eq!(scan.watch_dirs, expected);
    }
}
