//! Change watcher for a single project.
//!
//! Watches the project's global-side directory and copies settled changes
//! into local history. With `bidirectional`, local history is watched too and
//! changes are copied back. Every copy goes through the engine's freshness
//! rule, so a file copied one way is never copied straight back.

use crate::engine::{self, CopyOutcome};
use crate::error::Result;
use crate::membership::{self, Membership};
use crate::paths::{self, GlobalLayout};
use crate::watch::{
    BatchHandler, ChangeEvent, ChangeKind, DirectoryWatch, EventSource, NotifyEventSource,
    WatchConfig,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Handle returned by [`ChangeWatcher::on`].
pub type ListenerId = u64;

/// Callback receiving every raw change notification.
pub type ChangeListener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

type ListenerMap = Arc<RwLock<HashMap<ListenerId, ChangeListener>>>;

/// Options for [`ChangeWatcher::start_watching`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    /// Also mirror local changes back to the global side
    pub bidirectional: bool,

    /// Do not report files that already exist when watching starts
    pub ignore_initial: bool,
}

struct ActiveWatch {
    project_root: PathBuf,
    global: DirectoryWatch,
    local: Option<DirectoryWatch>,
}

impl ActiveWatch {
    fn close(&self) {
        self.global.close();
        if let Some(local) = &self.local {
            local.close();
        }
    }
}

/// Watches one project and keeps its local history current.
pub struct ChangeWatcher {
    layout: GlobalLayout,
    config: WatchConfig,
    source: Arc<dyn EventSource>,
    listeners: ListenerMap,
    next_listener: AtomicU64,
    active: Mutex<Option<ActiveWatch>>,
}

impl ChangeWatcher {
    pub fn new(layout: GlobalLayout, config: WatchConfig, source: Arc<dyn EventSource>) -> Self {
        Self {
            layout,
            config,
            source,
            listeners: Arc::new(RwLock::new(HashMap::new())),
            next_listener: AtomicU64::new(1),
            active: Mutex::new(None),
        }
    }

    /// Watcher backed by filesystem notifications.
    pub fn with_notify(layout: GlobalLayout, config: WatchConfig) -> Self {
        let source = Arc::new(NotifyEventSource::new(&config));
        Self::new(layout, config, source)
    }

    /// Start watching. A previous watch is stopped first.
    ///
    /// The global-side directory and local history are created if missing,
    /// since both must exist to be watched.
    pub async fn start_watching(
        &self,
        global_root: &Path,
        project_root: &Path,
        options: WatchOptions,
    ) -> Result<()> {
        self.stop_watching();

        let source_dir = paths::global_source_path(global_root, self.layout, project_root);
        let local_history = paths::local_history_path(project_root);
        tokio::fs::create_dir_all(&source_dir).await?;
        tokio::fs::create_dir_all(&local_history).await?;

        let to_local = Arc::new(MirrorHandler {
            watched_dir: source_dir.clone(),
            destination: local_history.clone(),
            membership_root: self
                .layout
                .requires_membership_filter()
                .then(|| project_root.to_path_buf()),
            listeners: Arc::clone(&self.listeners),
        });
        let global = DirectoryWatch::spawn(
            self.source.as_ref(),
            &source_dir,
            false,
            &self.config,
            to_local.clone(),
        )?;

        let (local, to_global) = if options.bidirectional {
            let handler = Arc::new(MirrorHandler {
                watched_dir: local_history.clone(),
                destination: source_dir.clone(),
                membership_root: None,
                listeners: Arc::clone(&self.listeners),
            });
            let watch = DirectoryWatch::spawn(
                self.source.as_ref(),
                &local_history,
                false,
                &self.config,
                handler.clone(),
            )?;
            (Some(watch), Some(handler))
        } else {
            (None, None)
        };

        *self.active.lock() = Some(ActiveWatch {
            project_root: project_root.to_path_buf(),
            global,
            local,
        });

        info!(
            "Watching {} for {} (bidirectional: {})",
            source_dir.display(),
            project_root.display(),
            options.bidirectional
        );

        if !options.ignore_initial {
            to_local.replay_existing().await;
            if let Some(handler) = to_global {
                handler.replay_existing().await;
            }
        }

        Ok(())
    }

    /// Stop watching. Does nothing when not watching.
    pub fn stop_watching(&self) {
        if let Some(active) = self.active.lock().take() {
            active.close();
            info!("Stopped watching {}", active.project_root.display());
        }
    }

    pub fn is_watching(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Project currently watched, if any.
    pub fn project_root(&self) -> Option<PathBuf> {
        self.active.lock().as_ref().map(|a| a.project_root.clone())
    }

    /// Register a listener for raw change notifications.
    pub fn on<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().insert(id, Arc::new(callback));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        self.listeners.write().remove(&id).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.stop_watching();
    }
}

/// Copies settled changes from one directory into another.
struct MirrorHandler {
    watched_dir: PathBuf,
    destination: PathBuf,
    /// Set when files must belong to this project to be copied
    membership_root: Option<PathBuf>,
    listeners: ListenerMap,
}

impl MirrorHandler {
    fn notify(&self, event: &ChangeEvent) {
        let listeners: Vec<ChangeListener> = self.listeners.read().values().cloned().collect();
        for listener in listeners {
            listener(event);
        }
    }

    /// Report files already present as added and mirror them.
    async fn replay_existing(&self) {
        let existing = match engine::list_candidates(&self.watched_dir).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!("Failed to list {}: {}", self.watched_dir.display(), e);
                return;
            }
        };

        let batch: Vec<ChangeEvent> = existing
            .into_iter()
            .map(|path| ChangeEvent::new(path, ChangeKind::Added))
            .collect();
        for event in &batch {
            self.notify(event);
        }
        self.handle(batch).await;
    }

    async fn mirror(&self, src: &Path) {
        if let Some(root) = &self.membership_root {
            match membership::file_belongs_to_project(src, root).await {
                Membership::Member => {}
                Membership::NotMember => return,
                Membership::Malformed => {
                    debug!("Skipping malformed conversation {}", src.display());
                    return;
                }
            }
        }

        let Some(name) = src.file_name() else {
            return;
        };
        let dst = self.destination.join(name);

        match engine::copy_if_newer(src, &dst).await {
            Ok(CopyOutcome::Copied) => debug!("Mirrored {} -> {}", src.display(), dst.display()),
            Ok(CopyOutcome::UpToDate) => {}
            Err(e) => warn!("Failed to mirror {}: {}", src.display(), e),
        }
    }
}

#[async_trait]
impl BatchHandler for MirrorHandler {
    fn on_raw(&self, event: &ChangeEvent) {
        self.notify(event);
    }

    async fn handle(&self, batch: Vec<ChangeEvent>) {
        for event in batch {
            let in_watched_dir = event.path.parent() == Some(self.watched_dir.as_path());
            if event.kind.has_content()
                && in_watched_dir
                && paths::is_conversation_file(&event.path)
            {
                self.mirror(&event.path).await;
            }
        }
    }
}
