//! Debounced directory watching.
//!
//! A watch is a bounded channel of [`ChangeEvent`]s per watched root, drained
//! by one task that coalesces events per path and hands a batch to a
//! [`BatchHandler`] once the root has been quiet for the settle window.
//!
//! Where events come from is pluggable through [`EventSource`]:
//! [`NotifyEventSource`] turns real filesystem notifications into events,
//! [`ManualEventSource`] lets callers inject them directly.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Kind of change observed for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Changed,
    Removed,
}

impl ChangeKind {
    /// Whether the path may now hold content worth copying.
    pub fn has_content(&self) -> bool {
        matches!(self, Self::Added | Self::Changed)
    }
}

/// A single change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            timestamp: Utc::now(),
        }
    }
}

/// Timing and capacity of a watch.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Quiet period after the last event before a batch is handed over
    pub settle: Duration,

    /// Poll interval of the polling backend
    pub poll_interval: Duration,

    /// Poll the filesystem instead of using native notifications
    pub use_polling: bool,

    /// Capacity of the per-root event channel
    pub channel_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(2000),
            poll_interval: Duration::from_millis(1000),
            use_polling: false,
            channel_capacity: 256,
        }
    }
}

impl From<&crate::config::WatcherSettings> for WatchConfig {
    fn from(settings: &crate::config::WatcherSettings) -> Self {
        Self {
            settle: Duration::from_millis(settings.settle_ms),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            use_polling: settings.use_polling,
            channel_capacity: settings.channel_capacity.max(1),
        }
    }
}

/// Keeps an event source subscription alive. Dropping it stops delivery.
pub struct Subscription {
    _guard: Box<dyn Any + Send>,
}

impl Subscription {
    pub fn new<T: Any + Send>(guard: T) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Produces change events for a directory.
pub trait EventSource: Send + Sync {
    /// Start delivering events for `root` into `sender`.
    fn subscribe(
        &self,
        root: &Path,
        recursive: bool,
        sender: mpsc::Sender<ChangeEvent>,
    ) -> Result<Subscription>;

    /// Start delivering events for the direct children of every directory in
    /// `dirs`. Directories that cannot be watched are skipped.
    fn subscribe_dirs(
        &self,
        dirs: &[PathBuf],
        sender: mpsc::Sender<ChangeEvent>,
    ) -> Result<Subscription> {
        let mut subscriptions = Vec::with_capacity(dirs.len());
        for dir in dirs {
            match self.subscribe(dir, false, sender.clone()) {
                Ok(subscription) => subscriptions.push(subscription),
                Err(e) => warn!("Failed to watch {}: {}", dir.display(), e),
            }
        }
        Ok(Subscription::new(subscriptions))
    }
}

/// Event source backed by `notify`.
#[derive(Debug, Clone, Default)]
pub struct NotifyEventSource {
    use_polling: bool,
    poll_interval: Duration,
}

impl NotifyEventSource {
    pub fn new(config: &WatchConfig) -> Self {
        Self {
            use_polling: config.use_polling,
            poll_interval: config.poll_interval,
        }
    }

    fn backend(&self) -> &'static str {
        if self.use_polling { "polling" } else { "native" }
    }

    fn watcher(&self, sender: mpsc::Sender<ChangeEvent>) -> Result<Box<dyn Watcher + Send>> {
        let handler = move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for change in convert_event(event) {
                    if !forward(&sender, change) {
                        break;
                    }
                }
            }
            Err(e) => warn!("Watch error: {}", e),
        };

        if self.use_polling {
            let config = notify::Config::default().with_poll_interval(self.poll_interval);
            Ok(Box::new(PollWatcher::new(handler, config)?))
        } else {
            Ok(Box::new(notify::recommended_watcher(handler)?))
        }
    }
}

impl EventSource for NotifyEventSource {
    fn subscribe(
        &self,
        root: &Path,
        recursive: bool,
        sender: mpsc::Sender<ChangeEvent>,
    ) -> Result<Subscription> {
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };

        let mut watcher = self.watcher(sender)?;
        watcher.watch(root, mode)?;
        debug!("Watching {} ({})", root.display(), self.backend());
        Ok(Subscription::new(watcher))
    }

    /// One notify watcher for the whole set.
    fn subscribe_dirs(
        &self,
        dirs: &[PathBuf],
        sender: mpsc::Sender<ChangeEvent>,
    ) -> Result<Subscription> {
        let mut watcher = self.watcher(sender)?;
        let mut watched = 0;
        for dir in dirs {
            match watcher.watch(dir, RecursiveMode::NonRecursive) {
                Ok(()) => watched += 1,
                Err(e) => warn!("Failed to watch {}: {}", dir.display(), e),
            }
        }
        debug!("Watching {} of {} director(ies) ({})", watched, dirs.len(), self.backend());
        Ok(Subscription::new(watcher))
    }
}

/// Push an event from a notify thread. Returns false once the receiver is gone.
fn forward(sender: &mpsc::Sender<ChangeEvent>, change: ChangeEvent) -> bool {
    match sender.try_send(change) {
        Ok(()) => true,
        Err(TrySendError::Full(change)) => {
            if tokio::runtime::Handle::try_current().is_ok() {
                warn!("Event channel full, dropping event for {}", change.path.display());
                true
            } else {
                sender.blocking_send(change).is_ok()
            }
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Map a notify event onto zero or more change events.
fn convert_event(event: Event) -> Vec<ChangeEvent> {
    let mut paths = event.paths.into_iter();

    match event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => paths
            .map(|p| ChangeEvent::new(p, ChangeKind::Added))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => paths
            .map(|p| ChangeEvent::new(p, ChangeKind::Removed))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let from = paths.next();
            let to = paths.next();
            from.map(|p| ChangeEvent::new(p, ChangeKind::Removed))
                .into_iter()
                .chain(to.map(|p| ChangeEvent::new(p, ChangeKind::Added)))
                .collect()
        }
        EventKind::Modify(_) => paths
            .map(|p| ChangeEvent::new(p, ChangeKind::Changed))
            .collect(),
        _ => Vec::new(),
    }
}

/// Event source fed by hand. Events reach every live subscription whose root
/// covers the path.
#[derive(Clone, Default)]
pub struct ManualEventSource {
    subscribers: Arc<Mutex<Vec<ManualSubscriber>>>,
}

struct ManualSubscriber {
    root: PathBuf,
    recursive: bool,
    sender: mpsc::Sender<ChangeEvent>,
}

impl ManualSubscriber {
    fn covers(&self, path: &Path) -> bool {
        if self.recursive {
            path.starts_with(&self.root)
        } else {
            path.parent() == Some(self.root.as_path())
        }
    }
}

impl ManualEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event; returns how many subscriptions received it.
    pub async fn emit(&self, path: impl Into<PathBuf>, kind: ChangeKind) -> usize {
        let event = ChangeEvent::new(path, kind);
        let senders: Vec<_> = {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|s| !s.sender.is_closed());
            subscribers
                .iter()
                .filter(|s| s.covers(&event.path))
                .map(|s| s.sender.clone())
                .collect()
        };

        let mut delivered = 0;
        for sender in senders {
            if sender.send(event.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Roots with a live subscription.
    pub fn subscribed_roots(&self) -> Vec<PathBuf> {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.sender.is_closed());
        subscribers.iter().map(|s| s.root.clone()).collect()
    }

    pub fn is_subscribed(&self, root: &Path) -> bool {
        self.subscribed_roots().iter().any(|r| r == root)
    }
}

impl EventSource for ManualEventSource {
    fn subscribe(
        &self,
        root: &Path,
        recursive: bool,
        sender: mpsc::Sender<ChangeEvent>,
    ) -> Result<Subscription> {
        self.subscribers.lock().push(ManualSubscriber {
            root: root.to_path_buf(),
            recursive,
            sender,
        });
        Ok(Subscription::new(()))
    }
}

/// Receives the events of one watch.
#[async_trait]
pub trait BatchHandler: Send + Sync + 'static {
    /// Called for every event as it arrives, before coalescing.
    fn on_raw(&self, _event: &ChangeEvent) {}

    /// Called with the coalesced events of a settled burst, sorted by path.
    async fn handle(&self, batch: Vec<ChangeEvent>);
}

/// A running debounced watch on one root.
///
/// Closing (or dropping) the watch cancels its task and drops the source
/// subscription. A batch already being handled runs to completion.
pub struct DirectoryWatch {
    root: PathBuf,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DirectoryWatch {
    /// Subscribe to `root` and start the debounce task.
    pub fn spawn(
        source: &dyn EventSource,
        root: &Path,
        recursive: bool,
        config: &WatchConfig,
        handler: Arc<dyn BatchHandler>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let subscription = source.subscribe(root, recursive, tx)?;
        Ok(Self::start(root, rx, subscription, config, handler))
    }

    /// Watch the direct children of every directory in `dirs` as one
    /// debounced stream. `root` only names the watch.
    pub fn spawn_dirs(
        source: &dyn EventSource,
        root: &Path,
        dirs: &[PathBuf],
        config: &WatchConfig,
        handler: Arc<dyn BatchHandler>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let subscription = source.subscribe_dirs(dirs, tx)?;
        Ok(Self::start(root, rx, subscription, config, handler))
    }

    fn start(
        root: &Path,
        rx: mpsc::Receiver<ChangeEvent>,
        subscription: Subscription,
        config: &WatchConfig,
        handler: Arc<dyn BatchHandler>,
    ) -> Self {
        let cancel = CancellationToken::new();

        let task = tokio::spawn(debounce_loop(
            root.to_path_buf(),
            rx,
            handler,
            config.settle,
            cancel.clone(),
            subscription,
        ));

        Self {
            root: root.to_path_buf(),
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the watch. Safe to call more than once.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Stop the watch and wait for its task to finish.
    pub async fn shutdown(&self) {
        self.close();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Watch task for {} ended abnormally: {}", self.root.display(), e);
            }
        }
    }
}

impl Drop for DirectoryWatch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for DirectoryWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryWatch")
            .field("root", &self.root)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn debounce_loop(
    root: PathBuf,
    mut rx: mpsc::Receiver<ChangeEvent>,
    handler: Arc<dyn BatchHandler>,
    settle: Duration,
    cancel: CancellationToken,
    subscription: Subscription,
) {
    let _subscription = subscription;
    let mut pending: HashMap<PathBuf, ChangeEvent> = HashMap::new();
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Watch on {} cancelled", root.display());
                break;
            }

            event = rx.recv() => match event {
                Some(event) => {
                    handler.on_raw(&event);
                    coalesce(&mut pending, event);
                    deadline = Some(Instant::now() + settle);
                }
                None => {
                    if !pending.is_empty() {
                        handler.handle(drain(&mut pending)).await;
                    }
                    break;
                }
            },

            _ = wait_until(deadline) => {
                deadline = None;
                let batch = drain(&mut pending);
                if !batch.is_empty() {
                    debug!("Settled {} change(s) under {}", batch.len(), root.display());
                    handler.handle(batch).await;
                }
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn coalesce(pending: &mut HashMap<PathBuf, ChangeEvent>, event: ChangeEvent) {
    match pending.get_mut(&event.path) {
        Some(existing) => {
            existing.kind = merge_kinds(existing.kind, event.kind);
            existing.timestamp = event.timestamp;
        }
        None => {
            pending.insert(event.path.clone(), event);
        }
    }
}

/// Combine two events for the same path within one burst.
fn merge_kinds(old: ChangeKind, new: ChangeKind) -> ChangeKind {
    match (old, new) {
        // Added then changed is still new to observers
        (ChangeKind::Added, ChangeKind::Changed) => ChangeKind::Added,
        // Removed then re-added means the content changed
        (ChangeKind::Removed, ChangeKind::Added) => ChangeKind::Changed,
        (_, new) => new,
    }
}

fn drain(pending: &mut HashMap<PathBuf, ChangeEvent>) -> Vec<ChangeEvent> {
    let mut batch: Vec<_> = pending.drain().map(|(_, event)| event).collect();
    batch.sort_by(|a, b| a.path.cmp(&b.path));
    batch
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        raw: Mutex<Vec<ChangeEvent>>,
        batches: Mutex<Vec<Vec<ChangeEvent>>>,
    }

    #[async_trait]
    impl BatchHandler for Recorder {
        fn on_raw(&self, event: &ChangeEvent) {
            self.raw.lock().push(event.clone());
        }

        async fn handle(&self, batch: Vec<ChangeEvent>) {
            self.batches.lock().push(batch);
        }
    }

    fn fast_config() -> WatchConfig {
        WatchConfig {
            settle: Duration::from_millis(50),
            ..WatchConfig::default()
        }
    }

    #[test]
    fn test_merge_kinds() {
        use ChangeKind::*;
        assert_eq!(merge_kinds(Added, Changed), Added);
        assert_eq!(merge_kinds(Changed, Changed), Changed);
        assert_eq!(merge_kinds(Added, Removed), Removed);
        assert_eq!(merge_kinds(Changed, Removed), Removed);
        assert_eq!(merge_kinds(Removed, Added), Changed);
    }

    #[test]
    fn test_convert_rename_both() {
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/h/a.jsonl"))
            .add_path(PathBuf::from("/h/b.jsonl"));
        let changes = convert_event(event);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].kind, ChangeKind::Removed);
        assert_eq!(changes[1].kind, ChangeKind::Added);
        assert_eq!(changes[1].path, PathBuf::from("/h/b.jsonl"));
    }

    #[test]
    fn test_convert_ignores_access() {
        let event = Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(PathBuf::from("/h/a.jsonl"));
        assert!(convert_event(event).is_empty());
    }

    #[tokio::test]
    async fn test_burst_is_coalesced() {
        let source = ManualEventSource::new();
        let recorder = Arc::new(Recorder::default());
        let root = PathBuf::from("/watched");

        let watch =
            DirectoryWatch::spawn(&source, &root, false, &fast_config(), recorder.clone()).unwrap();
        assert!(source.is_subscribed(&root));

        source.emit("/watched/a.jsonl", ChangeKind::Added).await;
        source.emit("/watched/a.jsonl", ChangeKind::Changed).await;
        source.emit("/watched/b.jsonl", ChangeKind::Changed).await;
        // Outside a non-recursive root
        assert_eq!(source.emit("/watched/deep/c.jsonl", ChangeKind::Added).await, 0);

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(recorder.raw.lock().len(), 3);
        let batches = recorder.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[0][0].path, PathBuf::from("/watched/a.jsonl"));
        assert_eq!(batches[0][0].kind, ChangeKind::Added);
        assert_eq!(batches[0][1].kind, ChangeKind::Changed);
        drop(batches);

        watch.shutdown().await;
    }

    #[tokio::test]
    async fn test_directory_set_is_one_stream() {
        let source = ManualEventSource::new();
        let recorder = Arc::new(Recorder::default());
        let dirs = vec![PathBuf::from("/code"), PathBuf::from("/code/app")];

        let watch = DirectoryWatch::spawn_dirs(
            &source,
            Path::new("/code"),
            &dirs,
            &fast_config(),
            recorder.clone(),
        )
        .unwrap();
        let mut roots = source.subscribed_roots();
        roots.sort();
        assert_eq!(roots, dirs);

        assert_eq!(source.emit("/code/new", ChangeKind::Added).await, 1);
        assert_eq!(source.emit("/code/app/.claude", ChangeKind::Added).await, 1);
        // Grandchildren of a watched directory are not delivered
        assert_eq!(source.emit("/code/app/src/main.rs", ChangeKind::Changed).await, 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        {
            let batches = recorder.batches.lock();
            assert_eq!(batches.len(), 1);
            assert_eq!(batches[0].len(), 2);
        }

        watch.shutdown().await;
        assert!(source.subscribed_roots().is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_delivery() {
        let source = ManualEventSource::new();
        let recorder = Arc::new(Recorder::default());
        let root = PathBuf::from("/watched");

        let watch =
            DirectoryWatch::spawn(&source, &root, true, &fast_config(), recorder.clone()).unwrap();
        watch.close();
        watch.close();
        assert!(watch.is_closed());
        watch.shutdown().await;

        assert!(!source.is_subscribed(&root));
        assert_eq!(source.emit("/watched/a.jsonl", ChangeKind::Added).await, 0);
        assert!(recorder.batches.lock().is_empty());
    }
}
