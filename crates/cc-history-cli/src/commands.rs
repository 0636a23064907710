//! Command implementations for the cc-history CLI.

use crate::daemon_manager::{DaemonManager, DaemonPaths, ProcessState, PublishedStatus};
use crate::output::{self, ListTable, OutputFormat};
use crate::shutdown;
use anyhow::{Context, Result, anyhow, bail};
use cc_history::daemon::DaemonConfig;
use cc_history::engine::{conversation_metadata_in, list_candidates};
use cc_history::watch::WatchConfig;
use cc_history::{
    ChangeWatcher, GlobalLayout, HistoryConfig, HistoryMode, ProjectInfo, StorageLocation, SyncDaemon,
    SyncEngine, SyncOptions, SyncResult, WatchOptions, detect_project, ignore_file, paths,
};
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// How often a running daemon republishes its status.
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// State shared by every command.
pub struct CliContext {
    pub config: HistoryConfig,
    pub config_path: PathBuf,
    /// Set when the path came from `--config`
    pub explicit_config: bool,
    pub format: OutputFormat,
}

impl CliContext {
    /// Load configuration from `--config`, or the default location.
    pub async fn load(config_path: Option<PathBuf>, format: OutputFormat) -> Result<Self> {
        let explicit_config = config_path.is_some();
        let config_path = match config_path {
            Some(path) => path,
            None => HistoryConfig::config_path()?,
        };
        let config = HistoryConfig::load_from_path_or_default(&config_path)
            .await
            .with_context(|| format!("Failed to load {}", config_path.display()))?;

        Ok(Self {
            config,
            config_path,
            explicit_config,
            format,
        })
    }

    pub fn engine(&self) -> SyncEngine {
        SyncEngine::from_config(&self.config)
    }
}

/// Project containing `path`, or the current directory.
fn resolve_project(path: Option<PathBuf>) -> Result<ProjectInfo> {
    let start = match path {
        Some(path) => path,
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    Ok(detect_project(&start)?)
}

fn report_sync(result: &SyncResult, format: OutputFormat) -> Result<()> {
    if format.is_json() {
        output::json(result)?;
    } else {
        let elapsed = output::format_duration(Duration::from_millis(result.duration_ms));
        if result.success {
            output::success(format!(
                "Synced {} file(s) in {}",
                result.files_processed, elapsed
            ));
        } else {
            output::warning(format!(
                "Synced {} file(s) in {} with {} error(s)",
                result.files_processed,
                elapsed,
                result.errors.len()
            ));
            for error in &result.errors {
                output::error(error);
            }
        }
        if result.files_skipped > 0 {
            output::info(format!(
                "Skipped {} unreadable conversation file(s)",
                result.files_skipped
            ));
        }
    }

    if result.success {
        Ok(())
    } else {
        Err(anyhow!("Sync finished with {} error(s)", result.errors.len()))
    }
}

// ============================================================================
// Project Commands
// ============================================================================

/// Create the local store, optionally update `.gitignore` and run a first sync.
pub async fn init(ctx: &CliContext, path: Option<PathBuf>, no_ignore: bool, sync: bool) -> Result<()> {
    let project = resolve_project(path)?;
    let engine = ctx.engine();

    if engine.is_initialized(&project.root) {
        output::info(format!(
            "Local store already initialized at {}",
            paths::local_history_path(&project.root).display()
        ));
    } else {
        engine.initialize_local_store(&project.root).await?;
        output::success(format!(
            "Initialized local store at {}",
            paths::local_history_path(&project.root).display()
        ));
    }

    if ctx.config.auto_ignore && !no_ignore {
        let added =
            ignore_file::ensure_ignore_patterns(&project.root, &ctx.config.ignore_patterns).await?;
        if added > 0 {
            output::success(format!("Added {} pattern(s) to .gitignore", added));
        }
    }

    if sync || ctx.config.auto_sync {
        if !ctx.config.mode.mirrors_locally() && !sync {
            output::info("Mode is 'global'; skipping the initial sync");
            return Ok(());
        }
        let options = SyncOptions {
            bidirectional: ctx.config.mode.is_bidirectional(),
        };
        let spinner = output::spinner_for(ctx.format, "Syncing conversation history...");
        let result = engine.sync_to_local(&project.root, options).await;
        spinner.finish_and_clear();
        report_sync(&result, ctx.format)?;
    }

    Ok(())
}

/// Run one sync pass. Direction follows the configured mode unless overridden.
pub async fn sync(
    ctx: &CliContext,
    path: Option<PathBuf>,
    to_global: bool,
    one_way: bool,
    force: bool,
) -> Result<()> {
    let project = resolve_project(path)?;
    let engine = ctx.engine();

    if ctx.config.mode == HistoryMode::Global && !to_global && !force {
        output::warning(
            "Mode is 'global': history stays in the global store. Use --force to mirror anyway.",
        );
        return Ok(());
    }

    let spinner = output::spinner_for(ctx.format, "Syncing conversation history...");
    let result = if to_global {
        engine.sync_to_global(&project.root).await
    } else {
        let options = SyncOptions {
            bidirectional: ctx.config.mode.is_bidirectional() && !one_way,
        };
        engine.sync_to_local(&project.root, options).await
    };
    spinner.finish_and_clear();

    report_sync(&result, ctx.format)
}

/// Mirror changes for one project until interrupted.
pub async fn watch(
    ctx: &CliContext,
    path: Option<PathBuf>,
    one_way: bool,
    ignore_initial: bool,
) -> Result<()> {
    let project = resolve_project(path)?;
    if !ctx.config.mode.mirrors_locally() {
        bail!("Mode is 'global': nothing to mirror. Change it with `cc-history config set mode hybrid`");
    }

    let engine = ctx.engine();
    let watcher = ChangeWatcher::with_notify(engine.layout(), WatchConfig::from(&ctx.config.watcher));

    let format = ctx.format;
    watcher.on(move |event| {
        if format.is_json() {
            if let Ok(line) = serde_json::to_string(event) {
                println!("{}", line);
            }
        } else {
            output::info(format!("{:?} {}", event.kind, event.path.display()));
        }
    });

    let options = WatchOptions {
        bidirectional: ctx.config.mode.is_bidirectional() && !one_way,
        ignore_initial,
    };
    watcher
        .start_watching(engine.global_root(), &project.root, options)
        .await?;

    if !format.is_json() {
        output::success(format!(
            "Watching {} ({}). Press Ctrl+C to stop.",
            project.root.display(),
            if options.bidirectional { "bidirectional" } else { "global → local" }
        ));
    }

    shutdown::wait_for_signal().await;
    watcher.stop_watching();

    if !format.is_json() {
        output::info("Stopped watching");
    }
    Ok(())
}

#[derive(Serialize)]
struct LocationReport {
    #[serde(flatten)]
    location: StorageLocation,
    conversations: usize,
}

#[derive(Serialize)]
struct StatusReport {
    project: ProjectInfo,
    mode: HistoryMode,
    layout: GlobalLayout,
    locations: Vec<LocationReport>,
}

/// Storage locations of a project and how many conversations each holds.
pub async fn status(ctx: &CliContext, path: Option<PathBuf>) -> Result<()> {
    let project = resolve_project(path)?;
    let engine = ctx.engine();

    let mut locations = Vec::new();
    for location in paths::storage_locations(engine.global_root(), engine.layout(), &project.root) {
        let conversations = if location.exists {
            list_candidates(&location.path).await?.len()
        } else {
            0
        };
        locations.push(LocationReport {
            location,
            conversations,
        });
    }

    let report = StatusReport {
        project,
        mode: ctx.config.mode,
        layout: engine.layout(),
        locations,
    };

    if ctx.format.is_json() {
        return output::json(&report);
    }

    output::header("Project");
    output::kv("Root", report.project.root.display());
    output::kv("Git repository", report.project.is_repository);
    output::kv("Mode", report.mode);
    output::kv("Layout", report.layout);

    output::header("Storage");
    for entry in &report.locations {
        let state = if entry.location.exists {
            format!("{} conversation file(s)", entry.conversations)
        } else {
            "missing".to_string()
        };
        output::kv(
            format!("{:?}", entry.location.kind),
            format!("{} ({})", entry.location.path.display(), state),
        );
    }

    if !report.project.has_local_store {
        output::info("Run `cc-history init` to create the local store");
    }
    Ok(())
}

/// Table of conversations in the local store, or the global one with `--global`.
pub async fn list(ctx: &CliContext, path: Option<PathBuf>, global: bool) -> Result<()> {
    let project = resolve_project(path)?;
    let engine = ctx.engine();
    let dir = if global {
        engine.global_dir_for(&project.root)
    } else {
        paths::local_history_path(&project.root)
    };

    let scan = conversation_metadata_in(&dir).await?;

    if ctx.format.is_json() {
        return output::json(&scan);
    }

    if scan.conversations.is_empty() {
        output::info(format!("No conversations in {}", dir.display()));
    } else {
        let mut table = ListTable::new(["ID", "Title", "Messages", "Size", "Modified"]);
        for conversation in &scan.conversations {
            table.push([
                conversation.id.clone(),
                conversation.title.clone().unwrap_or_else(|| "-".to_string()),
                conversation.message_count.to_string(),
                output::format_bytes(conversation.size_bytes),
                output::format_timestamp(conversation.modified_at),
            ]);
        }
        table.print();
    }

    if scan.skipped > 0 {
        output::warning(format!("Skipped {} unreadable file(s)", scan.skipped));
    }
    Ok(())
}

/// Remove the local store after confirmation.
pub async fn clean(
    ctx: &CliContext,
    path: Option<PathBuf>,
    preserve_config: bool,
    yes: bool,
) -> Result<()> {
    let project = resolve_project(path)?;
    let target = if preserve_config {
        paths::local_history_path(&project.root)
    } else {
        paths::local_store_path(&project.root)
    };

    if !paths::path_exists(&target) {
        output::info(format!("Nothing to clean at {}", target.display()));
        return Ok(());
    }

    if !yes && !output::confirm(format!("Delete {}?", target.display()))? {
        output::info("Aborted");
        return Ok(());
    }

    ctx.engine()
        .clean_local_store(&project.root, preserve_config)
        .await?;
    output::success(format!("Removed {}", target.display()));
    Ok(())
}

/// Patterns from the command line, or the configured ones.
fn patterns_or_default(ctx: &CliContext, patterns: Vec<String>) -> Vec<String> {
    if patterns.is_empty() {
        ctx.config.ignore_patterns.clone()
    } else {
        patterns
    }
}

pub async fn ignore_add(ctx: &CliContext, path: Option<PathBuf>, patterns: Vec<String>) -> Result<()> {
    let project = resolve_project(path)?;
    let patterns = patterns_or_default(ctx, patterns);
    let added = ignore_file::ensure_ignore_patterns(&project.root, &patterns).await?;
    if added == 0 {
        output::info(".gitignore already contains every pattern");
    } else {
        output::success(format!("Added {} pattern(s) to .gitignore", added));
    }
    Ok(())
}

pub async fn ignore_remove(
    ctx: &CliContext,
    path: Option<PathBuf>,
    patterns: Vec<String>,
) -> Result<()> {
    let project = resolve_project(path)?;
    let patterns = if patterns.is_empty() {
        ignore_file::managed_patterns(&project.root).await?
    } else {
        patterns
    };
    let removed = ignore_file::remove_ignore_patterns(&project.root, &patterns).await?;
    output::success(format!("Removed {} pattern(s) from .gitignore", removed));
    Ok(())
}

// ============================================================================
// Configuration Commands
// ============================================================================

pub async fn config_get(ctx: &CliContext, key: String) -> Result<()> {
    let value = ctx
        .config
        .get_value(&key)
        .with_context(|| format!("Valid keys: {}", HistoryConfig::keys().join(", ")))?;
    println!("{}", value);
    Ok(())
}

pub async fn config_set(ctx: &mut CliContext, key: String, value: String) -> Result<()> {
    ctx.config.set_value(&key, &value)?;
    ctx.config.save_to_path(&ctx.config_path).await?;
    output::success(format!("Set {} = {}", key, value));
    Ok(())
}

pub async fn config_list(ctx: &CliContext) -> Result<()> {
    let entries = ctx.config.entries();

    if ctx.format.is_json() {
        let map: serde_json::Map<String, serde_json::Value> = entries
            .into_iter()
            .map(|(key, value)| (key.to_string(), serde_json::Value::String(value)))
            .collect();
        return output::json(&map);
    }

    output::header("Configuration");
    for (key, value) in entries {
        output::kv(key, if value.is_empty() { "-".to_string() } else { value });
    }
    Ok(())
}

pub async fn config_path(ctx: &CliContext) -> Result<()> {
    println!("{}", ctx.config_path.display());
    Ok(())
}

// ============================================================================
// Daemon Commands
// ============================================================================

fn daemon_manager(ctx: &CliContext) -> Result<DaemonManager> {
    let config_path = ctx.explicit_config.then(|| ctx.config_path.clone());
    Ok(DaemonManager::new(DaemonPaths::from_state_dir()?, config_path))
}

pub async fn daemon_start(ctx: &CliContext) -> Result<()> {
    let manager = daemon_manager(ctx)?;
    let spinner = output::spinner_for(ctx.format, "Starting daemon...");
    let started = manager.start().await;
    spinner.finish_and_clear();

    let pid = started?;
    output::success(format!("Daemon started (PID: {})", pid));
    output::kv("Logs", manager.paths().log_dir.display());
    Ok(())
}

pub async fn daemon_stop(ctx: &CliContext) -> Result<()> {
    let manager = daemon_manager(ctx)?;
    manager.stop().await?;
    output::success("Daemon stopped");
    Ok(())
}

#[derive(Serialize)]
struct DaemonReport {
    #[serde(flatten)]
    state: ProcessState,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_status: Option<PublishedStatus>,
}

pub async fn daemon_status(ctx: &CliContext) -> Result<()> {
    let manager = daemon_manager(ctx)?;
    let state = manager.state().await;
    let last_status = match state {
        ProcessState::Running { .. } => manager.read_status().await?,
        ProcessState::Stopped => None,
    };
    let report = DaemonReport { state, last_status };

    if ctx.format.is_json() {
        return output::json(&report);
    }

    match report.state {
        ProcessState::Running { pid } => output::success(format!("Daemon is running (PID: {})", pid)),
        ProcessState::Stopped => {
            output::info("Daemon is not running");
            return Ok(());
        }
    }

    let Some(published) = report.last_status else {
        output::info("The daemon has not published its status yet");
        return Ok(());
    };

    output::kv("Global store", published.daemon.global_root.display());
    output::kv("Updated", output::format_timestamp(published.updated_at));
    output::kv("Syncs completed", published.daemon.syncs_completed);
    output::kv("Syncs skipped", published.daemon.syncs_skipped);

    if published.daemon.projects.is_empty() {
        output::info("No projects monitored");
    } else {
        let mut table = ListTable::new(["Project", "Monitored since", "Last sync", "Syncs"]);
        for project in &published.daemon.projects {
            table.push([
                project.root.display().to_string(),
                output::format_timestamp(project.monitored_since),
                project
                    .last_sync
                    .map(output::format_timestamp)
                    .unwrap_or_else(|| "never".to_string()),
                project.sync_count.to_string(),
            ]);
        }
        table.print();
    }
    Ok(())
}

/// Run the daemon in the foreground until SIGTERM or Ctrl+C.
pub async fn daemon_run(ctx: &CliContext) -> Result<()> {
    let manager = daemon_manager(ctx)?;
    let own_pid = std::process::id();
    if let ProcessState::Running { pid } = manager.state().await {
        if pid != own_pid {
            bail!("Daemon is already running (PID: {})", pid);
        }
    }
    manager.write_pid(own_pid).await?;

    let daemon = SyncDaemon::with_notify(ctx.engine(), DaemonConfig::from_config(&ctx.config));
    let started = daemon.start().await;
    let count = match started {
        Ok(count) => count,
        Err(e) => {
            manager.remove_pid().await;
            return Err(e.into());
        }
    };
    info!("Daemon monitoring {} project(s)", count);

    publish(&manager, &daemon, own_pid).await;

    let mut interval = tokio::time::interval(STATUS_INTERVAL);
    interval.tick().await;

    let stop_signal = shutdown::wait_for_signal();
    tokio::pin!(stop_signal);

    loop {
        tokio::select! {
            _ = &mut stop_signal => break,
            _ = interval.tick() => publish(&manager, &daemon, own_pid).await,
        }
    }

    daemon.stop();
    publish(&manager, &daemon, own_pid).await;
    manager.remove_pid().await;
    info!("Daemon stopped");
    Ok(())
}

async fn publish(manager: &DaemonManager, daemon: &SyncDaemon, pid: u32) {
    let status = PublishedStatus {
        pid,
        updated_at: Utc::now(),
        daemon: daemon.status(),
    };
    if let Err(e) = manager.publish(&status).await {
        warn!("Failed to publish daemon status: {:#}", e);
    }
}

/// Directory that `daemon run` writes its rolling log files to.
pub fn daemon_log_dir() -> Result<PathBuf> {
    Ok(DaemonPaths::from_state_dir()?.log_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context(temp: &TempDir, mode: HistoryMode) -> CliContext {
        let config = HistoryConfig {
            mode,
            global_path: Some(temp.path().join("global")),
            auto_ignore: true,
            ..HistoryConfig::default()
        };
        CliContext {
            config,
            config_path: temp.path().join("config.toml"),
            explicit_config: true,
            format: OutputFormat::Plain,
        }
    }

    fn project(temp: &TempDir) -> PathBuf {
        let root = temp.path().join("app");
        std::fs::create_dir_all(&root).unwrap();
        root.canonicalize().unwrap()
    }

    #[tokio::test]
    async fn test_init_creates_store_and_ignore_entries() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp, HistoryMode::Hybrid);
        let root = project(&temp);

        init(&ctx, Some(root.clone()), false, false).await.unwrap();

        assert!(paths::local_history_path(&root).is_dir());
        let gitignore = std::fs::read_to_string(root.join(".gitignore")).unwrap();
        assert!(gitignore.contains(".claude/history/"));

        // Running it again changes nothing
        init(&ctx, Some(root.clone()), false, false).await.unwrap();
        let again = std::fs::read_to_string(root.join(".gitignore")).unwrap();
        assert_eq!(gitignore, again);
    }

    #[tokio::test]
    async fn test_init_no_ignore_leaves_gitignore_alone() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp, HistoryMode::Hybrid);
        let root = project(&temp);

        init(&ctx, Some(root.clone()), true, false).await.unwrap();
        assert!(!root.join(".gitignore").exists());
    }

    #[tokio::test]
    async fn test_sync_declined_in_global_mode() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp, HistoryMode::Global);
        let root = project(&temp);

        sync(&ctx, Some(root.clone()), false, false, false)
            .await
            .unwrap();
        assert!(!paths::local_history_path(&root).exists());

        sync(&ctx, Some(root.clone()), false, false, true)
            .await
            .unwrap();
        assert!(paths::local_history_path(&root).is_dir());
    }

    #[tokio::test]
    async fn test_sync_to_global_fails_without_store() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp, HistoryMode::Hybrid);
        let root = project(&temp);

        assert!(sync(&ctx, Some(root), true, false, false).await.is_err());
    }

    #[tokio::test]
    async fn test_config_set_saves_file() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp, HistoryMode::Hybrid);

        config_set(&mut ctx, "daemon.max_depth".to_string(), "2".to_string())
            .await
            .unwrap();
        assert_eq!(ctx.config.daemon.max_depth, 2);

        let saved = HistoryConfig::load_from_path(&ctx.config_path).await.unwrap();
        assert_eq!(saved.daemon.max_depth, 2);

        assert!(
            config_set(&mut ctx, "no.such.key".to_string(), "1".to_string())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_clean_with_yes_removes_store() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp, HistoryMode::Hybrid);
        let root = project(&temp);
        init(&ctx, Some(root.clone()), true, false).await.unwrap();

        clean(&ctx, Some(root.clone()), false, true).await.unwrap();
        assert!(!paths::local_store_path(&root).exists());
    }
}
