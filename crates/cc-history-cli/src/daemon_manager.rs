//! Background daemon process lifecycle management.
//!
//! `daemon start` re-executes the current binary as `daemon run` with its
//! output redirected to a log file and records the child's PID. The running
//! daemon publishes a [`PublishedStatus`] snapshot as JSON next to the PID
//! file so `daemon status` can report on it without talking to the process.

use anyhow::{Context, Result, bail};
use cc_history::{DaemonStatus, HistoryConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs;
use tokio::process::Command;
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};

pub const PID_FILE: &str = "daemon.pid";
pub const STATUS_FILE: &str = "daemon-status.json";
/// Prefix of the daily rolling log files written by `daemon run`.
pub const LOG_FILE_PREFIX: &str = "daemon.log";
/// Captures anything written to stdout/stderr before logging is set up.
const STDIO_LOG: &str = "daemon.out";

/// Where the daemon keeps its PID, status and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonPaths {
    pub pid_file: PathBuf,
    pub status_file: PathBuf,
    pub log_dir: PathBuf,
}

impl DaemonPaths {
    pub fn new(run_dir: &Path, log_dir: &Path) -> Self {
        Self {
            pid_file: run_dir.join(PID_FILE),
            status_file: run_dir.join(STATUS_FILE),
            log_dir: log_dir.to_path_buf(),
        }
    }

    /// Paths under the state directory (`~/.cc-history`).
    pub fn from_state_dir() -> Result<Self> {
        Ok(Self::new(&HistoryConfig::run_dir()?, &HistoryConfig::logs_dir()?))
    }
}

/// Snapshot written by a running daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedStatus {
    pub pid: u32,
    pub updated_at: DateTime<Utc>,
    pub daemon: DaemonStatus,
}

/// Whether a daemon process is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ProcessState {
    Running { pid: u32 },
    Stopped,
}

pub struct DaemonManager {
    paths: DaemonPaths,
    /// Forwarded to the background process as `--config`
    config_path: Option<PathBuf>,
}

impl DaemonManager {
    pub fn new(paths: DaemonPaths, config_path: Option<PathBuf>) -> Self {
        Self { paths, config_path }
    }

    pub fn paths(&self) -> &DaemonPaths {
        &self.paths
    }

    /// Start the daemon in the background and return its PID.
    pub async fn start(&self) -> Result<u32> {
        if let ProcessState::Running { pid } = self.state().await {
            bail!("Daemon is already running (PID: {})", pid);
        }

        fs::create_dir_all(&self.paths.log_dir)
            .await
            .context("Failed to create log directory")?;
        if let Some(parent) = self.paths.pid_file.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create run directory")?;
        }

        let exe_path = std::env::current_exe().context("Failed to get executable path")?;

        let mut cmd = Command::new(&exe_path);
        cmd.arg("daemon").arg("run");
        if let Some(config_path) = &self.config_path {
            cmd.arg("--config").arg(config_path);
        }

        // Stdio needs std::fs::File, not tokio::fs::File
        let stdio_log = self.paths.log_dir.join(STDIO_LOG);
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&stdio_log)
            .with_context(|| format!("Failed to open {}", stdio_log.display()))?;
        let log_file_clone = log_file.try_clone()?;

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(log_file));
        cmd.stderr(Stdio::from(log_file_clone));
        cmd.kill_on_drop(false);

        let mut child = cmd.spawn().context("Failed to start daemon")?;
        let pid = child.id().context("Failed to get process ID")?;
        self.write_pid(pid).await?;

        // Catch a daemon that dies during startup (bad config, unreadable roots)
        sleep(Duration::from_millis(300)).await;
        if let Some(status) = child.try_wait()? {
            self.remove_pid().await;
            bail!(
                "Daemon exited during startup ({}), see {}",
                status,
                stdio_log.display()
            );
        }

        info!("Daemon started with PID: {}", pid);
        Ok(pid)
    }

    /// Stop the daemon: SIGTERM, then SIGKILL if it does not exit in time.
    pub async fn stop(&self) -> Result<()> {
        let pid = match self.state().await {
            ProcessState::Running { pid } => pid,
            ProcessState::Stopped => bail!("Daemon is not running"),
        };

        info!("Stopping daemon (PID: {})", pid);
        send_signal(pid, false)?;

        for _ in 0..50 {
            sleep(Duration::from_millis(100)).await;
            if !is_process_running(pid) {
                self.remove_pid().await;
                info!("Daemon stopped");
                return Ok(());
            }
        }

        warn!("Daemon did not stop gracefully, forcing kill");
        send_signal(pid, true)?;
        self.remove_pid().await;
        Ok(())
    }

    /// Current process state. A PID file that is unreadable or names a dead
    /// process is stale and gets removed.
    pub async fn state(&self) -> ProcessState {
        let content = match fs::read_to_string(&self.paths.pid_file).await {
            Ok(content) => content,
            Err(_) => return ProcessState::Stopped,
        };

        match parse_pid(&content) {
            Some(pid) if is_process_running(pid) => ProcessState::Running { pid },
            _ => {
                debug!(
                    "Removing stale PID file {}",
                    self.paths.pid_file.display()
                );
                self.remove_pid().await;
                ProcessState::Stopped
            }
        }
    }

    pub async fn write_pid(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.paths.pid_file.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.paths.pid_file, pid.to_string())
            .await
            .context("Failed to write PID file")
    }

    pub async fn remove_pid(&self) {
        let _ = fs::remove_file(&self.paths.pid_file).await;
    }

    /// Write the status snapshot atomically.
    pub async fn publish(&self, status: &PublishedStatus) -> Result<()> {
        if let Some(parent) = self.paths.status_file.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_vec_pretty(status)?;
        let temp_path = self.paths.status_file.with_extension("json.tmp");
        fs::write(&temp_path, content).await?;
        fs::rename(&temp_path, &self.paths.status_file).await?;
        Ok(())
    }

    /// The last snapshot published, if any.
    pub async fn read_status(&self) -> Result<Option<PublishedStatus>> {
        match fs::read(&self.paths.status_file).await {
            Ok(content) => Ok(Some(
                serde_json::from_slice(&content).context("Invalid daemon status file")?,
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_pid(content: &str) -> Option<u32> {
    content.trim().parse::<u32>().ok().filter(|pid| *pid > 0)
}

/// Check if process is running
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        // Signal 0 (None) only checks that the process exists
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

fn send_signal(pid: u32, force: bool) -> Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        kill(Pid::from_raw(pid as i32), signal)
            .with_context(|| format!("Failed to send {} to PID {}", signal, pid))
    }

    #[cfg(not(unix))]
    {
        let _ = (pid, force);
        bail!("Stopping the daemon is only supported on Unix systems")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(temp: &TempDir) -> DaemonManager {
        let paths = DaemonPaths::new(&temp.path().join("run"), &temp.path().join("logs"));
        DaemonManager::new(paths, None)
    }

    #[test]
    fn test_parse_pid() {
        assert_eq!(parse_pid("1234\n"), Some(1234));
        assert_eq!(parse_pid("  42 "), Some(42));
        assert_eq!(parse_pid("0"), None);
        assert_eq!(parse_pid("not a pid"), None);
        assert_eq!(parse_pid(""), None);
    }

    #[tokio::test]
    async fn test_no_pid_file_means_stopped() {
        let temp = TempDir::new().unwrap();
        assert_eq!(manager(&temp).state().await, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_garbage_pid_file_is_removed() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp);
        std::fs::create_dir_all(temp.path().join("run")).unwrap();
        std::fs::write(&manager.paths().pid_file, "garbage").unwrap();

        assert_eq!(manager.state().await, ProcessState::Stopped);
        assert!(!manager.paths().pid_file.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_live_pid_is_running() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp);
        let pid = std::process::id();
        manager.write_pid(pid).await.unwrap();

        assert_eq!(manager.state().await, ProcessState::Running { pid });
        assert!(manager.paths().pid_file.exists());
    }

    #[tokio::test]
    async fn test_stop_without_daemon_fails() {
        let temp = TempDir::new().unwrap();
        assert!(manager(&temp).stop().await.is_err());
    }

    #[tokio::test]
    async fn test_published_status_is_readable() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp);
        assert!(manager.read_status().await.unwrap().is_none());

        let status = PublishedStatus {
            pid: 7,
            updated_at: Utc::now(),
            daemon: DaemonStatus {
                running: true,
                project_count: 0,
                projects: Vec::new(),
                global_root: temp.path().join("global"),
                syncs_completed: 3,
                syncs_skipped: 1,
            },
        };
        manager.publish(&status).await.unwrap();

        let read = manager.read_status().await.unwrap().unwrap();
        assert_eq!(read.pid, 7);
        assert_eq!(read.daemon.syncs_completed, 3);
        assert!(!manager.paths().status_file.with_extension("json.tmp").exists());
    }
}
