//! Supervision of the background mounting daemon process.
//!
//! One daemon runs per node. It is spawned with an empty temporary config file
//! (profiles are created over the control endpoint), its stderr is drained by a
//! monitor task that keeps the last line for diagnostics, and it is stopped
//! with SIGINT. The daemon is never restarted automatically.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use super::client::DaemonHealth;
use crate::config::DaemonConfig;
use crate::env::flags_to_env;
use crate::error::{DriverError, Result};

/// Interval between readiness probes
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period after SIGINT before the daemon is killed
const STOP_GRACE: Duration = Duration::from_secs(10);

/// A spawned daemon
struct RunningDaemon {
    pid: Pid,
    monitor: JoinHandle<()>,
    /// Removed from disk when dropped
    _config_file: NamedTempFile,
}

/// The node's mounting daemon
pub struct Daemon {
    config: DaemonConfig,
    running: Arc<AtomicBool>,
    last_stderr: Arc<Mutex<String>>,
    state: Mutex<Option<RunningDaemon>>,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            last_stderr: Arc::new(Mutex::new(String::new())),
            state: Mutex::new(None),
        }
    }

    /// Spawn the daemon and wait until its control endpoint accepts connections
    pub async fn start(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            debug!("Daemon already running");
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.config.cache_dir).await?;
        let config_file = tempfile::Builder::new()
            .prefix("rclone-")
            .suffix(".conf")
            .tempfile()?;

        let args = daemon_args(&self.config, config_file.path());
        info!(
            "Starting mounting daemon: {} {}",
            self.config.binary,
            args.join(" ")
        );

        let mut child = Command::new(&self.config.binary)
            .args(&args)
            .envs(flags_to_env(&self.config.flags))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                DriverError::DaemonUnavailable(format!(
                    "cannot spawn {}: {}",
                    self.config.binary, e
                ))
            })?;

        let pid = child
            .id()
            .map(|id| Pid::from_raw(id as i32))
            .ok_or_else(|| DriverError::Internal("daemon exited before reporting a pid".into()))?;

        // Kill the daemon if it never becomes ready
        let guard = scopeguard::guard(pid, |pid| {
            warn!("Killing daemon (PID {}) after failed startup", pid);
            let _ = signal::kill(pid, Signal::SIGKILL);
        });

        self.last_stderr.lock().clear();
        self.running.store(true, Ordering::SeqCst);
        let stderr = child.stderr.take();
        let monitor = tokio::spawn(monitor(
            child,
            stderr,
            self.running.clone(),
            self.last_stderr.clone(),
        ));

        self.wait_ready().await?;

        let pid = scopeguard::ScopeGuard::into_inner(guard);
        info!("Mounting daemon ready on {} (PID {})", self.config.address, pid);

        *self.state.lock() = Some(RunningDaemon {
            pid,
            monitor,
            _config_file: config_file,
        });
        Ok(())
    }

    async fn wait_ready(&self) -> Result<()> {
        let deadline = Instant::now() + self.config.startup_timeout;

        loop {
            if !self.running.load(Ordering::SeqCst) {
                return Err(DriverError::DaemonUnavailable(format!(
                    "daemon exited during startup: {}",
                    self.last_stderr.lock()
                )));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DriverError::DaemonUnavailable(format!(
                    "control endpoint {} not ready after {:?}",
                    self.config.address, self.config.startup_timeout
                )));
            }

            if let Ok(Ok(_)) = timeout(remaining, TcpStream::connect(&self.config.address)).await {
                return Ok(());
            }

            sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Stop the daemon with SIGINT, escalating to SIGKILL after a grace period
    pub async fn stop(&self) -> Result<()> {
        let state = self.state.lock().take();
        let Some(daemon) = state else {
            return Ok(());
        };

        info!("Stopping mounting daemon (PID {})", daemon.pid);
        if let Err(e) = signal::kill(daemon.pid, Signal::SIGINT) {
            warn!("Failed to send SIGINT: {}", e);
        }

        let mut monitor = daemon.monitor;
        if timeout(STOP_GRACE, &mut monitor).await.is_err() {
            warn!("Daemon did not exit after {:?}, sending SIGKILL", STOP_GRACE);
            if let Err(e) = signal::kill(daemon.pid, Signal::SIGKILL) {
                error!("Failed to send SIGKILL: {}", e);
            }
            let _ = monitor.await;
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Mounting daemon stopped");
        Ok(())
    }
}

impl DaemonHealth for Daemon {
    fn is_available(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Drain stderr, then reap the process and record that it is gone
async fn monitor(
    mut child: Child,
    stderr: Option<tokio::process::ChildStderr>,
    running: Arc<AtomicBool>,
    last_line: Arc<Mutex<String>>,
) {
    if let Some(stderr) = stderr {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "rclone", "{}", line);
            *last_line.lock() = line;
        }
    }

    let status = child.wait().await;
    running.store(false, Ordering::SeqCst);

    let last = last_line.lock().clone();
    match status {
        Ok(status) if status.success() => info!("Mounting daemon exited"),
        Ok(status) => error!("Mounting daemon exited with {}: {}", status, last),
        Err(e) => error!("Failed to wait for mounting daemon: {}", e),
    }
}

/// Command-line arguments for `rcd`
pub fn daemon_args(config: &DaemonConfig, config_file: &Path) -> Vec<String> {
    let mut args = vec![
        "rcd".to_string(),
        format!("--rc-addr={}", config.address),
        "--rc-no-auth".to_string(),
        format!("--config={}", config_file.display()),
        format!("--cache-dir={}", config.cache_dir.display()),
        "--cache-info-age=72h".to_string(),
        "--cache-chunk-clean-interval=15m".to_string(),
    ];
    if let Some(log_file) = &config.log_file {
        args.push(format!("--log-file={}", log_file.display()));
    }
    args.extend(config.extra_args.iter().cloned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_daemon_args() {
        let config = DaemonConfig {
            address: "127.0.0.1:15572".to_string(),
            cache_dir: PathBuf::from("/var/cache/rclone"),
            log_file: Some(PathBuf::from("/tmp/rclone.log")),
            extra_args: vec!["--vfs-cache-max-age=1h".to_string()],
            ..Default::default()
        };
        let args = daemon_args(&config, Path::new("/tmp/rclone-x.conf"));
        assert_eq!(
            args,
            vec![
                "rcd",
                "--rc-addr=127.0.0.1:15572",
                "--rc-no-auth",
                "--config=/tmp/rclone-x.conf",
                "--cache-dir=/var/cache/rclone",
                "--cache-info-age=72h",
                "--cache-chunk-clean-interval=15m",
                "--log-file=/tmp/rclone.log",
                "--vfs-cache-max-age=1h",
            ]
        );
    }

    #[test]
    fn test_daemon_args_without_log_file() {
        let args = daemon_args(&DaemonConfig::default(), Path::new("/c"));
        assert!(!args.iter().any(|a| a.starts_with("--log-file")));
    }

    #[tokio::test]
    async fn test_start_missing_binary() {
        let tmp = tempfile::tempdir().unwrap();
        let daemon = Daemon::new(DaemonConfig {
            binary: "/nonexistent/rclone".to_string(),
            cache_dir: tmp.path().join("cache"),
            ..Default::default()
        });

        let err = daemon.start().await.unwrap_err();
        assert!(matches!(err, DriverError::DaemonUnavailable(_)));
        assert!(!daemon.is_available());
    }

    #[tokio::test]
    async fn test_start_fails_when_daemon_exits() {
        let tmp = tempfile::tempdir().unwrap();
        let daemon = Daemon::new(DaemonConfig {
            binary: "true".to_string(),
            address: "127.0.0.1:9".to_string(),
            cache_dir: tmp.path().join("cache"),
            startup_timeout: Duration::from_secs(2),
            ..Default::default()
        });

        assert!(daemon.start().await.is_err());
        assert!(!daemon.is_available());
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let daemon = Daemon::new(DaemonConfig::default());
        daemon.stop().await.unwrap();
        assert!(!daemon.is_available());
    }
}
