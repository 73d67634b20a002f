//! Spawning the llama-server subprocess.

use crate::config::ServerConfig;
use crate::error::{Result, SupervisorError};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// The running inference server.
///
/// Owned exclusively by the [`Supervisor`](super::Supervisor). The ready flag
/// only ever moves from false to true.
#[derive(Debug)]
pub struct ServerHandle {
    child: Option<Child>,
    pid: Option<u32>,
    host: String,
    port: u16,
    ready: bool,
}

/// Snapshot of a handle that can leave the supervisor's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleInfo {
    pub pid: Option<u32>,
    pub port: u16,
}

impl ServerHandle {
    pub(super) fn new(child: Child, host: String, port: u16) -> Self {
        let pid = child.id();
        Self {
            child: Some(child),
            pid,
            host,
            port,
            ready: false,
        }
    }

    /// A handle for a server this process does not own.
    #[cfg(test)]
    pub fn detached(host: &str, port: u16) -> Self {
        Self {
            child: None,
            pid: None,
            host: host.to_string(),
            port,
            ready: false,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn mark_ready(&mut self) {
        debug_assert!(!self.ready, "readiness declared twice");
        self.ready = true;
    }

    pub fn info(&self) -> HandleInfo {
        HandleInfo {
            pid: self.pid,
            port: self.port,
        }
    }

    /// Whether the owned process has exited. Detached handles never exit.
    pub fn has_exited(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => {
                    warn!("Inference server exited with {}", status);
                    true
                }
                Ok(None) => false,
                Err(e) => {
                    warn!("Failed to poll inference server status: {}", e);
                    false
                }
            },
            None => false,
        }
    }

    /// Ask the process to stop, escalating to SIGKILL after `grace`.
    pub async fn terminate(mut self, grace: Duration) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if !grace.is_zero() && send_sigterm(&child) {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    info!("Inference server exited with {}", status);
                    return;
                }
                Ok(Err(e)) => warn!("Failed to wait for inference server: {}", e),
                Err(_) => warn!(
                    "Inference server did not exit within {}s, killing it",
                    grace.as_secs()
                ),
            }
        }

        if let Err(e) = child.kill().await {
            warn!("Failed to kill inference server: {}", e);
        } else {
            info!("Inference server killed");
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return false;
    };
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to send SIGTERM to {}: {}", pid, e);
            false
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> bool {
    false
}

/// Starts inference servers. A trait so the supervisor can be driven
/// without a real binary.
pub trait Launcher: Send + Sync {
    fn launch(&self, config: &ServerConfig) -> Result<ServerHandle>;
}

/// Launches the configured llama-server binary.
#[derive(Debug, Default)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn launch(&self, config: &ServerConfig) -> Result<ServerHandle> {
        if !config.model_path.exists() {
            return Err(SupervisorError::Launch(format!(
                "model file not found: {}",
                config.model_path.display()
            )));
        }

        info!("Starting inference server...");
        info!("Model path: {}", config.model_path.display());
        info!("Server will listen on {}:{}", config.host, config.port);

        let mut child = Command::new(&config.binary)
            .args(server_args(config))
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SupervisorError::Launch(format!("{}: {}", config.binary.display(), e))
            })?;

        if let Some(stdout) = child.stdout.take() {
            drain(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            drain(stderr, "stderr");
        }

        let handle = ServerHandle::new(child, config.host.clone(), config.port);
        info!(
            "Inference server process started (PID {}), waiting for it to be ready...",
            handle.pid().map(|p| p.to_string()).unwrap_or_else(|| "?".into())
        );
        Ok(handle)
    }
}

/// Command-line flags for llama-server.
pub fn server_args(config: &ServerConfig) -> Vec<String> {
    let mut args = vec![
        "-m".to_string(),
        config.model_path.display().to_string(),
        "-c".to_string(),
        config.ctx_size.to_string(),
        "-t".to_string(),
        config.threads.to_string(),
        "-n".to_string(),
        config.n_predict.to_string(),
        "-ngl".to_string(),
        config.gpu_layers.to_string(),
        "--temp".to_string(),
        config.temperature.to_string(),
        "--host".to_string(),
        config.host.clone(),
        "--port".to_string(),
        config.port.to_string(),
    ];
    if config.continuous_batching {
        args.push("-cb".to_string());
    }
    args
}

/// Forward every line of a child pipe into the log until the pipe closes.
fn drain<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        info!(target: "llama_server", stream = stream, "{}", line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Error reading server {}: {}", stream, e);
                    break;
                }
            }
        }
        debug!("Server {} closed", stream);
    });
}
