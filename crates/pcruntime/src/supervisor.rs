//! Subordinate process lifecycle: spawn, readiness, liveness probe, kill.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use hyper::StatusCode;
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::address;
use crate::channel::{self, Reply, Request, TransportError};
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::limiter::ConnectionLimiter;
use crate::spawner::{LaunchCommand, ProcessSpawner};

/// A spawned subordinate and its rendezvous socket.
///
/// Dropping it kills the child and removes the socket file.
pub struct RuntimeProcess {
    child: Child,
    pid: Option<u32>,
    socket: PathBuf,
}

impl RuntimeProcess {
    fn new(child: Child, socket: PathBuf) -> Self {
        let pid = child.id();
        Self { child, pid, socket }
    }

    /// OS process id, if the child was still running when spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    fn remove_socket(&self) {
        match std::fs::remove_file(&self.socket) {
            Ok(()) => debug!("Removed socket {}", self.socket.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("Failed to remove socket {}: {err}", self.socket.display()),
        }
    }
}

impl Drop for RuntimeProcess {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
        if self.socket.exists() {
            let _ = std::fs::remove_file(&self.socket);
        }
    }
}

impl std::fmt::Debug for RuntimeProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeProcess")
            .field("pid", &self.pid)
            .field("socket", &self.socket)
            .finish()
    }
}

/// Starts and stops subordinates for one launch command.
#[derive(Clone)]
pub struct Supervisor {
    spawner: Arc<dyn ProcessSpawner>,
    launch: LaunchCommand,
    config: RuntimeConfig,
    limiter: ConnectionLimiter,
}

impl Supervisor {
    /// Supervisor launching `launch` through `spawner`, sending every request under `limiter`.
    pub fn new(
        spawner: Arc<dyn ProcessSpawner>,
        launch: LaunchCommand,
        config: RuntimeConfig,
        limiter: ConnectionLimiter,
    ) -> Self {
        Self {
            spawner,
            launch,
            config,
            limiter,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn launch(&self) -> &LaunchCommand {
        &self.launch
    }

    /// Connection pool shared with every handle built on this supervisor.
    pub fn limiter(&self) -> &ConnectionLimiter {
        &self.limiter
    }

    /// Send one request under the shared connection limit.
    pub async fn send(
        &self,
        socket: &Path,
        request: Request,
    ) -> std::result::Result<Reply, TransportError> {
        channel::send(socket, request, &self.limiter, self.config.request_timeout).await
    }

    /// Spawn with up to `spawn_attempts` fresh socket paths.
    ///
    /// Only readiness failures are retried; a launch failure is returned at once.
    pub async fn spawn_with_retries(&self) -> Result<RuntimeProcess> {
        let attempts = self.config.spawn_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.spawn().await {
                Err(Error::SpawnTimeout { socket, reason }) if attempt < attempts => {
                    warn!(
                        "Spawn attempt {attempt}/{attempts} at {} failed: {reason}",
                        socket.display()
                    );
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Launches one subordinate and waits until it answers a liveness probe.
    ///
    /// # Returns
    /// The ready process, owning its child and a freshly allocated socket path.
    ///
    /// # Process
    /// 1. Allocates an unused socket path under `socket_dir`
    /// 2. Starts the launch command with the path exported as `socket_env`
    /// 3. Polls for the socket file up to `ready_poll_attempts` times,
    ///    stopping early if the child exits
    /// 4. Sends an empty `POST /` and expects 200 within `probe_timeout`
    ///
    /// # Errors
    /// - [`Error::Io`] if no socket path could be allocated
    /// - [`Error::Launch`] if the process cannot be started
    /// - [`Error::SpawnTimeout`] if the socket never appears, the child exits,
    ///   or the probe fails; the child is killed and the socket removed first
    pub async fn spawn(&self) -> Result<RuntimeProcess> {
        let socket = address::allocate(&self.config.socket_dir)?;
        info!("Spawning runtime: {} (socket {})", self.launch, socket.display());

        let child = self
            .spawner
            .spawn_runtime(&self.launch, &socket, &self.config.socket_env)
            .map_err(|source| Error::Launch {
                program: self.launch.program.display().to_string(),
                source,
            })?;
        let mut process = RuntimeProcess::new(child, socket);

        let ready = match self.wait_for_socket(&mut process).await {
            Ok(()) => self.probe(&process).await,
            Err(reason) => Err(reason),
        };

        match ready {
            Ok(()) => {
                info!(
                    "Runtime ready: pid {:?}, socket {}",
                    process.pid,
                    process.socket.display()
                );
                Ok(process)
            }
            Err(reason) => {
                let socket = process.socket.clone();
                self.kill(process).await;
                Err(Error::SpawnTimeout { socket, reason })
            }
        }
    }

    async fn wait_for_socket(&self, process: &mut RuntimeProcess) -> std::result::Result<(), String> {
        for _ in 0..self.config.ready_poll_attempts {
            if process.socket.exists() {
                return Ok(());
            }
            if let Ok(Some(status)) = process.child.try_wait() {
                return Err(format!("process exited before listening ({status})"));
            }
            tokio::time::sleep(self.config.ready_poll_interval).await;
        }
        if process.socket.exists() {
            return Ok(());
        }
        Err(format!(
            "socket did not appear within {:?}",
            self.config.ready_window()
        ))
    }

    async fn probe(&self, process: &RuntimeProcess) -> std::result::Result<(), String> {
        let result = channel::send(
            &process.socket,
            Request::probe(),
            &self.limiter,
            self.config.probe_timeout,
        )
        .await;
        match result {
            Ok(reply) if reply.status == StatusCode::OK => Ok(()),
            Ok(reply) => Err(format!("liveness probe answered {}", reply.status)),
            Err(err) => Err(format!("liveness probe failed: {err}")),
        }
    }

    /// Force-kills a subordinate, reaps it and removes its socket.
    ///
    /// # Process
    /// 1. Sends SIGKILL
    /// 2. Waits up to `kill_timeout` for the child to be reaped
    /// 3. Removes the socket file
    ///
    /// # Notes
    /// Never fails. A process that already exited, a reap that times out and
    /// a socket file that is already gone are only logged.
    pub async fn kill(&self, mut process: RuntimeProcess) {
        info!("Killing runtime process {:?}", process.pid);

        if let Err(err) = process.child.start_kill() {
            warn!("Failed to signal runtime process {:?}: {err}", process.pid);
        }

        match tokio::time::timeout(self.config.kill_timeout, process.child.wait()).await {
            Ok(Ok(status)) => debug!("Runtime process {:?} exited: {status}", process.pid),
            Ok(Err(err)) => warn!("Error waiting for runtime process {:?}: {err}", process.pid),
            Err(_) => warn!(
                "Runtime process {:?} did not exit within {:?} after SIGKILL",
                process.pid, self.config.kill_timeout
            ),
        }

        process.remove_socket();
    }
}
