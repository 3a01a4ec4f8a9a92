//! Runtime handle: one supervised subordinate with respawn-on-failure.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::channel::Request;
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::limiter::ConnectionLimiter;
use crate::spawner::{LaunchCommand, RealProcessSpawner};
use crate::supervisor::{RuntimeProcess, Supervisor};

/// Published address of the current subordinate.
///
/// `generation` increases by one on every respawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub generation: u64,
    pub socket: PathBuf,
    pub pid: Option<u32>,
}

/// Owns one subordinate process and mediates every call to it.
///
/// `evaluate` may be called concurrently; share the handle through an `Arc`.
/// Call [`RuntimeHandle::release`] to stop the subordinate deterministically.
/// Dropping the handle also kills it.
pub struct RuntimeHandle {
    supervisor: Supervisor,
    initial_source: String,
    current: RwLock<Arc<Endpoint>>,
    // Recovery lock. Holds the live process; `None` while a respawn has failed.
    process: Mutex<Option<RuntimeProcess>>,
    released: AtomicBool,
}

impl RuntimeHandle {
    /// Spawns `launch` as a real process and preloads `initial_source`.
    ///
    /// # Parameters
    /// - `launch`: Runtime executable, leading arguments and runner script
    /// - `initial_source`: Script evaluated once in every subordinate this handle starts
    /// - `config`: Timeouts, retry budgets and socket location; `max_connections`
    ///   sizes a connection pool private to this handle
    ///
    /// # Returns
    /// A handle at generation 0 whose subordinate has answered the liveness
    /// probe and evaluated `initial_source`.
    ///
    /// # Errors
    /// - [`Error::Launch`] if the executable cannot be started
    /// - [`Error::SpawnTimeout`] if no attempt became ready, or the initial
    ///   source could not be delivered
    /// - [`Error::ScriptSyntax`] / [`Error::ScriptRuntime`] if `initial_source` fails
    ///
    /// The subordinate is killed before any error is returned.
    pub async fn create(
        launch: LaunchCommand,
        initial_source: impl Into<String>,
        config: RuntimeConfig,
    ) -> Result<Self> {
        let limiter = ConnectionLimiter::new(config.max_connections);
        let supervisor = Supervisor::new(Arc::new(RealProcessSpawner), launch, config, limiter);
        Self::with_supervisor(supervisor, initial_source).await
    }

    /// Create a handle using an existing supervisor (custom spawner, shared limiter).
    pub async fn with_supervisor(
        supervisor: Supervisor,
        initial_source: impl Into<String>,
    ) -> Result<Self> {
        let initial_source = initial_source.into();
        let process = start(&supervisor, &initial_source).await?;
        let endpoint = Endpoint {
            generation: 0,
            socket: process.socket().to_path_buf(),
            pid: process.pid(),
        };

        Ok(Self {
            supervisor,
            initial_source,
            current: RwLock::new(Arc::new(endpoint)),
            process: Mutex::new(Some(process)),
            released: AtomicBool::new(false),
        })
    }

    /// Snapshot of the current subordinate's address.
    pub fn endpoint(&self) -> Arc<Endpoint> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.supervisor.config()
    }

    /// Connection pool shared by every request this handle sends.
    pub fn limiter(&self) -> &ConnectionLimiter {
        self.supervisor.limiter()
    }

    /// True once [`RuntimeHandle::release`] has run.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Evaluates `source` in the subordinate's global scope.
    ///
    /// # Parameters
    /// - `source`: Script text; sent verbatim, percent-encoded
    ///
    /// # Returns
    /// - `Ok(Some(value))` with the JSON value of the last expression
    /// - `Ok(None)` if the script produced no value
    ///
    /// # Errors
    /// - [`Error::ScriptSyntax`] / [`Error::ScriptRuntime`] raised by the script;
    ///   the subordinate is left running
    /// - [`Error::Protocol`] if a successful reply cannot be decoded
    /// - [`Error::SpawnTimeout`] once this call has spent `max_recoveries` respawns
    /// - [`Error::Released`] after [`RuntimeHandle::release`]
    ///
    /// # Notes
    /// A connection failure means the subordinate is dead. The first caller to
    /// notice respawns it, replays the initial source and publishes the next
    /// generation; concurrent callers that failed against the old generation
    /// retry without respawning again. Global state set by earlier calls is
    /// lost on respawn.
    pub async fn evaluate(&self, source: &str) -> Result<Option<Value>> {
        let max_recoveries = self.config().max_recoveries;
        let mut recoveries = 0;

        loop {
            if self.is_released() {
                return Err(Error::Released);
            }

            let endpoint = self.endpoint();
            let failure = match self.supervisor.send(&endpoint.socket, Request::eval(source)).await {
                Ok(reply) => return reply.into_value(),
                Err(err) => err,
            };

            if self.endpoint().generation != endpoint.generation {
                debug!("Runtime was replaced while a request failed ({failure}); retrying");
                continue;
            }

            if recoveries >= max_recoveries {
                return Err(Error::SpawnTimeout {
                    socket: endpoint.socket.clone(),
                    reason: format!("gave up after {recoveries} recoveries: {failure}"),
                });
            }
            recoveries += 1;
            warn!(
                "Runtime at {} failed ({failure}); recovering (attempt {recoveries}/{max_recoveries})",
                endpoint.socket.display()
            );

            if let Err(err) = self.recover(&endpoint).await {
                if matches!(err, Error::Released) || err.is_script_error() || recoveries >= max_recoveries {
                    return Err(err);
                }
                let backoff = self.config().backoff_for(recoveries);
                warn!("Recovery failed: {err}; retrying in {backoff:?}");
                tokio::time::sleep(backoff).await;
            }
        }
    }

    /// Replace the subordinate if `stale` is still the current endpoint.
    async fn recover(&self, stale: &Endpoint) -> Result<()> {
        let mut slot = self.process.lock().await;
        if self.is_released() {
            return Err(Error::Released);
        }
        if self.endpoint().generation != stale.generation {
            debug!("Runtime already replaced by another caller");
            return Ok(());
        }

        if let Some(old) = slot.take() {
            self.supervisor.kill(old).await;
        }

        let process = start(&self.supervisor, &self.initial_source).await?;
        let endpoint = Endpoint {
            generation: stale.generation + 1,
            socket: process.socket().to_path_buf(),
            pid: process.pid(),
        };
        info!(
            "Runtime respawned: generation {}, pid {:?}, socket {}",
            endpoint.generation,
            endpoint.pid,
            endpoint.socket.display()
        );
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(endpoint);
        *slot = Some(process);
        Ok(())
    }

    /// Kill the subordinate. Later `evaluate` calls fail with [`Error::Released`].
    ///
    /// Safe to call more than once.
    pub async fn release(&self) {
        let mut slot = self.process.lock().await;
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(process) = slot.take() {
            self.supervisor.kill(process).await;
        }
        info!("Runtime handle released");
    }
}

/// Spawn a subordinate and seed it with `initial_source`.
async fn start(supervisor: &Supervisor, initial_source: &str) -> Result<RuntimeProcess> {
    let process = supervisor.spawn_with_retries().await?;

    let seeded = match supervisor
        .send(process.socket(), Request::eval(initial_source))
        .await
    {
        Ok(reply) => reply.into_value().map(|_| ()),
        Err(err) => Err(Error::SpawnTimeout {
            socket: process.socket().to_path_buf(),
            reason: format!("initial source could not be loaded: {err}"),
        }),
    };

    match seeded {
        Ok(()) => Ok(process),
        Err(err) => {
            supervisor.kill(process).await;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawner::mock::{FakeBehavior, FakeRuntimeSpawner, MALFORMED_SOURCE};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn handle(spawner: &FakeRuntimeSpawner, dir: &TempDir, source: &str) -> Result<RuntimeHandle> {
        let config = RuntimeConfig {
            ready_poll_attempts: 4,
            ready_poll_interval: Duration::from_millis(10),
            spawn_attempts: 1,
            recovery_backoff: Duration::from_millis(5),
            socket_dir: dir.path().to_path_buf(),
            ..RuntimeConfig::default()
        };
        let supervisor = Supervisor::new(
            Arc::new(spawner.clone()),
            LaunchCommand::new("node", "runner.js"),
            config,
            ConnectionLimiter::new(8),
        );
        RuntimeHandle::with_supervisor(supervisor, source).await
    }

    #[tokio::test]
    async fn test_create_preloads_initial_source() {
        let dir = TempDir::new().expect("TempDir should create test directory");
        let spawner = FakeRuntimeSpawner::default();
        let handle = handle(&spawner, &dir, "var greeting = \"hi\"")
            .await
            .expect("handle should start");

        assert_eq!(handle.endpoint().generation, 0);
        assert_eq!(
            handle.evaluate("greeting").await.expect("evaluate"),
            Some(Value::from("hi"))
        );
        assert_eq!(spawner.evaluation_count(), 2);
    }

    #[tokio::test]
    async fn test_failing_initial_source_is_surfaced() {
        let dir = TempDir::new().expect("TempDir should create test directory");
        let spawner = FakeRuntimeSpawner::default();
        let result = handle(&spawner, &dir, "throw new Error('bad seed')").await;

        match result {
            Err(Error::ScriptRuntime { message, .. }) => assert_eq!(message, "Error: bad seed"),
            Err(other) => panic!("expected ScriptRuntime, got {other:?}"),
            Ok(_) => panic!("handle creation should fail"),
        }
        assert!(
            spawner.sockets().iter().all(|socket| !socket.exists()),
            "the process should be killed"
        );
    }

    #[tokio::test]
    async fn test_script_errors_do_not_respawn() {
        let dir = TempDir::new().expect("TempDir should create test directory");
        let spawner = FakeRuntimeSpawner::default();
        let handle = handle(&spawner, &dir, "").await.expect("handle should start");

        let err = handle.evaluate("(").await.expect_err("syntax error expected");
        assert!(matches!(err, Error::ScriptSyntax { .. }));
        assert_eq!(spawner.spawn_count(), 1);
        assert_eq!(handle.endpoint().generation, 0);
    }

    #[tokio::test]
    async fn test_malformed_reply_is_surfaced_without_respawn() {
        let dir = TempDir::new().expect("TempDir should create test directory");
        let spawner = FakeRuntimeSpawner::default();
        let handle = handle(&spawner, &dir, "").await.expect("handle should start");

        let err = handle
            .evaluate(MALFORMED_SOURCE)
            .await
            .expect_err("undecodable reply should fail");
        assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
        assert_eq!(spawner.spawn_count(), 1);
        assert_eq!(handle.endpoint().generation, 0);

        // The same subordinate keeps serving.
        assert_eq!(handle.evaluate("5").await.expect("evaluate"), Some(Value::from(5)));
    }

    #[tokio::test]
    async fn test_crash_respawns_and_reseeds() {
        let dir = TempDir::new().expect("TempDir should create test directory");
        let spawner = FakeRuntimeSpawner::default();
        let handle = handle(&spawner, &dir, "var counter = 0")
            .await
            .expect("handle should start");

        assert_eq!(handle.evaluate("++counter").await.expect("evaluate"), Some(Value::from(1)));
        assert_eq!(handle.evaluate("++counter").await.expect("evaluate"), Some(Value::from(2)));

        let before = handle.endpoint();
        spawner.crash_latest();

        assert_eq!(handle.evaluate("++counter").await.expect("evaluate"), Some(Value::from(1)));
        let after = handle.endpoint();
        assert_eq!(after.generation, before.generation + 1);
        assert_ne!(after.socket, before.socket);
        assert_eq!(spawner.spawn_count(), 2);
    }

    #[tokio::test]
    async fn test_recovery_budget_escalates_to_spawn_timeout() {
        let dir = TempDir::new().expect("TempDir should create test directory");
        let spawner = FakeRuntimeSpawner::default();
        let handle = handle(&spawner, &dir, "").await.expect("handle should start");

        spawner.set_behavior(FakeBehavior::NeverListens);
        spawner.crash_latest();

        let err = handle.evaluate("1").await.expect_err("recovery should give up");
        assert!(matches!(err, Error::SpawnTimeout { .. }), "got {err:?}");
        let max = handle.config().max_recoveries as usize;
        assert_eq!(spawner.spawn_count(), 1 + max);

        // Once the subordinate can start again the same handle recovers.
        spawner.set_behavior(FakeBehavior::Serve);
        assert_eq!(handle.evaluate("7").await.expect("evaluate"), Some(Value::from(7)));
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_final() {
        let dir = TempDir::new().expect("TempDir should create test directory");
        let spawner = FakeRuntimeSpawner::default();
        let handle = handle(&spawner, &dir, "").await.expect("handle should start");
        let socket = handle.endpoint().socket.clone();

        handle.release().await;
        handle.release().await;

        assert!(handle.is_released());
        assert!(!socket.exists());
        assert!(matches!(handle.evaluate("1").await, Err(Error::Released)));
        assert_eq!(spawner.spawn_count(), 1, "release must not trigger a respawn");
    }
}
