//! Named runtime definitions that resolve their command and create handles.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use tracing::{debug, info};

use crate::command;
use crate::config::RuntimeConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::handle::RuntimeHandle;
use crate::limiter::ConnectionLimiter;
use crate::spawner::{LaunchCommand, ProcessSpawner, RealProcessSpawner};
use crate::supervisor::Supervisor;

/// Source of the bundled subordinate script.
pub const RUNNER_SOURCE: &str = include_str!("../js/runner.js");

/// Command candidates tried for the Node.js runtime, in order.
pub const NODE_COMMANDS: &[&str] = &["nodejs", "node"];

/// A JavaScript runtime that can host process-backed contexts.
///
/// Every handle created from one `Runtime` shares its connection limiter.
pub struct Runtime {
    name: String,
    commands: Vec<String>,
    runner: Option<PathBuf>,
    config: RuntimeConfig,
    spawner: Arc<dyn ProcessSpawner>,
    limiter: ConnectionLimiter,
    resolved: OnceLock<Option<(PathBuf, Vec<String>)>>,
}

impl Runtime {
    /// The Node.js process runtime.
    pub fn node() -> Self {
        Self::new("Node.js (V8) Process as Context", NODE_COMMANDS.iter().copied())
    }

    /// Runtime named `name`, launched with the first of `commands` found on `PATH`.
    pub fn new<I, S>(name: impl Into<String>, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let config = RuntimeConfig::default();
        Self {
            name: name.into(),
            commands: commands.into_iter().map(Into::into).collect(),
            runner: None,
            limiter: ConnectionLimiter::new(config.max_connections),
            config,
            spawner: Arc::new(RealProcessSpawner),
            resolved: OnceLock::new(),
        }
    }

    /// Use `path` instead of the bundled runner script.
    pub fn with_runner(mut self, path: impl Into<PathBuf>) -> Self {
        self.runner = Some(path.into());
        self
    }

    /// Replace the configuration; also resizes the connection pool.
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.limiter = ConnectionLimiter::new(config.max_connections);
        self.config = config;
        self
    }

    /// Launch subordinates through `spawner` instead of real processes.
    pub fn with_spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Human-readable runtime name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn limiter(&self) -> &ConnectionLimiter {
        &self.limiter
    }

    /// True if one of the command candidates is on `PATH`.
    pub fn is_available(&self) -> bool {
        self.binary().is_some()
    }

    fn binary(&self) -> Option<&(PathBuf, Vec<String>)> {
        self.resolved
            .get_or_init(|| {
                let found = command::which(&self.commands);
                match &found {
                    Some((program, _)) => debug!("{}: using {}", self.name, program.display()),
                    None => debug!("{}: none of {:?} found", self.name, self.commands),
                }
                found
            })
            .as_ref()
    }

    /// The command a handle would be spawned with.
    pub fn launch_command(&self) -> Result<LaunchCommand> {
        let (program, args) = self
            .binary()
            .ok_or_else(|| Error::CommandNotFound(self.commands.clone()))?;
        let script = match &self.runner {
            Some(path) => path.clone(),
            None => install_runner(&self.config.socket_dir)?,
        };
        Ok(LaunchCommand::new(program.clone(), script).with_args(args.iter().cloned()))
    }

    /// Start a subordinate preloaded with `initial_source`.
    pub async fn create_handle(&self, initial_source: &str) -> Result<RuntimeHandle> {
        let supervisor = Supervisor::new(
            Arc::clone(&self.spawner),
            self.launch_command()?,
            self.config.clone(),
            self.limiter.clone(),
        );
        RuntimeHandle::with_supervisor(supervisor, initial_source).await
    }

    /// Start a context whose global scope is seeded with `source`.
    pub async fn compile(&self, source: &str) -> Result<Context> {
        Ok(Context::new(self.create_handle(source).await?))
    }
}

/// Write the bundled runner into `dir`, reusing an identical existing copy.
pub fn install_runner(dir: &Path) -> Result<PathBuf> {
    let path = dir.join(format!("pcruntime-runner-{}.js", env!("CARGO_PKG_VERSION")));
    match std::fs::read_to_string(&path) {
        Ok(existing) if existing == RUNNER_SOURCE => return Ok(path),
        _ => {}
    }

    // Write under a unique name first so concurrent installers never see a partial file.
    let staging = dir.join(format!(
        "pcruntime-runner-{}.js.tmp",
        uuid::Uuid::new_v4().simple()
    ));
    std::fs::write(&staging, RUNNER_SOURCE)?;
    std::fs::rename(&staging, &path)?;
    info!("Installed runner script at {}", path.display());
    Ok(path)
}
