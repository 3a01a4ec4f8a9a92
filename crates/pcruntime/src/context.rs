//! Expression, statement and function-call wrappers over a handle.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::handle::RuntimeHandle;

/// A compiled context: a handle whose global scope holds the compiled source.
pub struct Context {
    handle: RuntimeHandle,
}

impl Context {
    /// Wrap a handle already seeded with the compiled source.
    pub fn new(handle: RuntimeHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &RuntimeHandle {
        &self.handle
    }

    /// Evaluate an expression. Blank input yields no value without a round trip.
    pub async fn eval(&self, source: &str) -> Result<Option<Value>> {
        if source.trim().is_empty() {
            return Ok(None);
        }
        self.handle.evaluate(&format!("({source})")).await
    }

    /// Execute a statement block; its `return` value is the result.
    pub async fn exec(&self, source: &str) -> Result<Option<Value>> {
        self.handle.evaluate(&format!("(()=>{{{source}}})()")).await
    }

    /// Call the function named by `identifier` with JSON arguments.
    pub async fn call(&self, identifier: &str, args: &[Value]) -> Result<Option<Value>> {
        let args = serde_json::to_string(args).map_err(|err| Error::Protocol(err.to_string()))?;
        self.handle
            .evaluate(&format!("({identifier}).apply(this, {args})"))
            .await
    }

    /// Kill the subordinate; see [`RuntimeHandle::release`].
    pub async fn release(&self) {
        self.handle.release().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::limiter::ConnectionLimiter;
    use crate::spawner::mock::FakeRuntimeSpawner;
    use crate::spawner::LaunchCommand;
    use crate::supervisor::Supervisor;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_blank_eval_skips_the_subordinate() {
        let dir = TempDir::new().expect("TempDir should create test directory");
        let spawner = FakeRuntimeSpawner::default();
        let config = RuntimeConfig {
            socket_dir: dir.path().to_path_buf(),
            ..RuntimeConfig::default()
        };
        let supervisor = Supervisor::new(
            Arc::new(spawner.clone()),
            LaunchCommand::new("node", "runner.js"),
            config,
            ConnectionLimiter::new(2),
        );
        let context = Context::new(
            RuntimeHandle::with_supervisor(supervisor, "var answer = 42")
                .await
                .expect("handle should start"),
        );

        assert_eq!(context.eval(" \n\t").await.expect("blank eval"), None);
        assert_eq!(spawner.evaluation_count(), 1, "only the preload reached the fake");

        assert_eq!(context.eval("answer").await.expect("eval"), Some(Value::from(42)));
        context.release().await;
    }
}
