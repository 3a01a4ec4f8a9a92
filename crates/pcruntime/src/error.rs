//! Errors surfaced to callers, and classification of script failures.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by handles and runtimes.
///
/// Transport faults never appear here directly: they are absorbed by the
/// handle's respawn-and-retry path and only escalate as [`Error::SpawnTimeout`]
/// once the recovery budget is spent.
#[derive(Debug, Error)]
pub enum Error {
    #[error("runtime at {} did not become ready: {reason}", .socket.display())]
    SpawnTimeout { socket: PathBuf, reason: String },

    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{message}")]
    ScriptSyntax { message: String },

    #[error("{message}")]
    ScriptRuntime { message: String, stack: String },

    #[error("malformed response from runtime: {0}")]
    Protocol(String),

    #[error("runtime handle has been released")]
    Released,

    #[error("no executable found for any of {0:?}")]
    CommandNotFound(Vec<String>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for failures raised by the evaluated script itself.
    pub fn is_script_error(&self) -> bool {
        matches!(self, Error::ScriptSyntax { .. } | Error::ScriptRuntime { .. })
    }

    /// Stack trace reported by the subordinate, if any.
    pub fn stack(&self) -> Option<&str> {
        match self {
            Error::ScriptRuntime { stack, .. } => Some(stack),
            _ => None,
        }
    }
}

/// Marker the subordinate puts in front of parse errors.
const SYNTAX_ERROR_MARKER: &str = "SyntaxError:";

/// A failure body reported by the subordinate, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFailure {
    pub message: String,
    pub stack: String,
}

impl ScriptFailure {
    /// Split a decoded `message\0stack` failure body.
    pub fn parse(body: &str) -> Self {
        let (message, stack) = body.split_once('\0').unwrap_or((body, ""));
        Self {
            message: message.to_string(),
            stack: stack.to_string(),
        }
    }

    /// Map the failure onto the caller-facing error kind.
    pub fn classify(self) -> Error {
        if self.message.contains(SYNTAX_ERROR_MARKER) {
            Error::ScriptSyntax {
                message: self.message,
            }
        } else {
            Error::ScriptRuntime {
                message: self.message,
                stack: self.stack,
            }
        }
    }
}
