//! pcruntime: JavaScript evaluation in a supervised subordinate process.
//!
//! A [`RuntimeHandle`] owns one Node.js process running the bundled
//! `runner.js`. Requests travel as one-shot HTTP/1.1 exchanges over a Unix
//! socket whose path is handed to the process in `PORT`. When the process
//! stops answering, the handle kills it, spawns a replacement, replays the
//! initial source and retries the request.
//!
//! # Modules
//!
//! - [`supervisor`]: spawn, readiness polling, liveness probe, kill
//! - [`channel`]: request framing and the one-connection-per-call exchange
//! - [`limiter`]: bound on simultaneously open connections
//! - [`handle`]: the recovering facade
//! - [`error`]: caller-facing errors and script failure classification
//! - [`runtime`] / [`context`]: command lookup and expression wrappers

pub mod address;
pub mod channel;
pub mod command;
pub mod config;
pub mod context;
pub mod encoding;
pub mod error;
pub mod handle;
pub mod limiter;
pub mod runtime;
pub mod spawner;
pub mod supervisor;

pub use config::RuntimeConfig;
pub use context::Context;
pub use error::{Error, Result};
pub use handle::{Endpoint, RuntimeHandle};
pub use limiter::ConnectionLimiter;
pub use runtime::Runtime;
pub use spawner::{LaunchCommand, ProcessSpawner, RealProcessSpawner};
pub use supervisor::Supervisor;
