//! Tunables for process supervision, the channel and recovery.

use std::path::PathBuf;
use std::time::Duration;

/// Default size of the connection pool.
///
/// Kept well below common open-file-descriptor ceilings (256 on macOS, 1024 on
/// most Linux distributions).
pub const DEFAULT_MAX_CONNECTIONS: usize = 128;

/// Environment variable carrying the rendezvous socket path to the subordinate.
pub const SOCKET_ENV: &str = "PORT";

/// Runtime configuration shared by a [`crate::Runtime`] and its handles.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Capacity of the connection pool.
    pub max_connections: usize,
    /// How many times to check for the socket file after spawning.
    pub ready_poll_attempts: u32,
    /// Delay between readiness checks.
    pub ready_poll_interval: Duration,
    /// Spawn attempts (each with a fresh socket path) before giving up.
    pub spawn_attempts: u32,
    /// Upper bound on a single request/response exchange.
    pub request_timeout: Duration,
    /// Upper bound on the liveness probe sent after the socket appears.
    pub probe_timeout: Duration,
    /// How long to wait for a killed child to be reaped.
    pub kill_timeout: Duration,
    /// Respawns a single `evaluate` call may perform before failing.
    pub max_recoveries: u32,
    /// Base delay after a failed recovery; doubles on each further failure.
    pub recovery_backoff: Duration,
    /// Directory in which rendezvous sockets are created.
    pub socket_dir: PathBuf,
    /// Environment variable used to pass the socket path.
    pub socket_env: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            ready_poll_attempts: 20,
            ready_poll_interval: Duration::from_millis(50),
            spawn_attempts: 3,
            request_timeout: Duration::from_secs(600),
            probe_timeout: Duration::from_secs(5),
            kill_timeout: Duration::from_secs(5),
            max_recoveries: 3,
            recovery_backoff: Duration::from_millis(100),
            socket_dir: std::env::temp_dir(),
            socket_env: SOCKET_ENV.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Backoff to apply after the `n`th failed recovery (1-based).
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(16);
        self.recovery_backoff.saturating_mul(1 << shift)
    }

    /// Total time the supervisor waits for a socket file to appear.
    pub fn ready_window(&self) -> Duration {
        self.ready_poll_interval
            .saturating_mul(self.ready_poll_attempts)
    }
}
