//! Process spawning abstraction for testability.
//!
//! The supervisor launches subordinates through [`ProcessSpawner`], so tests
//! can substitute an in-process fake without a JavaScript runtime installed.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};

/// How to start a subordinate: program, leading arguments, runner script.
///
/// Spawned as `<program> <args..> <script>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub script: PathBuf,
}

impl LaunchCommand {
    pub fn new(program: impl Into<PathBuf>, script: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            script: script.into(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        write!(f, " {}", self.script.display())
    }
}

/// Trait for spawning subordinate processes.
pub trait ProcessSpawner: Send + Sync {
    /// Starts `launch` with the rendezvous `socket` exported as `socket_env`.
    ///
    /// Must return as soon as the process is started; readiness is the
    /// supervisor's concern.
    fn spawn_runtime(
        &self,
        launch: &LaunchCommand,
        socket: &Path,
        socket_env: &str,
    ) -> io::Result<Child>;
}

/// Spawns real processes with `tokio::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealProcessSpawner;

impl ProcessSpawner for RealProcessSpawner {
    fn spawn_runtime(
        &self,
        launch: &LaunchCommand,
        socket: &Path,
        socket_env: &str,
    ) -> io::Result<Child> {
        Command::new(&launch.program)
            .args(&launch.args)
            .arg(&launch.script)
            .env(socket_env, socket)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
    }
}

pub mod mock {
    //! Fake subordinate for tests.
    //!
    //! Each spawn binds the requested socket and serves the runner protocol
    //! from an in-process hyper server with its own global scope, backed by a
    //! `sleep` child so the supervisor has a real process to kill. The script
    //! language understood by the fake is tiny:
    //!
    //! - `var name = <json>` assigns a global
    //! - `++name` increments a numeric global and yields it
    //! - `name` yields a global
    //! - `throw new Error('msg')` fails like a thrown error
    //! - any JSON literal yields itself, optionally wrapped in parentheses
    //! - statements separated by `;`, the last one gives the result
    //!
    //! Anything else is reported as a `SyntaxError`. The exact source
    //! [`MALFORMED_SOURCE`] is answered with 200 and a body that is not JSON.

    use super::*;
    use std::collections::HashMap;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use hyper::body::Incoming;
    use hyper::service::service_fn;
    use hyper::{Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use serde_json::Value;
    use tokio::net::UnixListener;
    use tokio::task::JoinHandle;
    use tracing::debug;

    use crate::encoding;

    /// Source the fake answers with a successful but undecodable reply.
    pub const MALFORMED_SOURCE: &str = "@malformed";

    /// What the next spawned fake does.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum FakeBehavior {
        /// Listen and answer requests.
        Serve,
        /// Start but never create the socket.
        NeverListens,
        /// Create the socket but drop every connection unanswered.
        RejectsRequests,
        /// Fail to launch at all.
        LaunchFails,
        /// Start a child that exits straight away without listening.
        ExitsImmediately,
    }

    /// Spawner producing in-process fake subordinates.
    ///
    /// Clones share counters and servers.
    #[derive(Clone)]
    pub struct FakeRuntimeSpawner {
        state: Arc<FakeState>,
    }

    struct FakeState {
        spawns: AtomicUsize,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
        evaluations: AtomicUsize,
        eval_delay: Mutex<Duration>,
        behavior: Mutex<FakeBehavior>,
        servers: Mutex<Vec<FakeServer>>,
    }

    struct FakeServer {
        socket: PathBuf,
        task: Option<JoinHandle<()>>,
    }

    impl Default for FakeRuntimeSpawner {
        fn default() -> Self {
            Self::new(FakeBehavior::Serve)
        }
    }

    impl FakeRuntimeSpawner {
        pub fn new(behavior: FakeBehavior) -> Self {
            Self {
                state: Arc::new(FakeState {
                    spawns: AtomicUsize::new(0),
                    in_flight: AtomicUsize::new(0),
                    peak_in_flight: AtomicUsize::new(0),
                    evaluations: AtomicUsize::new(0),
                    eval_delay: Mutex::new(Duration::ZERO),
                    behavior: Mutex::new(behavior),
                    servers: Mutex::new(Vec::new()),
                }),
            }
        }

        /// Changes the behavior of subsequent spawns.
        pub fn set_behavior(&self, behavior: FakeBehavior) {
            *self
                .state
                .behavior
                .lock()
                .expect("FakeRuntimeSpawner behavior mutex poisoned") = behavior;
        }

        /// Makes every `/eval` sleep before answering.
        pub fn set_eval_delay(&self, delay: Duration) {
            *self
                .state
                .eval_delay
                .lock()
                .expect("FakeRuntimeSpawner delay mutex poisoned") = delay;
        }

        /// Number of spawn attempts so far, failed ones included.
        pub fn spawn_count(&self) -> usize {
            self.state.spawns.load(Ordering::SeqCst)
        }

        /// Highest number of `/eval` requests served at the same time.
        pub fn peak_in_flight(&self) -> usize {
            self.state.peak_in_flight.load(Ordering::SeqCst)
        }

        /// Number of `/eval` requests received across all fakes.
        pub fn evaluation_count(&self) -> usize {
            self.state.evaluations.load(Ordering::SeqCst)
        }

        /// Socket paths handed to each spawn, in order.
        pub fn sockets(&self) -> Vec<PathBuf> {
            self.servers()
                .iter()
                .map(|server| server.socket.clone())
                .collect()
        }

        /// Kills the most recently spawned fake: stops its server and removes its socket.
        pub fn crash_latest(&self) {
            let mut servers = self.servers();
            if let Some(server) = servers.last_mut() {
                server.stop();
            }
        }

        fn servers(&self) -> std::sync::MutexGuard<'_, Vec<FakeServer>> {
            self.state
                .servers
                .lock()
                .expect("FakeRuntimeSpawner servers mutex poisoned")
        }

        fn behavior(&self) -> FakeBehavior {
            self.state
                .behavior
                .lock()
                .expect("FakeRuntimeSpawner behavior mutex poisoned")
                .clone()
        }
    }

    impl ProcessSpawner for FakeRuntimeSpawner {
        fn spawn_runtime(
            &self,
            _launch: &LaunchCommand,
            socket: &Path,
            _socket_env: &str,
        ) -> io::Result<Child> {
            self.state.spawns.fetch_add(1, Ordering::SeqCst);

            let behavior = self.behavior();
            let task = match behavior {
                FakeBehavior::LaunchFails => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        "fake runtime launch failure",
                    ))
                }
                FakeBehavior::NeverListens | FakeBehavior::ExitsImmediately => None,
                FakeBehavior::Serve => Some(tokio::spawn(serve(
                    bind(socket)?,
                    Arc::clone(&self.state),
                ))),
                FakeBehavior::RejectsRequests => Some(tokio::spawn(reject(bind(socket)?))),
            };

            self.servers().push(FakeServer {
                socket: socket.to_path_buf(),
                task,
            });

            if behavior == FakeBehavior::ExitsImmediately {
                return Command::new("false").kill_on_drop(true).spawn();
            }

            // A real pid for the supervisor to kill.
            Command::new("sleep")
                .arg("3600")
                .kill_on_drop(true)
                .spawn()
        }
    }

    impl Drop for FakeState {
        fn drop(&mut self) {
            if let Ok(servers) = self.servers.get_mut() {
                for server in servers.iter_mut() {
                    server.stop();
                }
            }
        }
    }

    impl FakeServer {
        fn stop(&mut self) {
            if let Some(task) = self.task.take() {
                task.abort();
            }
            if self.socket.exists() {
                let _ = std::fs::remove_file(&self.socket);
            }
        }
    }

    fn bind(socket: &Path) -> io::Result<UnixListener> {
        let listener = std::os::unix::net::UnixListener::bind(socket)?;
        listener.set_nonblocking(true)?;
        UnixListener::from_std(listener)
    }

    async fn reject(listener: UnixListener) {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    }

    async fn serve(listener: UnixListener, state: Arc<FakeState>) {
        let scope = Arc::new(Mutex::new(HashMap::new()));
        while let Ok((stream, _)) = listener.accept().await {
            let state = Arc::clone(&state);
            let scope = Arc::clone(&scope);
            tokio::spawn(async move {
                let service = service_fn(move |request| {
                    handle(request, Arc::clone(&state), Arc::clone(&scope))
                });
                if let Err(err) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!("Fake runtime connection error: {err}");
                }
            });
        }
    }

    type Scope = Arc<Mutex<HashMap<String, Value>>>;

    async fn handle(
        request: hyper::Request<Incoming>,
        state: Arc<FakeState>,
        scope: Scope,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let path = request.uri().path().to_string();
        let body = match request.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => return Ok(respond(StatusCode::BAD_REQUEST, String::new())),
        };

        match path.as_str() {
            "/" => Ok(respond(StatusCode::OK, String::new())),
            "/eval" => {
                let _flight = InFlight::enter(&state);
                state.evaluations.fetch_add(1, Ordering::SeqCst);

                let delay = *state
                    .eval_delay
                    .lock()
                    .expect("FakeRuntimeSpawner delay mutex poisoned");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                let source = match encoding::decode(&body) {
                    Ok(source) => source,
                    Err(err) => return Ok(respond(StatusCode::BAD_REQUEST, err)),
                };
                if source == MALFORMED_SOURCE {
                    return Ok(respond(StatusCode::OK, encoding::encode("{not json")));
                }
                let outcome = {
                    let mut globals = scope.lock().expect("fake runtime scope mutex poisoned");
                    evaluate(&mut globals, &source)
                };
                Ok(match outcome {
                    Ok(None) => respond(StatusCode::OK, String::new()),
                    Ok(Some(value)) => respond(StatusCode::OK, encoding::encode(&value.to_string())),
                    Err(failure) => respond(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        encoding::encode(&failure),
                    ),
                })
            }
            _ => Ok(respond(StatusCode::NOT_FOUND, String::new())),
        }
    }

    fn respond(status: StatusCode, body: String) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        response
    }

    struct InFlight<'a> {
        state: &'a FakeState,
    }

    impl<'a> InFlight<'a> {
        fn enter(state: &'a FakeState) -> Self {
            let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            state.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            Self { state }
        }
    }

    impl Drop for InFlight<'_> {
        fn drop(&mut self) {
            self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Runs `source` against `globals`; errors are `message\0stack` bodies.
    fn evaluate(globals: &mut HashMap<String, Value>, source: &str) -> Result<Option<Value>, String> {
        let mut result = None;
        for statement in source.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            result = statement_value(globals, statement)?;
        }
        Ok(result)
    }

    fn statement_value(
        globals: &mut HashMap<String, Value>,
        statement: &str,
    ) -> Result<Option<Value>, String> {
        let statement = strip_parens(statement);

        if let Some(message) = statement
            .strip_prefix("throw new Error(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            let message = format!("Error: {}", message.trim_matches(|c| c == '\'' || c == '"'));
            return Err(format!("{message}\0{message}\n    at (pcruntime):1:7"));
        }

        if let Some(assignment) = statement.strip_prefix("var ") {
            let (name, literal) = assignment.split_once('=').ok_or_else(syntax_error)?;
            let value = serde_json::from_str(literal.trim()).map_err(|_| syntax_error())?;
            globals.insert(name.trim().to_string(), value);
            return Ok(None);
        }

        if let Some(name) = statement.strip_prefix("++") {
            let slot = globals
                .get_mut(name.trim())
                .ok_or_else(|| reference_error(name.trim()))?;
            let next = slot.as_i64().unwrap_or(0) + 1;
            *slot = Value::from(next);
            return Ok(Some(slot.clone()));
        }

        if let Some(value) = globals.get(statement) {
            return Ok(Some(value.clone()));
        }

        serde_json::from_str(statement)
            .map(Some)
            .map_err(|_| syntax_error())
    }

    fn strip_parens(mut statement: &str) -> &str {
        while let Some(inner) = statement
            .strip_prefix('(')
            .and_then(|rest| rest.strip_suffix(')'))
        {
            statement = inner.trim();
        }
        statement
    }

    fn syntax_error() -> String {
        "SyntaxError: Unexpected token\0SyntaxError: Unexpected token\n    at (pcruntime):1:1"
            .to_string()
    }

    fn reference_error(name: &str) -> String {
        format!("ReferenceError: {name} is not defined\0ReferenceError: {name} is not defined")
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_fake_language() {
            let mut globals = HashMap::new();
            assert_eq!(evaluate(&mut globals, "var counter = 0;"), Ok(None));
            assert_eq!(evaluate(&mut globals, "++counter"), Ok(Some(Value::from(1))));
            assert_eq!(evaluate(&mut globals, "(counter)"), Ok(Some(Value::from(1))));
            assert_eq!(
                evaluate(&mut globals, "([1, {\"a\": null}])"),
                Ok(Some(serde_json::json!([1, {"a": null}])))
            );
            assert_eq!(evaluate(&mut globals, "   "), Ok(None));
        }

        #[test]
        fn test_fake_failures() {
            let mut globals = HashMap::new();
            let thrown = evaluate(&mut globals, "throw new Error('boom')").unwrap_err();
            assert!(thrown.starts_with("Error: boom\0"));

            let syntax = evaluate(&mut globals, "(").unwrap_err();
            assert!(syntax.starts_with("SyntaxError:"));
        }
    }
}
