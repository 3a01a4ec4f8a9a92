//! One-shot HTTP/1.1 exchanges with a subordinate over its Unix socket.
//!
//! Every call opens a fresh connection, sends a single request marked
//! `Connection: close`, reads the whole response and lets the connection
//! drop. A dead subordinate therefore shows up as a connect or exchange
//! failure on the next call.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONNECTION, CONTENT_TYPE, HOST};
use hyper::{Method, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use thiserror::Error;
use tokio::net::UnixStream;
use tracing::debug;

use crate::encoding;
use crate::error::{Error, ScriptFailure};
use crate::limiter::ConnectionLimiter;

pub const PROBE_PATH: &str = "/";
pub const EVAL_PATH: &str = "/eval";

const SCRIPT_CONTENT_TYPE: &str = "text/javascript";

/// Connection-level failure: the subordinate is presumed dead.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {}: {source}", .socket.display())]
    Connect {
        socket: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("HTTP handshake failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("request exchange failed: {0}")]
    Exchange(#[source] hyper::Error),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("could not build request: {0}")]
    Request(String),
}

/// A request to the subordinate.
#[derive(Debug, Clone)]
pub struct Request {
    pub path: &'static str,
    pub content_type: Option<&'static str>,
    pub body: Option<String>,
}

impl Request {
    /// Empty liveness probe.
    pub fn probe() -> Self {
        Self {
            path: PROBE_PATH,
            content_type: None,
            body: None,
        }
    }

    /// Evaluate `source` in the subordinate's context.
    pub fn eval(source: &str) -> Self {
        Self {
            path: EVAL_PATH,
            content_type: Some(SCRIPT_CONTENT_TYPE),
            body: Some(encoding::encode(source)),
        }
    }
}

/// Raw response, body still percent-encoded.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: StatusCode,
    pub body: Bytes,
}

impl Reply {
    /// Decode an `/eval` reply into a value, no value, or a script error.
    pub fn into_value(self) -> crate::Result<Option<Value>> {
        let text = encoding::decode(&self.body).map_err(Error::Protocol)?;
        if self.status != StatusCode::OK {
            return Err(ScriptFailure::parse(&text).classify());
        }

        if text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|err| Error::Protocol(format!("result is not JSON: {err}")))
    }
}

/// Send one request, holding a connection permit for the whole exchange.
///
/// The permit wait is not counted against `timeout`.
pub async fn send(
    socket: &Path,
    request: Request,
    limiter: &ConnectionLimiter,
    timeout: Duration,
) -> Result<Reply, TransportError> {
    let _permit = limiter.acquire().await;
    tokio::time::timeout(timeout, exchange(socket, request))
        .await
        .map_err(|_| TransportError::Timeout(timeout))?
}

async fn exchange(socket: &Path, request: Request) -> Result<Reply, TransportError> {
    let stream = UnixStream::connect(socket)
        .await
        .map_err(|source| TransportError::Connect {
            socket: socket.to_path_buf(),
            source,
        })?;

    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(TransportError::Handshake)?;

    let mut builder = hyper::Request::builder()
        .method(Method::POST)
        .uri(request.path)
        .header(HOST, "localhost")
        .header(CONNECTION, "close");
    if let Some(content_type) = request.content_type {
        builder = builder.header(CONTENT_TYPE, content_type);
    }
    let http_request = builder
        .body(Full::new(Bytes::from(request.body.unwrap_or_default())))
        .map_err(|err| TransportError::Request(err.to_string()))?;

    let round_trip = async move {
        let response = sender
            .send_request(http_request)
            .await
            .map_err(TransportError::Exchange)?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(TransportError::Exchange)?
            .to_bytes();
        Ok(Reply { status, body })
    };

    // The connection future resolves once the response is read, since the
    // request disables keep-alive.
    let (reply, driven) = tokio::join!(round_trip, connection);
    if let Err(err) = driven {
        debug!("Connection to {} ended with error: {err}", socket.display());
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    /// Accepts one connection, records the raw request, and answers with `response`.
    fn canned_server(socket: &Path, response: &'static str) -> tokio::task::JoinHandle<String> {
        let listener = UnixListener::bind(socket).expect("test socket should bind");
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept should succeed");
            let mut raw = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).await.expect("read should succeed");
                raw.extend_from_slice(&buf[..n]);
                if n == 0 || request_complete(&raw) {
                    break;
                }
            }
            stream
                .write_all(response.as_bytes())
                .await
                .expect("write should succeed");
            stream.shutdown().await.ok();
            String::from_utf8(raw).expect("request should be UTF-8")
        })
    }

    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some((head, body)) = text.split_once("\r\n\r\n") else {
            return false;
        };
        let length = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        body.len() >= length
    }

    #[tokio::test]
    async fn test_eval_request_wire_format() {
        let dir = TempDir::new().expect("TempDir should create test directory");
        let socket = dir.path().join("wire.sock");
        let server = canned_server(
            &socket,
            "HTTP/1.1 200 OK\r\nContent-Length: 1\r\nConnection: close\r\n\r\n2",
        );

        let reply = send(
            &socket,
            Request::eval("1 + 1"),
            &ConnectionLimiter::new(1),
            Duration::from_secs(5),
        )
        .await
        .expect("exchange should succeed");

        let raw = server.await.expect("server task should finish");
        assert!(raw.starts_with("POST /eval HTTP/1.1\r\n"), "request line: {raw}");
        let lower = raw.to_ascii_lowercase();
        assert!(lower.contains("content-type: text/javascript\r\n"));
        assert!(lower.contains("connection: close\r\n"));
        assert!(raw.ends_with("\r\n\r\n1%20%2B%201"), "body: {raw}");

        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.into_value().expect("value"), Some(serde_json::json!(2)));
    }

    #[tokio::test]
    async fn test_probe_has_no_body() {
        let dir = TempDir::new().expect("TempDir should create test directory");
        let socket = dir.path().join("probe.sock");
        let server = canned_server(&socket, "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");

        let reply = send(
            &socket,
            Request::probe(),
            &ConnectionLimiter::new(1),
            Duration::from_secs(5),
        )
        .await
        .expect("probe should succeed");

        let raw = server.await.expect("server task should finish");
        assert!(raw.starts_with("POST / HTTP/1.1\r\n"));
        assert!(!raw.to_ascii_lowercase().contains("content-type"));
        assert!(raw.ends_with("\r\n\r\n"));
        assert_eq!(reply.status, StatusCode::OK);
        assert!(reply.body.is_empty());
    }

    #[tokio::test]
    async fn test_missing_socket_is_transport_failure() {
        let dir = TempDir::new().expect("TempDir should create test directory");
        let limiter = ConnectionLimiter::new(1);
        let result = send(
            &dir.path().join("absent.sock"),
            Request::probe(),
            &limiter,
            Duration::from_secs(1),
        )
        .await;

        assert!(matches!(result, Err(TransportError::Connect { .. })));
        assert_eq!(limiter.in_use(), 0, "permit must be released on failure");
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let dir = TempDir::new().expect("TempDir should create test directory");
        let socket = dir.path().join("silent.sock");
        let listener = UnixListener::bind(&socket).expect("test socket should bind");
        let _hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept should succeed");
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let limiter = ConnectionLimiter::new(1);
        let result = send(
            &socket,
            Request::eval("1"),
            &limiter,
            Duration::from_millis(100),
        )
        .await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
        assert_eq!(limiter.in_use(), 0, "permit must be released on timeout");
    }

    #[test]
    fn test_reply_decoding() {
        let empty = Reply {
            status: StatusCode::OK,
            body: Bytes::new(),
        };
        assert_eq!(empty.into_value().expect("empty body is no value"), None);

        let failure = Reply {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: Bytes::from_static(b"SyntaxError%3A%20Unexpected%20end%20of%20input%00stack"),
        };
        assert!(matches!(
            failure.into_value(),
            Err(Error::ScriptSyntax { message }) if message == "SyntaxError: Unexpected end of input"
        ));

        let garbage = Reply {
            status: StatusCode::OK,
            body: Bytes::from_static(b"%7Bnot%20json"),
        };
        assert!(matches!(garbage.into_value(), Err(Error::Protocol(_))));
    }
}
