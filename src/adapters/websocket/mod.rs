// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

mod channel;

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::Instrument;
use url::Url;

use crate::app::errors::{ConnectError, ConnectErrorKind};
use crate::app::ports::{ExecConnector, ExecSession, SessionReader, SessionWriter};
use crate::app::types::{ExecRequest, RemoteExit, DEFAULT_CHUNK_SIZE};

pub const V5_PROTOCOL: &str = "v5.channel.k8s.io";
pub const V4_PROTOCOL: &str = "v4.channel.k8s.io";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// API server base URL, `https://host:6443` or `http://127.0.0.1:8001`.
    pub server: Url,
    pub token: Option<String>,
    pub connect_timeout: Duration,
    /// Capacity of the local pipes and size of stdin frames.
    pub buffer_size: usize,
}

impl WebSocketConfig {
    pub fn new(server: Url) -> Self {
        Self {
            server,
            token: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            buffer_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Talks to the pod exec endpoint of the API server over a WebSocket using
/// the channel protocol.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    config: WebSocketConfig,
}

impl WebSocketConnector {
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }
}

/// `{server}/api/v1/namespaces/{ns}/pods/{pod}/exec?...` with one `command`
/// parameter per argument.
pub fn exec_url(server: &Url, request: &ExecRequest) -> Result<Url, ConnectError> {
    let mut url = server.clone();
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(ConnectError::protocol(format!(
                "unsupported server scheme {other:?}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ConnectError::protocol(format!("cannot use {scheme} for {server}")))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| ConnectError::protocol(format!("{server} cannot be a base URL")))?;
        segments.pop_if_empty().extend([
            "api",
            "v1",
            "namespaces",
            request.target.namespace.as_str(),
            "pods",
            request.target.pod.as_str(),
            "exec",
        ]);
    }
    {
        let mut query = url.query_pairs_mut();
        query.clear();
        for arg in request.command.args() {
            query.append_pair("command", arg);
        }
        if let Some(container) = &request.target.container {
            query.append_pair("container", container);
        }
        let flags = request.flags;
        query.append_pair("stdin", bool_param(flags.stdin));
        query.append_pair("stdout", bool_param(flags.stdout));
        query.append_pair("stderr", bool_param(flags.stderr));
        query.append_pair("tty", bool_param(flags.tty));
    }
    Ok(url)
}

fn bool_param(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

fn handshake_error(err: tungstenite::Error) -> ConnectError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            let kind = match status.as_u16() {
                401 | 403 => ConnectErrorKind::Authentication,
                404 => ConnectErrorKind::NotFound,
                _ => ConnectErrorKind::Protocol,
            };
            let body = response
                .body()
                .as_deref()
                .map(String::from_utf8_lossy)
                .map(|body| body.trim().to_string())
                .filter(|body| !body.is_empty());
            let message = match body {
                Some(body) => format!("exec upgrade rejected with HTTP {status}: {body}"),
                None => format!("exec upgrade rejected with HTTP {status}"),
            };
            ConnectError::new(kind, message)
        }
        tungstenite::Error::Io(err) => {
            ConnectError::network("failed to reach the API server").with_source(err)
        }
        err @ (tungstenite::Error::Tls(_) | tungstenite::Error::Url(_)) => {
            ConnectError::network("failed to reach the API server").with_source(err)
        }
        other => ConnectError::protocol("exec websocket handshake failed").with_source(other),
    }
}

#[async_trait]
impl ExecConnector for WebSocketConnector {
    #[tracing::instrument(
        name = "websocket",
        level = "debug",
        skip(self, request),
        fields(op = "open", pod = %request.target)
    )]
    async fn open(&self, request: &ExecRequest) -> Result<Box<dyn ExecSession>, ConnectError> {
        if request.flags.tty {
            return Err(ConnectError::protocol("copy sessions never allocate a tty"));
        }
        let url = exec_url(&self.config.server, request)?;
        let mut http = url
            .as_str()
            .into_client_request()
            .map_err(|err| ConnectError::protocol("invalid exec URL").with_source(err))?;
        http.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("v5.channel.k8s.io, v4.channel.k8s.io"),
        );
        if let Some(token) = &self.config.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|err| {
                ConnectError::new(ConnectErrorKind::Authentication, "token is not a valid header")
                    .with_source(err)
            })?;
            http.headers_mut().insert(AUTHORIZATION, value);
        }

        let connect = tokio_tungstenite::connect_async(http);
        let (ws, response) = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| {
                ConnectError::network(format!(
                    "timed out after {}s connecting to the API server",
                    self.config.connect_timeout.as_secs()
                ))
            })?
            .map_err(handshake_error)?;

        let protocol = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        tracing::debug!(protocol, "exec websocket established");
        if request.flags.stdin && protocol != V5_PROTOCOL {
            return Err(ConnectError::protocol(format!(
                "server negotiated {protocol:?}; closing stdin requires {V5_PROTOCOL}"
            )));
        }

        let capacity = self.config.buffer_size.max(1);
        let (stdin, remote_stdin) = pipe_if(request.flags.stdin, capacity);
        let (stdout, remote_stdout) = pipe_if(request.flags.stdout, capacity);
        let (stderr, remote_stderr) = pipe_if(request.flags.stderr, capacity);
        let (status_tx, status_rx) = oneshot::channel();
        let pipes = channel::Pipes {
            stdin: remote_stdin,
            stdout: remote_stdout,
            stderr: remote_stderr,
            status: status_tx,
        };
        let task = tokio::spawn(
            channel::run(ws, pipes, capacity).instrument(tracing::Span::current()),
        );

        Ok(Box::new(WebSocketSession {
            stdin: stdin.map(|pipe| Box::pin(pipe) as SessionWriter),
            stdout: stdout.map(|pipe| Box::pin(pipe) as SessionReader),
            stderr: stderr.map(|pipe| Box::pin(pipe) as SessionReader),
            status: status_rx,
            task,
            closed: false,
        }))
    }
}

fn pipe_if(
    attached: bool,
    capacity: usize,
) -> (Option<tokio::io::DuplexStream>, Option<tokio::io::DuplexStream>) {
    if !attached {
        return (None, None);
    }
    let (local, remote) = tokio::io::duplex(capacity);
    (Some(local), Some(remote))
}

struct WebSocketSession {
    stdin: Option<SessionWriter>,
    stdout: Option<SessionReader>,
    stderr: Option<SessionReader>,
    status: oneshot::Receiver<RemoteExit>,
    task: JoinHandle<()>,
    closed: bool,
}

#[async_trait]
impl ExecSession for WebSocketSession {
    fn take_stdin(&mut self) -> Option<SessionWriter> {
        self.stdin.take()
    }

    fn take_stdout(&mut self) -> Option<SessionReader> {
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<SessionReader> {
        self.stderr.take()
    }

    async fn wait(&mut self) -> io::Result<RemoteExit> {
        (&mut self.status).await.map_err(|_| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "exec websocket closed without a status frame",
            )
        })
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.task.abort();
    }
}

impl Drop for WebSocketSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::types::{RemoteCommand, StreamFlags, Target};

    fn query(url: &Url) -> Vec<(String, String)> {
        url.query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[test]
    fn upload_url_repeats_command_parameter() {
        let server = Url::parse("https://cluster.example:6443").unwrap();
        let request = ExecRequest::new(
            Target::new("default", "apod").with_container("main"),
            RemoteCommand::extract_into("/"),
            StreamFlags::UPLOAD,
        );
        let url = exec_url(&server, &request).unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/api/v1/namespaces/default/pods/apod/exec");
        let pairs = query(&url);
        let commands: Vec<&str> = pairs
            .iter()
            .filter(|(k, _)| k == "command")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(commands, ["sh", "-c", "base64 -d | tar -xmf - -C /"]);
        for (key, value) in [
            ("container", "main"),
            ("stdin", "true"),
            ("stdout", "true"),
            ("stderr", "true"),
            ("tty", "false"),
        ] {
            assert!(
                pairs.contains(&(key.to_string(), value.to_string())),
                "missing {key}={value}"
            );
        }
    }

    #[test]
    fn download_url_has_no_stdin_and_keeps_base_path() {
        let server = Url::parse("http://127.0.0.1:8001/proxy/").unwrap();
        let request = ExecRequest::new(
            Target::new("ns", "p"),
            RemoteCommand::archive_to_stdout("/var/log/app.log").unwrap(),
            StreamFlags::DOWNLOAD,
        );
        let url = exec_url(&server, &request).unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/proxy/api/v1/namespaces/ns/pods/p/exec");
        let pairs = query(&url);
        assert!(pairs.contains(&("stdin".to_string(), "false".to_string())));
        assert!(!pairs.iter().any(|(k, _)| k == "container"));
    }

    #[test]
    fn rejects_unknown_scheme() {
        let server = Url::parse("ftp://example").unwrap();
        let request = ExecRequest::new(
            Target::new("ns", "p"),
            RemoteCommand::new(["true"]),
            StreamFlags::DOWNLOAD,
        );
        assert!(exec_url(&server, &request).is_err());
    }

    #[tokio::test]
    async fn refused_connection_is_a_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let server = Url::parse(&format!("http://127.0.0.1:{port}")).unwrap();
        let connector = WebSocketConnector::new(WebSocketConfig::new(server));
        let request = ExecRequest::new(
            Target::new("ns", "p"),
            RemoteCommand::new(["true"]),
            StreamFlags::DOWNLOAD,
        );
        let err = connector.open(&request).await.err().expect("refused");
        assert_eq!(err.kind(), ConnectErrorKind::Network);
    }
}
