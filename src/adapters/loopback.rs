// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! In-process exec connector. The "remote process" is an async handler that
//! talks to the copier over in-memory duplex pipes, which makes it useful for
//! embedding the copier against something that is not a real pod, and for
//! exercising the supervisor without a cluster.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;

use crate::app::errors::{ConnectError, ConnectErrorKind};
use crate::app::ports::{ExecConnector, ExecSession, SessionReader, SessionWriter};
use crate::app::types::{ExecRequest, RemoteExit};

const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type Handler = Arc<dyn Fn(ExecRequest, RemoteEnd) -> BoxFuture<RemoteExit> + Send + Sync>;

/// The remote half of the pipes. `stdin` is read by the handler, `stdout` and
/// `stderr` are written by it. Dropping a half closes that stream.
pub struct RemoteEnd {
    pub stdin: Option<DuplexStream>,
    pub stdout: Option<DuplexStream>,
    pub stderr: Option<DuplexStream>,
}

#[derive(Clone)]
pub struct LoopbackConnector {
    handler: Option<Handler>,
    refusal: Option<String>,
    pipe_capacity: usize,
    requests: Arc<Mutex<Vec<ExecRequest>>>,
    closes: Arc<AtomicUsize>,
}

impl LoopbackConnector {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(ExecRequest, RemoteEnd) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RemoteExit> + Send + 'static,
    {
        let handler: Handler = Arc::new(
            move |request: ExecRequest, remote: RemoteEnd| -> BoxFuture<RemoteExit> {
                Box::pin(handler(request, remote))
            },
        );
        Self {
            handler: Some(handler),
            refusal: None,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            requests: Arc::new(Mutex::new(Vec::new())),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A connector whose every `open` fails with a network error.
    pub fn refusing(message: impl Into<String>) -> Self {
        Self {
            handler: None,
            refusal: Some(message.into()),
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            requests: Arc::new(Mutex::new(Vec::new())),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Capacity of each in-memory pipe; small values emulate a transport
    /// that fills up quickly.
    pub fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = capacity.max(1);
        self
    }

    /// Requests seen by `open`, including refused ones.
    pub fn requests(&self) -> Vec<ExecRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    pub fn closed_sessions(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecConnector for LoopbackConnector {
    #[tracing::instrument(
        name = "loopback",
        level = "debug",
        skip(self, request),
        fields(op = "open", pod = %request.target)
    )]
    async fn open(&self, request: &ExecRequest) -> Result<Box<dyn ExecSession>, ConnectError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let Some(handler) = self.handler.as_ref() else {
            let message = self
                .refusal
                .clone()
                .unwrap_or_else(|| "loopback connector refused the session".to_string());
            return Err(ConnectError::new(ConnectErrorKind::Network, message));
        };
        if request.flags.tty {
            return Err(ConnectError::protocol(
                "loopback sessions do not allocate a tty",
            ));
        }

        let capacity = self.pipe_capacity;
        let (stdin, remote_stdin) = pipe_if(request.flags.stdin, capacity);
        let (stdout, remote_stdout) = pipe_if(request.flags.stdout, capacity);
        let (stderr, remote_stderr) = pipe_if(request.flags.stderr, capacity);
        let remote = RemoteEnd {
            stdin: remote_stdin,
            stdout: remote_stdout,
            stderr: remote_stderr,
        };
        let task = tokio::spawn(handler(request.clone(), remote));

        Ok(Box::new(LoopbackSession {
            stdin: stdin.map(|pipe| Box::pin(pipe) as SessionWriter),
            stdout: stdout.map(|pipe| Box::pin(pipe) as SessionReader),
            stderr: stderr.map(|pipe| Box::pin(pipe) as SessionReader),
            task,
            closes: Arc::clone(&self.closes),
            closed: false,
        }))
    }
}

fn pipe_if(attached: bool, capacity: usize) -> (Option<DuplexStream>, Option<DuplexStream>) {
    if !attached {
        return (None, None);
    }
    let (local, remote) = tokio::io::duplex(capacity);
    (Some(local), Some(remote))
}

struct LoopbackSession {
    stdin: Option<SessionWriter>,
    stdout: Option<SessionReader>,
    stderr: Option<SessionReader>,
    task: JoinHandle<RemoteExit>,
    closes: Arc<AtomicUsize>,
    closed: bool,
}

#[async_trait]
impl ExecSession for LoopbackSession {
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
        (&mut self.task)
            .await
            .map_err(|err| io::Error::new(io::ErrorKind::ConnectionAborted, err))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // Aborting the handler drops its pipe halves, unblocking our side.
        self.task.abort();
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for LoopbackSession {
    fn drop(&mut self) {
        self.close();
    }
}
