// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::io;

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::app::errors::{CopyError, CopyResult};
use crate::app::ports::{ExecConnector, ExecSession, SessionReader, SessionWriter};
use crate::app::types::{CopyOptions, ExecRequest, RemoteExit};

pub(crate) type ChunkSender = mpsc::Sender<CopyResult<Vec<u8>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Success,
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },
}

/// `Opening -> Streaming -> Draining -> Closed`. Download sessions skip
/// `Streaming` since nothing is written to stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    Streaming,
    Draining,
    Closed(SessionOutcome),
}

pub(crate) enum StdoutSink {
    Discard,
    Forward(ChunkSender),
}

#[derive(Debug, Default)]
pub(crate) struct StderrCapture {
    bytes: Vec<u8>,
    truncated: u64,
}

impl StderrCapture {
    fn push(&mut self, chunk: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.bytes.len());
        let keep = room.min(chunk.len());
        self.bytes.extend_from_slice(&chunk[..keep]);
        self.truncated += (chunk.len() - keep) as u64;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.bytes.is_empty() && self.truncated == 0
    }

    pub(crate) fn text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated > 0 {
            text.push_str(&format!("\n... {} more bytes truncated", self.truncated));
        }
        text
    }
}

#[derive(Debug)]
enum DrainError {
    Io(io::Error),
    ReceiverGone,
}

async fn drain_stdout(
    mut reader: SessionReader,
    sink: StdoutSink,
    chunk_size: usize,
) -> Result<u64, DrainError> {
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await.map_err(DrainError::Io)?;
        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
        if let StdoutSink::Forward(tx) = &sink {
            tx.send(Ok(buf[..n].to_vec()))
                .await
                .map_err(|_| DrainError::ReceiverGone)?;
        }
    }
}

async fn drain_stderr(mut reader: SessionReader, limit: usize) -> StderrCapture {
    let mut capture = StderrCapture::default();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => return capture,
            Ok(n) => capture.push(&buf[..n], limit),
            Err(err) => {
                tracing::debug!(error = %err, "stderr drain stopped");
                return capture;
            }
        }
    }
}

struct Settled {
    stdout: Result<u64, DrainError>,
    stderr: StderrCapture,
    exit: io::Result<RemoteExit>,
}

/// Owns one exec session from open to close. stdout and stderr are drained on
/// their own tasks for the whole session so the remote side never blocks on a
/// full pipe while the caller is busy writing stdin.
pub(crate) struct Supervisor {
    session: Box<dyn ExecSession>,
    state: SessionState,
    options: CopyOptions,
    forwarding: bool,
    stdout_task: Option<JoinHandle<Result<u64, DrainError>>>,
    stderr_task: Option<JoinHandle<StderrCapture>>,
    closed: bool,
}

impl Supervisor {
    pub(crate) async fn open(
        connector: &dyn ExecConnector,
        request: &ExecRequest,
        sink: StdoutSink,
        options: &CopyOptions,
    ) -> CopyResult<Self> {
        tracing::debug!(
            state = ?SessionState::Opening,
            pod = %request.target,
            command = %request.command,
            "opening exec session"
        );
        let mut session = match connector.open(request).await {
            Ok(session) => session,
            Err(err) => {
                tracing::debug!(
                    state = ?SessionState::Closed(SessionOutcome::Failed {
                        exit_code: None,
                        stderr: String::new(),
                    }),
                    error = %err,
                    "exec session failed to open"
                );
                return Err(CopyError::Connection(err));
            }
        };

        let forwarding = matches!(sink, StdoutSink::Forward(_));
        let chunk_size = options.chunk_size;
        let stdout_task = session
            .take_stdout()
            .map(|reader| tokio::spawn(drain_stdout(reader, sink, chunk_size)));
        let stderr_limit = options.stderr_limit;
        let stderr_task = session
            .take_stderr()
            .map(|reader| tokio::spawn(drain_stderr(reader, stderr_limit)));

        let mut supervisor = Self {
            session,
            state: SessionState::Opening,
            options: options.clone(),
            forwarding,
            stdout_task,
            stderr_task,
            closed: false,
        };
        let next = if request.flags.stdin {
            SessionState::Streaming
        } else {
            SessionState::Draining
        };
        supervisor.transition(next);
        Ok(supervisor)
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &SessionState {
        &self.state
    }

    pub(crate) fn take_stdin(&mut self) -> Option<SessionWriter> {
        self.session.take_stdin()
    }

    /// Closes the session after a local failure without waiting on the remote.
    pub(crate) fn abort(&mut self) {
        self.abort_tasks();
        self.close();
        self.transition(SessionState::Closed(SessionOutcome::Failed {
            exit_code: None,
            stderr: String::new(),
        }));
    }

    /// Waits for stdout to drain and the exit status to arrive, then closes
    /// the session and turns what was observed into a single outcome.
    pub(crate) async fn finish(mut self) -> CopyResult<RemoteExit> {
        self.transition(SessionState::Draining);
        // A download consumer may be arbitrarily slow; only bound the wait
        // once its data has been handed over.
        let forwarded = if self.forwarding {
            Some(self.join_stdout().await)
        } else {
            None
        };

        let limit = self.options.status_timeout;
        let settled = tokio::time::timeout(limit, self.settle(forwarded)).await;
        let Ok(settled) = settled else {
            self.abort();
            return Err(CopyError::remote(
                None,
                format!(
                    "timed out after {}s waiting for the remote process to exit",
                    limit.as_secs_f32()
                ),
                String::new(),
            ));
        };
        self.close();

        let result = evaluate(settled);
        let outcome = match &result {
            Ok(_) => SessionOutcome::Success,
            Err(err) => SessionOutcome::Failed {
                exit_code: err.remote_failure().and_then(|failure| failure.exit_code),
                stderr: err
                    .remote_failure()
                    .map(|failure| failure.stderr.clone())
                    .unwrap_or_default(),
            },
        };
        self.transition(SessionState::Closed(outcome));
        result
    }

    async fn settle(&mut self, forwarded: Option<Result<u64, DrainError>>) -> Settled {
        let stdout = match forwarded {
            Some(stdout) => stdout,
            None => self.join_stdout().await,
        };
        let stderr = self.join_stderr().await;
        let exit = self.session.wait().await;
        Settled {
            stdout,
            stderr,
            exit,
        }
    }

    async fn join_stdout(&mut self) -> Result<u64, DrainError> {
        let Some(task) = self.stdout_task.take() else {
            return Ok(0);
        };
        match task.await {
            Ok(result) => result,
            Err(err) => Err(DrainError::Io(io::Error::other(err))),
        }
    }

    async fn join_stderr(&mut self) -> StderrCapture {
        let Some(task) = self.stderr_task.take() else {
            return StderrCapture::default();
        };
        task.await.unwrap_or_else(|err| {
            tracing::debug!(error = %err, "stderr drain task failed");
            StderrCapture::default()
        })
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(from = ?self.state, to = ?next, "exec session state");
        self.state = next;
    }

    fn abort_tasks(&mut self) {
        if let Some(task) = self.stdout_task.take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.session.close();
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.abort_tasks();
        if !self.closed {
            tracing::debug!("exec session dropped before completion, closing");
            self.close();
        }
    }
}

fn evaluate(settled: Settled) -> CopyResult<RemoteExit> {
    let Settled {
        stdout,
        stderr,
        exit,
    } = settled;
    let exit = match exit {
        Ok(exit) => exit,
        Err(err) => {
            return Err(CopyError::remote(
                None,
                format!("connection ended before the exit status was received: {err}"),
                stderr.text(),
            ));
        }
    };
    if !exit.is_success() {
        let message = exit
            .message
            .clone()
            .unwrap_or_else(|| "remote command exited with a failure status".to_string());
        return Err(CopyError::remote(exit.code, message, stderr.text()));
    }
    if !stderr.is_empty() {
        return Err(CopyError::remote(
            exit.code,
            "remote command reported errors on stderr",
            stderr.text(),
        ));
    }
    match stdout {
        Ok(bytes) => {
            tracing::debug!(stdout_bytes = bytes, "exec session completed");
            Ok(exit)
        }
        Err(DrainError::ReceiverGone) => Err(CopyError::Cancelled),
        Err(DrainError::Io(err)) => Err(CopyError::io("failed to read session stdout", err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::loopback::LoopbackConnector;
    use crate::app::types::{RemoteCommand, StreamFlags, Target};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn request(flags: StreamFlags) -> ExecRequest {
        ExecRequest::new(
            Target::new("default", "apod"),
            RemoteCommand::new(["true"]),
            flags,
        )
    }

    #[test]
    fn stderr_capture_truncates_beyond_limit() {
        let mut capture = StderrCapture::default();
        capture.push(b"hello ", 8);
        capture.push(b"world", 8);
        assert_eq!(capture.bytes, b"hello wo");
        assert_eq!(capture.truncated, 3);
        assert!(capture.text().ends_with("3 more bytes truncated"));
    }

    #[tokio::test]
    async fn open_failure_surfaces_connection_error() {
        let connector = LoopbackConnector::refusing("pods \"apod\" not found");
        let err = Supervisor::open(
            &connector,
            &request(StreamFlags::DOWNLOAD),
            StdoutSink::Discard,
            &CopyOptions::default(),
        )
        .await
        .err()
        .expect("open should fail");
        assert!(matches!(err, CopyError::Connection(_)));
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn forwards_stdout_and_closes_on_success() {
        let connector = LoopbackConnector::new(|_, mut remote| async move {
            let mut stdout = remote.stdout.take().expect("stdout attached");
            stdout.write_all(b"payload").await.expect("write stdout");
            RemoteExit::success()
        });
        let (tx, mut rx) = mpsc::channel(4);
        let supervisor = Supervisor::open(
            &connector,
            &request(StreamFlags::DOWNLOAD),
            StdoutSink::Forward(tx),
            &CopyOptions::default(),
        )
        .await
        .expect("open");
        assert_eq!(supervisor.state(), &SessionState::Draining);

        let exit = supervisor.finish().await.expect("finish");
        assert!(exit.is_success());
        let chunk = rx.recv().await.expect("chunk").expect("ok chunk");
        assert_eq!(chunk, b"payload");
        assert!(rx.recv().await.is_none());
        assert_eq!(connector.closed_sessions(), 1);
    }

    #[tokio::test]
    async fn non_zero_exit_carries_code_and_stderr() {
        let connector = LoopbackConnector::new(|_, mut remote| async move {
            let mut stderr = remote.stderr.take().expect("stderr attached");
            stderr
                .write_all(b"tar: nothing: Cannot stat")
                .await
                .expect("write stderr");
            RemoteExit::code(2)
        });
        let supervisor = Supervisor::open(
            &connector,
            &request(StreamFlags::DOWNLOAD),
            StdoutSink::Discard,
            &CopyOptions::default(),
        )
        .await
        .expect("open");

        let err = supervisor.finish().await.expect_err("should fail");
        let failure = err.remote_failure().expect("remote failure");
        assert_eq!(failure.exit_code, Some(2));
        assert!(failure.stderr.contains("Cannot stat"));
    }

    #[tokio::test]
    async fn stderr_output_fails_an_otherwise_successful_session() {
        let connector = LoopbackConnector::new(|_, mut remote| async move {
            let mut stderr = remote.stderr.take().expect("stderr attached");
            stderr.write_all(&[b'x'; 10_000]).await.expect("write stderr");
            RemoteExit::success()
        });
        let options = CopyOptions {
            stderr_limit: 100,
            ..CopyOptions::default()
        };
        let supervisor = Supervisor::open(
            &connector,
            &request(StreamFlags::DOWNLOAD),
            StdoutSink::Discard,
            &options,
        )
        .await
        .expect("open");

        let err = supervisor.finish().await.expect_err("should fail");
        let failure = err.remote_failure().expect("remote failure");
        assert_eq!(failure.exit_code, Some(0));
        assert!(failure.stderr.starts_with(&"x".repeat(100)));
        assert!(failure.stderr.contains("9900 more bytes truncated"));
    }

    #[tokio::test]
    async fn status_wait_is_bounded() {
        let connector = LoopbackConnector::new(|_, remote| async move {
            let _remote = remote;
            std::future::pending::<()>().await;
            RemoteExit::success()
        });
        let options = CopyOptions {
            status_timeout: Duration::from_millis(50),
            ..CopyOptions::default()
        };
        let supervisor = Supervisor::open(
            &connector,
            &request(StreamFlags::DOWNLOAD),
            StdoutSink::Discard,
            &options,
        )
        .await
        .expect("open");

        let err = supervisor.finish().await.expect_err("should time out");
        let failure = err.remote_failure().expect("remote failure");
        assert_eq!(failure.exit_code, None);
        assert!(failure.message.contains("timed out"));
        assert_eq!(connector.closed_sessions(), 1);
    }

    #[tokio::test]
    async fn dropping_supervisor_closes_session() {
        let connector = LoopbackConnector::new(|_, remote| async move {
            let _remote = remote;
            std::future::pending::<()>().await;
            RemoteExit::success()
        });
        let mut supervisor = Supervisor::open(
            &connector,
            &request(StreamFlags::UPLOAD),
            StdoutSink::Discard,
            &CopyOptions::default(),
        )
        .await
        .expect("open");
        assert_eq!(supervisor.state(), &SessionState::Streaming);
        assert!(supervisor.take_stdin().is_some());

        drop(supervisor);
        assert_eq!(connector.closed_sessions(), 1);
    }

    #[tokio::test]
    async fn abort_closes_once_and_marks_failure() {
        let connector = LoopbackConnector::new(|_, remote| async move {
            let _remote = remote;
            std::future::pending::<()>().await;
            RemoteExit::success()
        });
        let mut supervisor = Supervisor::open(
            &connector,
            &request(StreamFlags::UPLOAD),
            StdoutSink::Discard,
            &CopyOptions::default(),
        )
        .await
        .expect("open");

        supervisor.abort();
        assert!(matches!(
            supervisor.state(),
            SessionState::Closed(SessionOutcome::Failed { exit_code: None, .. })
        ));
        drop(supervisor);
        assert_eq!(connector.closed_sessions(), 1);
    }
}
