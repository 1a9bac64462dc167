// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::app::errors::ConnectError;
use crate::app::types::{ExecRequest, RemoteExit};

pub type SessionWriter = Pin<Box<dyn AsyncWrite + Send>>;
pub type SessionReader = Pin<Box<dyn AsyncRead + Send>>;

#[async_trait]
/// One live remote process with multiplexed stdin/stdout/stderr.
/// Each stream can be taken once; the session owns the connection lifecycle.
pub trait ExecSession: Send {
    fn take_stdin(&mut self) -> Option<SessionWriter>;

    fn take_stdout(&mut self) -> Option<SessionReader>;

    fn take_stderr(&mut self) -> Option<SessionReader>;

    /// Resolves with the remote exit status, or an error if the connection
    /// ended before one was reported.
    async fn wait(&mut self) -> io::Result<RemoteExit>;

    /// Releases the underlying connection. Idempotent. Pending readers see EOF
    /// and pending writers fail.
    fn close(&mut self);
}

#[async_trait]
/// Exec capability of the orchestrator. Authentication, pooling and retries
/// live behind this boundary.
pub trait ExecConnector: Send + Sync {
    async fn open(&self, request: &ExecRequest) -> Result<Box<dyn ExecSession>, ConnectError>;
}
