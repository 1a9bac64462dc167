// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::fmt;
use std::io;

use thiserror::Error as ThisError;

pub mod codes {
    pub const CONNECTION_FAILURE: &str = "connection_failure";
    pub const AUTHENTICATION_FAILURE: &str = "authentication_failure";
    pub const NOT_FOUND: &str = "not_found";
    pub const PROTOCOL_ERROR: &str = "protocol_error";
    pub const LOCAL_ERROR: &str = "local_error";
    pub const ARCHIVE_ERROR: &str = "archive_error";
    pub const REMOTE_ERROR: &str = "remote_error";
    pub const CANCELED: &str = "canceled";
    pub const INVALID_ARGUMENT: &str = "invalid_argument";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    Authentication,
    NotFound,
    Network,
    Protocol,
}

/// The exec session could not be opened. Never retried by the copier.
#[derive(Debug, ThisError)]
#[error("{message}")]
pub struct ConnectError {
    kind: ConnectErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ConnectError {
    pub fn new(kind: ConnectErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ConnectErrorKind::Network, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ConnectErrorKind::Protocol, message)
    }

    pub fn kind(&self) -> ConnectErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        match self.kind {
            ConnectErrorKind::Authentication => codes::AUTHENTICATION_FAILURE,
            ConnectErrorKind::NotFound => codes::NOT_FOUND,
            ConnectErrorKind::Network => codes::CONNECTION_FAILURE,
            ConnectErrorKind::Protocol => codes::PROTOCOL_ERROR,
        }
    }
}

/// Diagnostics captured from a remote command that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFailure {
    pub exit_code: Option<i32>,
    pub message: String,
    pub stderr: String,
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = self.exit_code {
            write!(f, " (exit code {code})")?;
        }
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            write!(f, ": {stderr}")?;
        }
        Ok(())
    }
}

#[derive(Debug, ThisError)]
pub enum CopyError {
    #[error("exec session could not be opened: {0}")]
    Connection(#[from] ConnectError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("archive error: {0}")]
    Archive(String),
    #[error("remote command failed: {0}")]
    RemoteExec(RemoteFailure),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl CopyError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        CopyError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn remote(exit_code: Option<i32>, message: impl Into<String>, stderr: String) -> Self {
        CopyError::RemoteExec(RemoteFailure {
            exit_code,
            message: message.into(),
            stderr,
        })
    }

    pub fn code(&self) -> &'static str {
        match self {
            CopyError::Connection(err) => err.code(),
            CopyError::Io { .. } => codes::LOCAL_ERROR,
            CopyError::Archive(_) => codes::ARCHIVE_ERROR,
            CopyError::RemoteExec(_) => codes::REMOTE_ERROR,
            CopyError::Cancelled => codes::CANCELED,
            CopyError::InvalidArgument(_) => codes::INVALID_ARGUMENT,
        }
    }

    pub fn remote_failure(&self) -> Option<&RemoteFailure> {
        match self {
            CopyError::RemoteExec(failure) => Some(failure),
            _ => None,
        }
    }
}

impl From<CopyError> for io::Error {
    fn from(err: CopyError) -> Self {
        let kind = match &err {
            CopyError::Io { source, .. } => source.kind(),
            CopyError::Cancelled => io::ErrorKind::Interrupted,
            CopyError::InvalidArgument(_) => io::ErrorKind::InvalidInput,
            CopyError::Archive(_) => io::ErrorKind::InvalidData,
            CopyError::Connection(_) | CopyError::RemoteExec(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

pub type CopyResult<T> = Result<T, CopyError>;
