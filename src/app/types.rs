// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::app::errors::{CopyError, CopyResult};

/// Where a command runs: namespace, pod and an already-resolved container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub namespace: String,
    pub pod: String,
    /// `None` is only valid for single-container pods.
    pub container: Option<String>,
}

impl Target {
    pub fn new(namespace: impl Into<String>, pod: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: None,
        }
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        let container = container.into();
        self.container = (!container.is_empty()).then_some(container);
        self
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod)?;
        if let Some(container) = &self.container {
            write!(f, " (container {container})")?;
        }
        Ok(())
    }
}

/// Remote argv. Always carried as a sequence, never as a joined string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand(Vec<String>);

impl RemoteCommand {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(args.into_iter().map(Into::into).collect())
    }

    /// `sh -c "base64 -d | tar -xmf - -C <dest_dir>"`
    pub fn extract_into(dest_dir: &str) -> Self {
        let script = format!("base64 -d | tar -xmf - -C {}", sh_quote(dest_dir));
        Self::new(["sh".to_string(), "-c".to_string(), script])
    }

    /// `tar cf - -C <parent> -- <name>`, no shell involved. `--` keeps a
    /// name starting with `-` from being read as an option.
    pub fn archive_to_stdout(remote_path: &str) -> CopyResult<Self> {
        let (parent, name) = split_remote_path(remote_path)?;
        Ok(Self::new([
            "tar",
            "cf",
            "-",
            "-C",
            parent.as_str(),
            "--",
            name.as_str(),
        ]))
    }

    pub fn args(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let quoted: Vec<String> = self.0.iter().map(|arg| sh_quote(arg)).collect();
        write!(f, "{}", quoted.join(" "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFlags {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub tty: bool,
}

impl StreamFlags {
    pub const UPLOAD: StreamFlags = StreamFlags {
        stdin: true,
        stdout: true,
        stderr: true,
        tty: false,
    };

    pub const DOWNLOAD: StreamFlags = StreamFlags {
        stdin: false,
        stdout: true,
        stderr: true,
        tty: false,
    };
}

/// Everything a connector needs to open one exec session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub target: Target,
    pub command: RemoteCommand,
    pub flags: StreamFlags,
}

impl ExecRequest {
    pub fn new(target: Target, command: RemoteCommand, flags: StreamFlags) -> Self {
        Self {
            target,
            command,
            flags,
        }
    }
}

/// Exit status as reported by the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteExit {
    pub code: Option<i32>,
    pub message: Option<String>,
}

impl RemoteExit {
    pub fn success() -> Self {
        Self {
            code: Some(0),
            message: None,
        }
    }

    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            message: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub direction: Direction,
    pub local_path: PathBuf,
    pub remote_path: String,
    /// Replace an existing local destination on download.
    pub overwrite: bool,
}

impl TransferRequest {
    pub fn upload(local_path: impl Into<PathBuf>, remote_path: impl Into<String>) -> Self {
        Self {
            direction: Direction::Upload,
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            overwrite: false,
        }
    }

    pub fn download(remote_path: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            direction: Direction::Download,
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            overwrite: false,
        }
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub direction: Direction,
    /// Raw tar bytes sent or received, before base64.
    pub archive_bytes: u64,
    pub entries: usize,
}

pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;
pub const DEFAULT_STDERR_LIMIT: usize = 64 * 1024;
pub const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_DOWNLOAD_BUFFER: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOptions {
    /// Size of the base64 chunks written to stdin and of stdout reads.
    pub chunk_size: usize,
    /// Bytes of remote stderr kept for error reports.
    pub stderr_limit: usize,
    /// Bound on waiting for the exit status once the data phase is over.
    pub status_timeout: Duration,
    /// Chunks buffered between the stdout drain and a download consumer.
    pub download_buffer: usize,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            stderr_limit: DEFAULT_STDERR_LIMIT,
            status_timeout: DEFAULT_STATUS_TIMEOUT,
            download_buffer: DEFAULT_DOWNLOAD_BUFFER,
        }
    }
}

/// Splits a POSIX remote path into (parent directory, final component).
/// `/copied-testfile` gives (`/`, `copied-testfile`), `file` gives (`.`, `file`).
pub fn split_remote_path(remote_path: &str) -> CopyResult<(String, String)> {
    if remote_path.is_empty() {
        return Err(CopyError::InvalidArgument(
            "remote path must not be empty".to_string(),
        ));
    }
    let trimmed = remote_path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok(("/".to_string(), ".".to_string()));
    }
    match trimmed.rsplit_once('/') {
        Some(("", name)) => Ok(("/".to_string(), name.to_string())),
        Some((parent, name)) => Ok((parent.to_string(), name.to_string())),
        None => Ok((".".to_string(), trimmed.to_string())),
    }
}

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | '+' | '=' | ':' | ',' | '@' | '%')
}

/// Quotes `arg` for `sh` only when it contains characters outside a safe set.
pub(crate) fn sh_quote(arg: &str) -> String {
    if !arg.is_empty() && arg.chars().all(is_shell_safe) {
        return arg.to_string();
    }
    let mut out = String::from("'");
    out.push_str(&arg.replace('\'', r"'\''"));
    out.push('\'');
    out
}
