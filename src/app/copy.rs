// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::io;
use std::path::Path;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::app::archive::{self, ArchiveStats};
use crate::app::download::DownloadStream;
use crate::app::errors::{ConnectError, CopyError, CopyResult};
use crate::app::ports::{ExecConnector, SessionWriter};
use crate::app::supervisor::{StdoutSink, Supervisor};
use crate::app::types::{
    split_remote_path, CopyOptions, Direction, ExecRequest, RemoteCommand, StreamFlags, Target,
    TransferRequest, TransferSummary,
};
use crate::app::unpack::{self, Placement};

/// Copies files into and out of a container through an exec connector.
/// Stateless across calls; every call opens and closes its own session.
#[derive(Clone)]
pub struct Copier {
    connector: Arc<dyn ExecConnector>,
    options: CopyOptions,
}

enum StdinFailure {
    /// Reading or archiving the local file failed. The writer is handed back
    /// so it can be dropped only after the session is closed.
    Local(CopyError, SessionWriter),
    Write(io::Error),
}

impl Copier {
    pub fn new(connector: Arc<dyn ExecConnector>) -> Self {
        Self {
            connector,
            options: CopyOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CopyOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &CopyOptions {
        &self.options
    }

    /// Copies `local_path` to `remote_path` inside the container. The parent
    /// of `remote_path` must exist; a trailing `/` copies into that directory
    /// under the local name.
    #[tracing::instrument(
        name = "copier",
        level = "debug",
        skip(self, target, local_path),
        fields(op = "upload", pod = %target, local = %local_path.display())
    )]
    pub async fn upload(
        &self,
        target: &Target,
        local_path: &Path,
        remote_path: &str,
    ) -> CopyResult<TransferSummary> {
        if remote_path.ends_with('/') {
            return self.upload_into_dir(target, local_path, remote_path).await;
        }
        let (dest_dir, entry_name) = split_remote_path(remote_path)?;
        self.upload_entry(target, local_path, &dest_dir, entry_name)
            .await
    }

    /// Copies `local_path` into the existing remote directory `remote_dir`,
    /// keeping its file name.
    #[tracing::instrument(
        name = "copier",
        level = "debug",
        skip(self, target, local_path),
        fields(op = "upload_into_dir", pod = %target, local = %local_path.display())
    )]
    pub async fn upload_into_dir(
        &self,
        target: &Target,
        local_path: &Path,
        remote_dir: &str,
    ) -> CopyResult<TransferSummary> {
        if remote_dir.is_empty() {
            return Err(CopyError::InvalidArgument(
                "remote directory must not be empty".to_string(),
            ));
        }
        let entry_name = local_path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                CopyError::InvalidArgument(format!(
                    "{} has no usable file name",
                    local_path.display()
                ))
            })?;
        let dest_dir = match remote_dir.trim_end_matches('/') {
            "" => "/",
            dir => dir,
        };
        self.upload_entry(target, local_path, dest_dir, entry_name)
            .await
    }

    async fn upload_entry(
        &self,
        target: &Target,
        local_path: &Path,
        dest_dir: &str,
        entry_name: String,
    ) -> CopyResult<TransferSummary> {
        check_entry_name(&entry_name)?;
        let request = ExecRequest::new(
            target.clone(),
            RemoteCommand::extract_into(dest_dir),
            StreamFlags::UPLOAD,
        );
        // The session is opened before the local file is touched.
        let mut supervisor = Supervisor::open(
            self.connector.as_ref(),
            &request,
            StdoutSink::Discard,
            &self.options,
        )
        .await?;
        let Some(stdin) = supervisor.take_stdin() else {
            supervisor.abort();
            return Err(CopyError::Connection(ConnectError::protocol(
                "exec session did not attach stdin",
            )));
        };

        let (chunks, encoder) =
            archive::spawn_encoder(local_path.to_path_buf(), entry_name, self.options.chunk_size);
        match pump_stdin(stdin, chunks, encoder).await {
            Ok(stats) => {
                let exit = supervisor.finish().await?;
                tracing::info!(
                    pod = %target,
                    dest_dir,
                    archive_bytes = stats.tar_bytes,
                    entries = stats.entries,
                    exit_code = ?exit.code,
                    "upload complete"
                );
                Ok(TransferSummary {
                    direction: Direction::Upload,
                    archive_bytes: stats.tar_bytes,
                    entries: stats.entries,
                })
            }
            Err(StdinFailure::Local(err, stdin)) => {
                supervisor.abort();
                drop(stdin);
                Err(err)
            }
            Err(StdinFailure::Write(err)) => {
                tracing::debug!(error = %err, "stdin write failed, waiting for remote outcome");
                match supervisor.finish().await {
                    Err(remote) => Err(remote),
                    Ok(_) => Err(CopyError::io("failed to write session stdin", err)),
                }
            }
        }
    }

    /// Starts a download of `remote_path`. The returned stream yields raw tar
    /// bytes; stdin is never attached.
    #[tracing::instrument(
        name = "copier",
        level = "debug",
        skip(self, target),
        fields(op = "download", pod = %target)
    )]
    pub async fn download(&self, target: &Target, remote_path: &str) -> CopyResult<DownloadStream> {
        let command = RemoteCommand::archive_to_stdout(remote_path)?;
        let request = ExecRequest::new(target.clone(), command, StreamFlags::DOWNLOAD);
        let (tx, rx) = mpsc::channel(self.options.download_buffer.max(1));
        let supervisor = Supervisor::open(
            self.connector.as_ref(),
            &request,
            StdoutSink::Forward(tx.clone()),
            &self.options,
        )
        .await?;
        Ok(DownloadStream::spawn(supervisor, tx, rx))
    }

    /// Downloads `remote_path` and unpacks it at `local_path`. Nothing is
    /// written to the final location unless the remote command succeeded.
    #[tracing::instrument(
        name = "copier",
        level = "debug",
        skip(self, target, local_path),
        fields(op = "download_to_path", pod = %target, local = %local_path.display())
    )]
    pub async fn download_to_path(
        &self,
        target: &Target,
        remote_path: &str,
        local_path: &Path,
        overwrite: bool,
    ) -> CopyResult<TransferSummary> {
        let (_, entry_name) = split_remote_path(remote_path)?;
        check_entry_name(&entry_name)?;
        let placement = Placement::resolve(local_path, &entry_name, overwrite).await?;
        let stream = self.download(target, remote_path).await?;
        let stats = unpack::unpack_download(stream, &placement, overwrite).await?;
        tracing::info!(
            pod = %target,
            destination = %placement.destination.display(),
            archive_bytes = stats.archive_bytes,
            entries = stats.entries,
            "download complete"
        );
        Ok(TransferSummary {
            direction: Direction::Download,
            archive_bytes: stats.archive_bytes,
            entries: stats.entries,
        })
    }

    pub async fn transfer(
        &self,
        target: &Target,
        request: &TransferRequest,
    ) -> CopyResult<TransferSummary> {
        match request.direction {
            Direction::Upload => {
                self.upload(target, &request.local_path, &request.remote_path)
                    .await
            }
            Direction::Download => {
                self.download_to_path(
                    target,
                    &request.remote_path,
                    &request.local_path,
                    request.overwrite,
                )
                .await
            }
        }
    }
}

/// Forwards encoded chunks to stdin, then signals EOF. On a local failure
/// stdin is left open so the remote never sees a complete-looking stream.
async fn pump_stdin(
    mut stdin: SessionWriter,
    mut chunks: mpsc::Receiver<Vec<u8>>,
    encoder: JoinHandle<CopyResult<ArchiveStats>>,
) -> Result<ArchiveStats, StdinFailure> {
    while let Some(chunk) = chunks.recv().await {
        if let Err(err) = stdin.write_all(&chunk).await {
            return Err(StdinFailure::Write(err));
        }
    }
    let stats = match encoder.await {
        Ok(Ok(stats)) => stats,
        Ok(Err(err)) => return Err(StdinFailure::Local(err, stdin)),
        Err(err) => {
            return Err(StdinFailure::Local(
                CopyError::io("archive encoder task failed", io::Error::other(err)),
                stdin,
            ))
        }
    };
    stdin.flush().await.map_err(StdinFailure::Write)?;
    stdin.shutdown().await.map_err(StdinFailure::Write)?;
    Ok(stats)
}

fn check_entry_name(name: &str) -> CopyResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(CopyError::InvalidArgument(format!(
            "{name:?} cannot be used as an archive entry name"
        )));
    }
    Ok(())
}
