// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::io::{self, Read};
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::app::download::DownloadStream;
use crate::app::errors::{CopyError, CopyResult};

const QUEUE_DEPTH: usize = 4;

/// Where a downloaded entry ends up on the local filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Placement {
    /// Directory that receives the entry; staging happens inside it.
    pub dir: PathBuf,
    /// Name of the top-level entry inside the archive.
    pub entry_name: String,
    /// Final path of the entry once moved into place.
    pub destination: PathBuf,
}

impl Placement {
    /// An existing directory receives the entry under its remote name; any
    /// other path names the entry itself.
    pub(crate) async fn resolve(
        local_path: &Path,
        entry_name: &str,
        overwrite: bool,
    ) -> CopyResult<Self> {
        let is_dir = tokio::fs::metadata(local_path)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        let (dir, destination) = if is_dir {
            (local_path.to_path_buf(), local_path.join(entry_name))
        } else {
            let parent = match local_path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };
            (parent, local_path.to_path_buf())
        };

        let dir_meta = tokio::fs::metadata(&dir)
            .await
            .map_err(|err| CopyError::io(format!("failed to access {}", dir.display()), err))?;
        if !dir_meta.is_dir() {
            return Err(CopyError::InvalidArgument(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
        if !overwrite && path_exists(&destination).await {
            return Err(already_exists(&destination));
        }
        Ok(Self {
            dir,
            entry_name: entry_name.to_string(),
            destination,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UnpackStats {
    pub archive_bytes: u64,
    pub entries: usize,
}

/// Unpacks `stream` into a staging directory and moves the entry into place
/// only once the remote side reported success.
#[tracing::instrument(
    name = "unpack",
    level = "debug",
    skip(stream, placement),
    fields(destination = %placement.destination.display())
)]
pub(crate) async fn unpack_download(
    mut stream: DownloadStream,
    placement: &Placement,
    overwrite: bool,
) -> CopyResult<UnpackStats> {
    let staging = tempfile::Builder::new()
        .prefix(".podcp-")
        .tempdir_in(&placement.dir)
        .map_err(|err| {
            CopyError::io(
                format!("failed to create staging directory in {}", placement.dir.display()),
                err,
            )
        })?;

    let (tx, rx) = mpsc::channel::<Vec<u8>>(QUEUE_DEPTH);
    let staging_path = staging.path().to_path_buf();
    let unpacker = tokio::task::spawn_blocking(move || unpack_archive(rx, &staging_path));

    // The stream is read to its end even if unpacking stopped early, so a
    // remote failure is always what gets reported.
    let mut archive_bytes = 0u64;
    let mut remote_error = None;
    let mut feeding = true;
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => {
                archive_bytes += chunk.len() as u64;
                if feeding && tx.send(chunk).await.is_err() {
                    feeding = false;
                }
            }
            Err(err) => {
                remote_error = Some(err);
                break;
            }
        }
    }
    drop(tx);

    let unpacked = match unpacker.await {
        Ok(result) => result,
        Err(err) => Err(CopyError::io("unpack task failed", io::Error::other(err))),
    };
    if let Some(err) = remote_error {
        return Err(err);
    }
    let entries = unpacked?;

    let staged = staging.path().join(&placement.entry_name);
    if tokio::fs::symlink_metadata(&staged).await.is_err() {
        return Err(CopyError::Archive(format!(
            "archive did not contain {}",
            placement.entry_name
        )));
    }
    if path_exists(&placement.destination).await {
        if !overwrite {
            return Err(already_exists(&placement.destination));
        }
        remove_path(&placement.destination).await?;
    }
    tokio::fs::rename(&staged, &placement.destination)
        .await
        .map_err(|err| {
            CopyError::io(
                format!("failed to move download into {}", placement.destination.display()),
                err,
            )
        })?;
    tracing::debug!(entries, archive_bytes, "download unpacked");
    Ok(UnpackStats {
        archive_bytes,
        entries,
    })
}

fn unpack_archive(rx: mpsc::Receiver<Vec<u8>>, staging: &Path) -> CopyResult<usize> {
    let mut archive = tar::Archive::new(ChannelReader::new(rx));
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);

    let mut count = 0usize;
    let entries = archive
        .entries()
        .map_err(|err| CopyError::Archive(format!("failed to read archive: {err}")))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|err| CopyError::Archive(format!("failed to read archive entry: {err}")))?;
        let path = entry
            .path()
            .map(|path| path.display().to_string())
            .unwrap_or_default();
        let unpacked = entry
            .unpack_in(staging)
            .map_err(|err| CopyError::io(format!("failed to unpack {path}"), err))?;
        if unpacked {
            count += 1;
        } else {
            tracing::warn!(path, "skipping archive entry outside the destination");
        }
    }

    // GNU tar pads the stream past the end-of-archive marker; consume it so
    // the producer reaches the exit status.
    let mut reader = archive.into_inner();
    io::copy(&mut reader, &mut io::sink())
        .map_err(|err| CopyError::Archive(format!("failed to read archive trailer: {err}")))?;
    Ok(count)
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path).await.is_ok()
}

async fn remove_path(path: &Path) -> CopyResult<()> {
    let meta = tokio::fs::symlink_metadata(path)
        .await
        .map_err(|err| CopyError::io(format!("failed to access {}", path.display()), err))?;
    let removed = if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    removed.map_err(|err| CopyError::io(format!("failed to replace {}", path.display()), err))
}

fn already_exists(path: &Path) -> CopyError {
    CopyError::io(
        format!("{} already exists", path.display()),
        io::Error::new(
            io::ErrorKind::AlreadyExists,
            "destination exists and overwrite is off",
        ),
    )
}

/// Sync `Read` over chunks from an async producer. Blocking context only.
struct ChannelReader {
    rx: mpsc::Receiver<Vec<u8>>,
    chunk: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            chunk: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.chunk.len() {
            match self.rx.blocking_recv() {
                Some(chunk) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn resolve_into_existing_directory_keeps_remote_name() {
        let dir = tempdir().expect("temp dir");
        let placement = Placement::resolve(dir.path(), "app.log", false)
            .await
            .expect("resolve");
        assert_eq!(placement.dir, dir.path());
        assert_eq!(placement.destination, dir.path().join("app.log"));
    }

    #[tokio::test]
    async fn resolve_new_path_renames_entry() {
        let dir = tempdir().expect("temp dir");
        let target = dir.path().join("renamed.log");
        let placement = Placement::resolve(&target, "app.log", false)
            .await
            .expect("resolve");
        assert_eq!(placement.dir, dir.path());
        assert_eq!(placement.destination, target);
        assert_eq!(placement.entry_name, "app.log");
    }

    #[tokio::test]
    async fn resolve_refuses_existing_file_without_overwrite() {
        let dir = tempdir().expect("temp dir");
        let target = dir.path().join("present");
        std::fs::write(&target, b"old").expect("write");
        let err = Placement::resolve(&target, "present", false)
            .await
            .expect_err("exists");
        assert!(err.to_string().contains("already exists"));
        Placement::resolve(&target, "present", true)
            .await
            .expect("overwrite allowed");
    }

    #[tokio::test]
    async fn resolve_requires_existing_parent() {
        let dir = tempdir().expect("temp dir");
        let target = dir.path().join("missing/child");
        let err = Placement::resolve(&target, "child", false)
            .await
            .expect_err("missing parent");
        assert!(matches!(err, CopyError::Io { .. }));
    }

    #[tokio::test]
    async fn channel_reader_spans_chunk_boundaries() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(b"hel".to_vec()).await.expect("send");
        tx.send(Vec::new()).await.expect("send");
        tx.send(b"lo".to_vec()).await.expect("send");
        drop(tx);
        let text = tokio::task::spawn_blocking(move || {
            let mut out = String::new();
            ChannelReader::new(rx).read_to_string(&mut out).map(|_| out)
        })
        .await
        .expect("join")
        .expect("read");
        assert_eq!(text, "hello");
    }
}
