// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::fs;
use std::io::{self, Write};
use std::mem;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::write::EncoderWriter;
use tar::Builder;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use walkdir::WalkDir;

use crate::app::errors::{CopyError, CopyResult};

/// Encoded chunks in flight between the archiver and the stdin writer.
const QUEUE_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ArchiveStats {
    pub tar_bytes: u64,
    pub entries: usize,
}

/// Starts building `tar(source)` as base64 text on a blocking task. Chunks of
/// at most `chunk_size` bytes are produced lazily; the file is never held in
/// memory as a whole. Dropping the receiver stops the task with `Cancelled`.
pub(crate) fn spawn_encoder(
    source: PathBuf,
    entry_name: String,
    chunk_size: usize,
) -> (mpsc::Receiver<Vec<u8>>, JoinHandle<CopyResult<ArchiveStats>>) {
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    let task = tokio::task::spawn_blocking(move || {
        let closed_check = tx.clone();
        let writer = ChunkWriter::new(tx, chunk_size);
        write_archive(&source, &entry_name, writer).map_err(|err| {
            if closed_check.is_closed() {
                CopyError::Cancelled
            } else {
                err
            }
        })
    });
    (rx, task)
}

fn write_archive<W: Write>(source: &Path, entry_name: &str, sink: W) -> CopyResult<ArchiveStats> {
    let meta = fs::metadata(source)
        .map_err(|err| CopyError::io(format!("failed to read {}", source.display()), err))?;

    let encoder = EncoderWriter::new(sink, &STANDARD);
    let mut builder = Builder::new(CountingWriter::new(encoder));
    let entries = if meta.is_dir() {
        append_tree(&mut builder, source, entry_name)?
    } else {
        builder
            .append_path_with_name(source, entry_name)
            .map_err(|err| archive_failure(source, err))?;
        1
    };

    let counting = builder
        .into_inner()
        .map_err(|err| archive_failure(source, err))?;
    let tar_bytes = counting.count;
    let mut encoder = counting.into_inner();
    let mut sink = encoder
        .finish()
        .map_err(|err| archive_failure(source, err))?;
    sink.flush().map_err(|err| archive_failure(source, err))?;
    Ok(ArchiveStats { tar_bytes, entries })
}

fn append_tree<W: Write>(
    builder: &mut Builder<W>,
    source: &Path,
    entry_name: &str,
) -> CopyResult<usize> {
    let mut entries: Vec<(PathBuf, bool)> = Vec::new();
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|err| {
            CopyError::io(format!("failed to walk {}", source.display()), err.into())
        })?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| CopyError::Archive("failed to compute archive relative path".into()))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        if entry.file_type().is_symlink() {
            tracing::debug!(path = %entry.path().display(), "skipping symlink");
            continue;
        }
        if entry.file_type().is_dir() || entry.file_type().is_file() {
            entries.push((rel.to_path_buf(), entry.file_type().is_dir()));
        }
    }
    entries.sort();

    builder
        .append_dir(entry_name, source)
        .map_err(|err| archive_failure(source, err))?;
    for (rel, is_dir) in &entries {
        let dest = Path::new(entry_name).join(rel);
        let src = source.join(rel);
        let appended = if *is_dir {
            builder.append_dir(&dest, &src)
        } else {
            builder.append_path_with_name(&src, &dest)
        };
        appended.map_err(|err| archive_failure(&src, err))?;
    }
    Ok(entries.len() + 1)
}

fn archive_failure(path: &Path, err: io::Error) -> CopyError {
    CopyError::io(format!("failed to archive {}", path.display()), err)
}

struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Sync `Write` that cuts its input into fixed-size chunks and hands them to
/// an async consumer. Must only be used from a blocking context.
struct ChunkWriter {
    tx: mpsc::Sender<Vec<u8>>,
    buf: Vec<u8>,
    chunk_size: usize,
}

impl ChunkWriter {
    fn new(tx: mpsc::Sender<Vec<u8>>, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            tx,
            buf: Vec::with_capacity(chunk_size),
            chunk_size,
        }
    }

    fn send(&mut self, chunk: Vec<u8>) -> io::Result<()> {
        self.tx
            .blocking_send(chunk)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive consumer went away"))
    }
}

impl Write for ChunkWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        while self.buf.len() >= self.chunk_size {
            let rest = self.buf.split_off(self.chunk_size);
            let chunk = mem::replace(&mut self.buf, rest);
            self.send(chunk)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = mem::take(&mut self.buf);
        self.send(chunk)
    }
}
