// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::app::errors::CopyResult;
use crate::app::supervisor::{ChunkSender, Supervisor};

/// Raw tar bytes of a download, produced lazily as the remote writes them.
///
/// Items arrive in order. Once stdout is exhausted the remote exit status is
/// checked; a failure is delivered as the final item and invalidates whatever
/// came before it. Dropping the stream closes the exec session.
pub struct DownloadStream {
    rx: mpsc::Receiver<CopyResult<Vec<u8>>>,
    driver: Option<JoinHandle<()>>,
    pending: Vec<u8>,
    pos: usize,
    done: bool,
}

impl DownloadStream {
    pub(crate) fn spawn(
        supervisor: Supervisor,
        tx: ChunkSender,
        rx: mpsc::Receiver<CopyResult<Vec<u8>>>,
    ) -> Self {
        let driver = tokio::spawn(
            async move {
                if let Err(err) = supervisor.finish().await {
                    tracing::debug!(code = err.code(), error = %err, "download failed");
                    let _ = tx.send(Err(err)).await;
                }
            }
            .instrument(tracing::Span::current()),
        );
        Self {
            rx,
            driver: Some(driver),
            pending: Vec::new(),
            pos: 0,
            done: false,
        }
    }

    /// Collects the whole archive, failing if the remote side failed.
    pub async fn into_bytes(mut self) -> CopyResult<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    fn poll_chunk(&mut self, cx: &mut Context<'_>) -> Poll<Option<CopyResult<Vec<u8>>>> {
        if self.done {
            return Poll::Ready(None);
        }
        match ready!(self.rx.poll_recv(cx)) {
            Some(Ok(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Some(Err(err)) => {
                self.done = true;
                Poll::Ready(Some(Err(err)))
            }
            None => {
                self.done = true;
                Poll::Ready(None)
            }
        }
    }
}

impl Stream for DownloadStream {
    type Item = CopyResult<Vec<u8>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        // Leftovers from a partial AsyncRead come first.
        if this.pos < this.pending.len() {
            let rest = this.pending.split_off(this.pos);
            this.pending.clear();
            this.pos = 0;
            return Poll::Ready(Some(Ok(rest)));
        }
        this.poll_chunk(cx)
    }
}

impl AsyncRead for DownloadStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.pos < this.pending.len() {
                let n = buf.remaining().min(this.pending.len() - this.pos);
                buf.put_slice(&this.pending[this.pos..this.pos + n]);
                this.pos += n;
                return Poll::Ready(Ok(()));
            }
            match ready!(this.poll_chunk(cx)) {
                Some(Ok(chunk)) => {
                    this.pending = chunk;
                    this.pos = 0;
                }
                Some(Err(err)) => return Poll::Ready(Err(err.into())),
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl Drop for DownloadStream {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::loopback::LoopbackConnector;
    use crate::app::errors::CopyError;
    use crate::app::supervisor::StdoutSink;
    use crate::app::types::{
        CopyOptions, ExecRequest, RemoteCommand, RemoteExit, StreamFlags, Target,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn open_stream(connector: &LoopbackConnector) -> DownloadStream {
        let request = ExecRequest::new(
            Target::new("default", "apod"),
            RemoteCommand::new(["tar", "cf", "-", "-C", "/", "--", "file"]),
            StreamFlags::DOWNLOAD,
        );
        let (tx, rx) = mpsc::channel(2);
        let supervisor = Supervisor::open(
            connector,
            &request,
            StdoutSink::Forward(tx.clone()),
            &CopyOptions::default(),
        )
        .await
        .expect("open");
        DownloadStream::spawn(supervisor, tx, rx)
    }

    #[tokio::test]
    async fn async_read_yields_all_bytes_in_order() {
        let connector = LoopbackConnector::new(|_, mut remote| async move {
            let mut stdout = remote.stdout.take().expect("stdout");
            for part in [&b"abc"[..], b"def", b"ghi"] {
                stdout.write_all(part).await.expect("write");
            }
            RemoteExit::success()
        });
        let mut stream = open_stream(&connector).await;
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.expect("read");
        assert_eq!(out, b"abcdefghi");
    }

    #[tokio::test]
    async fn failure_arrives_after_partial_data() {
        let connector = LoopbackConnector::new(|_, mut remote| async move {
            let mut stdout = remote.stdout.take().expect("stdout");
            stdout.write_all(b"partial").await.expect("write");
            drop(stdout);
            let mut stderr = remote.stderr.take().expect("stderr");
            stderr.write_all(b"tar: file: Cannot stat").await.expect("write");
            RemoteExit::code(2)
        });
        let mut stream = open_stream(&connector).await;
        let first = stream.next().await.expect("item").expect("data");
        assert_eq!(first, b"partial");
        let err = stream.next().await.expect("item").expect_err("failure");
        assert_eq!(err.remote_failure().and_then(|f| f.exit_code), Some(2));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn async_read_surfaces_failure_as_io_error() {
        let connector =
            LoopbackConnector::new(|_, _remote| async move { RemoteExit::code(1) });
        let mut stream = open_stream(&connector).await;
        let mut out = Vec::new();
        let err = stream.read_to_end(&mut out).await.expect_err("failure");
        let inner = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<CopyError>())
            .expect("copy error inside");
        assert!(matches!(inner, CopyError::RemoteExec(_)));
    }

    #[tokio::test]
    async fn dropping_the_stream_closes_the_session() {
        let connector = LoopbackConnector::new(|_, mut remote| async move {
            let mut stdout = remote.stdout.take().expect("stdout");
            loop {
                if stdout.write_all(&[0u8; 1024]).await.is_err() {
                    break;
                }
            }
            RemoteExit::success()
        });
        let mut stream = open_stream(&connector).await;
        let _ = stream.next().await;
        drop(stream);
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while connector.closed_sessions() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("session closed");
    }
}
