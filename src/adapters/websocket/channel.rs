// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Channel framing of the exec WebSocket. Every binary message starts with a
//! channel byte; the rest is payload for that channel.

use std::io;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::app::types::RemoteExit;

pub(crate) const STDIN: u8 = 0;
pub(crate) const STDOUT: u8 = 1;
pub(crate) const STDERR: u8 = 2;
pub(crate) const STATUS: u8 = 3;
/// v5 only. `[CLOSE, n]` half-closes channel `n`.
pub(crate) const CLOSE: u8 = 255;

pub(crate) fn encode(channel: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.push(channel);
    frame.extend_from_slice(payload);
    frame
}

pub(crate) fn close_frame(channel: u8) -> Vec<u8> {
    vec![CLOSE, channel]
}

pub(crate) fn split_frame(frame: &[u8]) -> Option<(u8, &[u8])> {
    frame.split_first().map(|(channel, payload)| (*channel, payload))
}

#[derive(Debug, Deserialize)]
struct Status {
    status: Option<String>,
    message: Option<String>,
    reason: Option<String>,
    details: Option<StatusDetails>,
}

#[derive(Debug, Deserialize)]
struct StatusDetails {
    #[serde(default)]
    causes: Vec<StatusCause>,
}

#[derive(Debug, Deserialize)]
struct StatusCause {
    reason: Option<String>,
    message: Option<String>,
}

/// Turns the status-channel payload into an exit status. A non-zero exit
/// code only appears as a `NonZeroExitCode` failure with an `ExitCode` cause.
pub(crate) fn parse_status(payload: &[u8]) -> io::Result<RemoteExit> {
    let status: Status = serde_json::from_slice(payload)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    if status.status.as_deref() == Some("Success") {
        return Ok(RemoteExit::success());
    }
    let code = if status.reason.as_deref() == Some("NonZeroExitCode") {
        status
            .details
            .iter()
            .flat_map(|details| details.causes.iter())
            .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
            .and_then(|cause| cause.message.as_deref())
            .and_then(|message| message.trim().parse::<i32>().ok())
    } else {
        None
    };
    Ok(RemoteExit {
        code,
        message: Some(
            status
                .message
                .unwrap_or_else(|| "remote command failed".to_string()),
        ),
    })
}

pub(crate) struct Pipes {
    pub stdin: Option<DuplexStream>,
    pub stdout: Option<DuplexStream>,
    pub stderr: Option<DuplexStream>,
    pub status: oneshot::Sender<RemoteExit>,
}

/// Pumps one exec connection until the status frame arrives or the socket
/// goes away. The socket is split: incoming frames are routed to the local
/// pipes while local stdin is framed onto the socket, and neither direction
/// waits on the other. Stdin EOF is sent as a channel close.
pub(crate) async fn run<S>(ws: WebSocketStream<S>, pipes: Pipes, chunk_size: usize)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Pipes {
        stdin,
        stdout,
        stderr,
        status,
    } = pipes;
    let (mut sink, stream) = ws.split();
    {
        let reader = read_frames(stream, stdout, stderr, status);
        let writer = write_stdin(&mut sink, stdin, chunk_size);
        tokio::pin!(reader, writer);
        let mut writing = true;
        loop {
            tokio::select! {
                () = &mut reader => break,
                () = &mut writer, if writing => writing = false,
            }
        }
    }
    if let Err(err) = sink.close().await {
        tracing::trace!(error = %err, "exec websocket close");
    }
}

async fn read_frames<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    mut stdout: Option<DuplexStream>,
    mut stderr: Option<DuplexStream>,
    status: oneshot::Sender<RemoteExit>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = stream.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(error = %err, "exec websocket failed");
                return;
            }
        };
        match message {
            Message::Binary(data) => {
                let Some((channel, payload)) = split_frame(&data) else {
                    continue;
                };
                match channel {
                    STDOUT => forward(&mut stdout, payload, "stdout").await,
                    STDERR => forward(&mut stderr, payload, "stderr").await,
                    STATUS => {
                        let exit = parse_status(payload).unwrap_or_else(|err| {
                            tracing::warn!(error = %err, "unreadable exec status");
                            RemoteExit {
                                code: None,
                                message: Some(format!("unreadable exec status: {err}")),
                            }
                        });
                        let _ = status.send(exit);
                        return;
                    }
                    other => tracing::trace!(channel = other, "ignoring exec frame"),
                }
            }
            Message::Close(frame) => {
                tracing::debug!(?frame, "server closed exec websocket");
                return;
            }
            _ => {}
        }
    }
}

/// Frames local stdin onto the socket. A local read error stops without the
/// close frame so the remote never sees a clean EOF.
async fn write_stdin<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    stdin: Option<DuplexStream>,
    chunk_size: usize,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(mut stdin) = stdin else {
        return;
    };
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let frame = match stdin.read(&mut buf).await {
            Ok(0) => {
                if let Err(err) = sink.send(Message::Binary(close_frame(STDIN))).await {
                    tracing::debug!(error = %err, "failed to close remote stdin");
                }
                return;
            }
            Ok(n) => encode(STDIN, &buf[..n]),
            Err(err) => {
                tracing::debug!(error = %err, "local stdin failed");
                return;
            }
        };
        if let Err(err) = sink.send(Message::Binary(frame)).await {
            tracing::debug!(error = %err, "failed to send stdin frame");
            return;
        }
    }
}

async fn forward(pipe: &mut Option<DuplexStream>, payload: &[u8], stream: &'static str) {
    let Some(writer) = pipe.as_mut() else {
        return;
    };
    if writer.write_all(payload).await.is_err() {
        tracing::debug!(stream, "local reader gone, discarding output");
        *pipe = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_carry_channel_prefix() {
        assert_eq!(encode(STDIN, b"abc"), [0, b'a', b'b', b'c']);
        assert_eq!(close_frame(STDIN), [255, 0]);
        assert_eq!(split_frame(&[2, b'x']), Some((STDERR, &b"x"[..])));
        assert_eq!(split_frame(&[]), None);
    }

    #[test]
    fn success_status_is_exit_zero() {
        let exit = parse_status(br#"{"metadata":{},"status":"Success"}"#).unwrap();
        assert!(exit.is_success());
    }

    #[test]
    fn non_zero_exit_code_is_extracted_from_causes() {
        let payload = br#"{
            "metadata": {},
            "status": "Failure",
            "message": "command terminated with non-zero exit code: exit status 2",
            "reason": "NonZeroExitCode",
            "details": {"causes": [{"reason": "ExitCode", "message": "2"}]}
        }"#;
        let exit = parse_status(payload).unwrap();
        assert_eq!(exit.code, Some(2));
        assert!(exit.message.unwrap().contains("non-zero exit code"));
    }

    #[test]
    fn other_failures_have_no_exit_code() {
        let payload = br#"{"status":"Failure","message":"container not found (\"app\")","reason":"InternalError"}"#;
        let exit = parse_status(payload).unwrap();
        assert_eq!(exit.code, None);
        assert!(!exit.is_success());
    }

    #[tokio::test]
    async fn output_keeps_flowing_while_stdin_is_backed_up() {
        use tokio_tungstenite::tungstenite::protocol::Role;

        const STDERR_BYTES: usize = 1024 * 1024;
        const STDIN_BYTES: usize = 1024 * 1024;

        let (client_io, server_io) = tokio::io::duplex(4096);
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let mut server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let (mut stdin_writer, stdin_pipe) = tokio::io::duplex(1024);
        let (stderr_pipe, mut stderr_reader) = tokio::io::duplex(1024);
        let (status_tx, status_rx) = oneshot::channel();
        let pump = tokio::spawn(run(
            client,
            Pipes {
                stdin: Some(stdin_pipe),
                stdout: None,
                stderr: Some(stderr_pipe),
                status: status_tx,
            },
            1024,
        ));

        let feeder = tokio::spawn(async move {
            stdin_writer
                .write_all(&vec![7u8; STDIN_BYTES])
                .await
                .expect("write stdin");
        });
        let collector = tokio::spawn(async move {
            let mut out = Vec::new();
            stderr_reader.read_to_end(&mut out).await.expect("read stderr");
            out.len()
        });
        // The remote floods stderr before it reads a single stdin byte.
        let remote = tokio::spawn(async move {
            for _ in 0..STDERR_BYTES / 4096 {
                server
                    .send(Message::Binary(encode(STDERR, &[b'e'; 4096])))
                    .await
                    .expect("send stderr");
            }
            let mut received = 0usize;
            while let Some(Ok(message)) = server.next().await {
                if let Message::Binary(data) = message {
                    match data.as_slice() {
                        [CLOSE, STDIN] => break,
                        [STDIN, rest @ ..] => received += rest.len(),
                        _ => {}
                    }
                }
            }
            server
                .send(Message::Binary(encode(
                    STATUS,
                    br#"{"metadata":{},"status":"Success"}"#,
                )))
                .await
                .expect("send status");
            received
        });

        let exit = tokio::time::timeout(std::time::Duration::from_secs(20), status_rx)
            .await
            .expect("pump must not stall on stdin backpressure")
            .expect("status delivered");
        assert!(exit.is_success());
        feeder.await.expect("feeder");
        assert_eq!(remote.await.expect("remote"), STDIN_BYTES);
        assert_eq!(collector.await.expect("collector"), STDERR_BYTES);
        pump.await.expect("pump");
    }

    #[test]
    fn garbage_status_is_invalid_data() {
        let err = parse_status(b"not json").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
