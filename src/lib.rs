// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Copy files into and out of running pods using nothing but the exec channel
//! and the container's own `sh`, `tar` and `base64`.

pub mod adapters;
pub mod app;

pub use adapters::loopback::{LoopbackConnector, RemoteEnd};
pub use adapters::process::{Launcher, ProcessConnector};
pub use adapters::websocket::{WebSocketConfig, WebSocketConnector};
pub use app::copy::Copier;
pub use app::download::DownloadStream;
pub use app::errors::{codes, ConnectError, ConnectErrorKind, CopyError, CopyResult, RemoteFailure};
pub use app::ports::{ExecConnector, ExecSession, SessionReader, SessionWriter};
pub use app::supervisor::{SessionOutcome, SessionState};
pub use app::types::{
    CopyOptions, Direction, ExecRequest, RemoteCommand, RemoteExit, StreamFlags, Target,
    TransferRequest, TransferSummary,
};
