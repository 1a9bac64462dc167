// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod exec_session;

pub use exec_session::{ExecConnector, ExecSession, SessionReader, SessionWriter};
