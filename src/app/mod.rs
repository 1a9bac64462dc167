// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

mod archive;
pub mod copy;
pub mod download;
pub mod errors;
pub mod ports;
pub mod supervisor;
pub mod types;
mod unpack;
