// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! An in-memory pod for loopback tests. It understands exactly the two
//! commands the copier issues and keeps files in a map.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use podcp::{ExecRequest, LoopbackConnector, RemoteEnd, RemoteExit};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const EXTRACT_PREFIX: &str = "base64 -d | tar -xmf - -C ";

#[derive(Default)]
struct PodState {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Clone, Default)]
pub struct MemoryPod {
    state: Arc<Mutex<PodState>>,
}

impl MemoryPod {
    pub fn new() -> Self {
        let pod = Self::default();
        pod.mkdir("/");
        pod
    }

    pub fn mkdir(&self, dir: &str) {
        self.state.lock().unwrap().dirs.insert(dir.to_string());
    }

    pub fn put(&self, path: &str, bytes: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), bytes.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn connector(&self) -> LoopbackConnector {
        let pod = self.clone();
        LoopbackConnector::new(move |request, remote| {
            let pod = pod.clone();
            async move { pod.serve(request, remote).await }
        })
    }

    async fn serve(&self, request: ExecRequest, remote: RemoteEnd) -> RemoteExit {
        let args: Vec<&str> = request.command.args().iter().map(String::as_str).collect();
        match args.as_slice() {
            ["sh", "-c", script] => match script.strip_prefix(EXTRACT_PREFIX) {
                Some(dir) => self.extract(dir.trim_matches('\''), remote).await,
                None => fail(remote, "sh: unsupported script", 127).await,
            },
            ["tar", "cf", "-", "-C", parent, "--", name] => self.archive(parent, name, remote).await,
            _ => fail(remote, "sh: command not found", 127).await,
        }
    }

    async fn extract(&self, dir: &str, mut remote: RemoteEnd) -> RemoteExit {
        if !self.state.lock().unwrap().dirs.contains(dir) {
            drop(remote.stdin.take());
            let message = format!("tar: {dir}: Cannot open: No such file or directory");
            return fail(remote, &message, 2).await;
        }
        let mut encoded = Vec::new();
        if let Some(mut stdin) = remote.stdin.take() {
            stdin.read_to_end(&mut encoded).await.unwrap();
        }
        encoded.retain(|b| !b.is_ascii_whitespace());
        let Ok(raw) = STANDARD.decode(&encoded) else {
            return fail(remote, "base64: invalid input", 1).await;
        };

        let mut archive = tar::Archive::new(raw.as_slice());
        let mut state = self.state.lock().unwrap();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let path = join(dir, name.trim_end_matches('/'));
            if entry.header().entry_type().is_dir() {
                state.dirs.insert(path);
            } else {
                let mut body = Vec::new();
                entry.read_to_end(&mut body).unwrap();
                state.files.insert(path, body);
            }
        }
        RemoteExit::success()
    }

    async fn archive(&self, parent: &str, name: &str, mut remote: RemoteEnd) -> RemoteExit {
        let Some(body) = self.file(&join(parent, name)) else {
            let message = format!(
                "tar: {name}: Cannot stat: No such file or directory\n\
                 tar: Exiting with failure status due to previous errors"
            );
            return fail(remote, &message, 2).await;
        };
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, body.as_slice())
            .unwrap();
        let bytes = builder.into_inner().unwrap();
        if let Some(mut stdout) = remote.stdout.take() {
            stdout.write_all(&bytes).await.unwrap();
        }
        RemoteExit::success()
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

async fn fail(mut remote: RemoteEnd, message: &str, code: i32) -> RemoteExit {
    if let Some(mut stderr) = remote.stderr.take() {
        let _ = stderr.write_all(message.as_bytes()).await;
    }
    RemoteExit::code(code)
}

/// Decodes an upload stream into `(entry name, body)` pairs.
pub fn decode_upload(encoded: &[u8]) -> Vec<(String, Vec<u8>)> {
    let raw = STANDARD.decode(encoded).expect("valid base64");
    let mut archive = tar::Archive::new(raw.as_slice());
    archive
        .entries()
        .expect("entries")
        .map(|entry| {
            let mut entry = entry.expect("entry");
            let name = entry.path().expect("path").to_string_lossy().into_owned();
            let mut body = Vec::new();
            entry.read_to_end(&mut body).expect("body");
            (name, body)
        })
        .collect()
}

/// Builds a single-entry tar archive.
pub fn tar_of(name: &str, body: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(body.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, body).unwrap();
    builder.into_inner().unwrap()
}
