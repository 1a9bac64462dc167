// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;

use clap::{CommandFactory, FromArgMatches, Parser, ValueEnum};
use serde::Deserialize;

use crate::app::errors::{CopyError, CopyResult};
use crate::app::types::TransferRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Speak the exec WebSocket protocol to the API server directly.
    Websocket,
    /// Run `kubectl exec` and let it handle the cluster connection.
    Kubectl,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Websocket => "websocket",
            Transport::Kubectl => "kubectl",
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "podcp",
    version,
    about = "Copy files into and out of running pods over the exec channel",
    long_about = None,
    after_help = "Exactly one of SRC and DEST is remote, written as [NAMESPACE/]POD:PATH.\n\
\n\
Configuration precedence: defaults < config file < command-line flags.\n\
Config path precedence: defaults < PODCP_CONFIG_PATH < command-line flags.\n\
If --config is omitted, podcp tries PODCP_CONFIG_PATH, then the default config file location; missing default config is OK."
)]
pub struct Opts {
    #[arg(value_name = "SRC", help = "Source: a local path or [NAMESPACE/]POD:PATH.")]
    pub src: String,
    #[arg(value_name = "DEST", help = "Destination: a local path or [NAMESPACE/]POD:PATH.")]
    pub dest: String,
    #[arg(
        short = 'c',
        long,
        value_name = "NAME",
        help = "Container to run in. May be omitted for single-container pods."
    )]
    pub container: Option<String>,
    #[arg(
        short = 'n',
        long,
        value_name = "NAMESPACE",
        help = "Namespace of the pod when the location does not name one. Overrides `namespace` from the config file."
    )]
    pub namespace: Option<String>,
    #[arg(
        long,
        value_enum,
        value_name = "TRANSPORT",
        help = "How to reach the pod. Overrides `transport` from the config file."
    )]
    pub transport: Option<Transport>,
    #[arg(
        long,
        value_name = "URL",
        help = "API server URL for the websocket transport. Overrides `server` from the config file."
    )]
    pub server: Option<String>,
    #[arg(
        long,
        value_name = "TOKEN",
        help = "Bearer token for the websocket transport. Overrides `token` and `token_file` from the config file."
    )]
    pub token: Option<String>,
    #[arg(
        long,
        action = clap::ArgAction::SetTrue,
        help = "Replace an existing local destination when downloading."
    )]
    pub overwrite: bool,
    #[arg(
        long,
        value_name = "PATH",
        help = "Path to a TOML config file. When omitted, podcp uses PODCP_CONFIG_PATH if set, otherwise the default config file location if available."
    )]
    pub config: Option<PathBuf>,
    #[arg(
        short,
        long,
        action = clap::ArgAction::SetTrue,
        help = "Enable debug logging. Overrides `verbose` from the config file."
    )]
    pub verbose: bool,
}

pub struct ParsedOpts {
    pub opts: Opts,
    pub verbose_override: Option<bool>,
}

pub fn cli_command() -> clap::Command {
    Opts::command()
}

pub fn parse_opts() -> ParsedOpts {
    let matches = cli_command().get_matches();
    let verbose_override = if matches.get_flag("verbose") {
        Some(true)
    } else {
        None
    };
    let opts = Opts::from_arg_matches(&matches).unwrap_or_else(|err| err.exit());
    ParsedOpts {
        opts,
        verbose_override,
    }
}

/// One side of a copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local(PathBuf),
    Remote {
        namespace: Option<String>,
        pod: String,
        path: String,
    },
}

/// `[namespace/]pod:path` is remote; anything else, including paths that
/// start with `/` or `.`, is local.
pub fn parse_location(raw: &str) -> Location {
    let local = || Location::Local(PathBuf::from(raw));
    if raw.starts_with('/') || raw.starts_with('.') {
        return local();
    }
    let Some((prefix, path)) = raw.split_once(':') else {
        return local();
    };
    let (namespace, pod) = match prefix.split_once('/') {
        Some((namespace, pod)) => (Some(namespace.to_string()), pod.to_string()),
        None => (None, prefix.to_string()),
    };
    let valid = |name: &str| !name.is_empty() && !name.contains('/');
    if !valid(&pod) || namespace.as_deref().is_some_and(|ns| !valid(ns)) {
        return local();
    }
    Location::Remote {
        namespace,
        pod,
        path: path.to_string(),
    }
}

/// A copy resolved from the two command-line locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub namespace: Option<String>,
    pub pod: String,
    pub request: TransferRequest,
}

pub fn plan_transfer(src: &str, dest: &str) -> CopyResult<Plan> {
    let (namespace, pod, request) = match (parse_location(src), parse_location(dest)) {
        (
            Location::Local(local),
            Location::Remote {
                namespace,
                pod,
                path,
            },
        ) => (namespace, pod, TransferRequest::upload(local, path)),
        (
            Location::Remote {
                namespace,
                pod,
                path,
            },
            Location::Local(local),
        ) => (namespace, pod, TransferRequest::download(path, local)),
        (Location::Local(_), Location::Local(_)) => {
            return Err(CopyError::InvalidArgument(
                "one of SRC and DEST must be [NAMESPACE/]POD:PATH".to_string(),
            ))
        }
        (Location::Remote { .. }, Location::Remote { .. }) => {
            return Err(CopyError::InvalidArgument(
                "copying between two pods is not supported".to_string(),
            ))
        }
    };
    if request.remote_path.is_empty() {
        return Err(CopyError::InvalidArgument(
            "remote path must not be empty".to_string(),
        ));
    }
    Ok(Plan {
        namespace,
        pod,
        request,
    })
}
