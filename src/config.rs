// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result};
use podcp::adapters::cli::Transport;
use podcp::CopyOptions;
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use url::Url;

const APP_DIR_NAME: &str = "podcp";
const CONFIG_FILE_NAME: &str = "podcp.toml";
const CONFIG_ENV_VAR: &str = "PODCP_CONFIG_PATH";
const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_KUBECTL: &str = "kubectl";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    transport: Option<Transport>,
    server: Option<String>,
    token: Option<String>,
    token_file: Option<String>,
    namespace: Option<String>,
    kubectl: Option<String>,
    kube_context: Option<String>,
    kubeconfig: Option<String>,
    chunk_size: Option<usize>,
    stderr_limit: Option<usize>,
    status_timeout_secs: Option<u64>,
    verbose: Option<bool>,
}

#[derive(Debug)]
pub struct Config {
    pub transport: Transport,
    pub server: Option<Url>,
    pub token: Option<String>,
    pub namespace: String,
    pub kubectl: PathBuf,
    pub kube_context: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    pub chunk_size: usize,
    pub stderr_limit: usize,
    pub status_timeout_secs: u64,
    pub verbose: bool,
    #[allow(dead_code)]
    pub config_path: Option<PathBuf>,
}

impl Config {
    pub fn copy_options(&self) -> CopyOptions {
        CopyOptions {
            chunk_size: self.chunk_size,
            stderr_limit: self.stderr_limit,
            status_timeout: Duration::from_secs(self.status_timeout_secs),
            ..CopyOptions::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Override,
    Env,
    ConfigFile,
    Default,
}

impl ConfigSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigSource::Override => "override",
            ConfigSource::Env => "env",
            ConfigSource::ConfigFile => "config",
            ConfigSource::Default => "default",
        }
    }
}

#[derive(Debug)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

#[derive(Debug)]
pub struct ConfigReport {
    pub config_path: Option<PathBuf>,
    pub config_path_source: Option<ConfigSource>,
    pub config_file_present: bool,
    pub transport: ConfigValue<Transport>,
    pub server: ConfigValue<Option<Url>>,
    pub token_present: ConfigValue<bool>,
    pub namespace: ConfigValue<String>,
    pub chunk_size: ConfigValue<usize>,
    pub status_timeout_secs: ConfigValue<u64>,
    pub verbose: ConfigValue<bool>,
}

#[derive(Debug)]
pub struct LoadResult {
    pub config: Config,
    pub report: ConfigReport,
}

#[derive(Debug, Default)]
pub struct Overrides {
    pub transport: Option<Transport>,
    pub server: Option<String>,
    pub token: Option<String>,
    pub namespace: Option<String>,
    pub verbose: Option<bool>,
}

/// Picks the first present value, recording where it came from.
fn layered<T>(over: Option<T>, file: Option<T>, default: impl FnOnce() -> T) -> (T, ConfigSource) {
    match (over, file) {
        (Some(value), _) => (value, ConfigSource::Override),
        (None, Some(value)) => (value, ConfigSource::ConfigFile),
        (None, None) => (default(), ConfigSource::Default),
    }
}

#[allow(dead_code)]
pub fn load(config_path_override: Option<PathBuf>, overrides: Overrides) -> Result<Config> {
    Ok(load_with_report(config_path_override, overrides)?.config)
}

pub fn load_with_report(
    config_path_override: Option<PathBuf>,
    overrides: Overrides,
) -> Result<LoadResult> {
    let (config_path, config_path_source, required) = match config_path_override {
        Some(path) => (Some(expand_path(path)), Some(ConfigSource::Override), true),
        None => match config_path_from_env()? {
            Some(path) => (Some(expand_path(path)), Some(ConfigSource::Env), true),
            None => match default_config_path().ok() {
                Some(path) => (Some(path), Some(ConfigSource::Default), false),
                None => (None, None, false),
            },
        },
    };
    let config_file_present = config_path
        .as_deref()
        .map(|path| path.exists())
        .unwrap_or(false);

    let file_config = match config_path.as_deref() {
        Some(path) => read_config_file(path, required)?,
        None => FileConfig::default(),
    };
    let base_dir = config_path.as_deref().and_then(|path| path.parent());

    let (transport, transport_source) =
        layered(overrides.transport, file_config.transport, || Transport::Kubectl);

    let (raw_server, server_source) = match (overrides.server, file_config.server) {
        (Some(raw), _) => (Some(raw), ConfigSource::Override),
        (None, Some(raw)) => (Some(raw), ConfigSource::ConfigFile),
        (None, None) => (None, ConfigSource::Default),
    };
    let server = raw_server
        .map(|raw| Url::parse(&raw).with_context(|| format!("invalid server URL {raw:?}")))
        .transpose()?;

    let (token, token_source) = match overrides.token {
        Some(token) => (Some(token), ConfigSource::Override),
        None => match (file_config.token_file, file_config.token) {
            (Some(raw), _) => {
                let path = resolve_path(&raw, base_dir);
                let token = fs::read_to_string(&path)
                    .with_context(|| format!("failed to read token file {}", path.display()))?;
                (Some(token.trim().to_string()), ConfigSource::ConfigFile)
            }
            (None, Some(token)) => (Some(token), ConfigSource::ConfigFile),
            (None, None) => (None, ConfigSource::Default),
        },
    };

    let (namespace, namespace_source) = layered(overrides.namespace, file_config.namespace, || {
        DEFAULT_NAMESPACE.to_string()
    });
    if namespace.trim().is_empty() {
        anyhow::bail!("namespace must not be empty");
    }

    let kubectl = file_config
        .kubectl
        .map(|raw| expand_path(PathBuf::from(raw)))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_KUBECTL));
    let kubeconfig = file_config
        .kubeconfig
        .map(|raw| resolve_path(&raw, base_dir));

    let defaults = CopyOptions::default();
    let (chunk_size, chunk_size_source) =
        layered(None, file_config.chunk_size, || defaults.chunk_size);
    if chunk_size == 0 {
        anyhow::bail!("chunk_size must be greater than zero");
    }
    let stderr_limit = file_config.stderr_limit.unwrap_or(defaults.stderr_limit);
    let (status_timeout_secs, status_timeout_source) =
        layered(None, file_config.status_timeout_secs, || {
            defaults.status_timeout.as_secs()
        });
    if status_timeout_secs == 0 {
        anyhow::bail!("status_timeout_secs must be greater than zero");
    }
    let (verbose, verbose_source) = layered(overrides.verbose, file_config.verbose, || false);

    if transport == Transport::Websocket && server.is_none() {
        anyhow::bail!(
            "the websocket transport needs an API server; pass --server or set `server` in the config file"
        );
    }

    let config = Config {
        transport,
        server,
        token,
        namespace,
        kubectl,
        kube_context: file_config.kube_context,
        kubeconfig,
        chunk_size,
        stderr_limit,
        status_timeout_secs,
        verbose,
        config_path: config_path.clone(),
    };

    let report = ConfigReport {
        config_path,
        config_path_source,
        config_file_present,
        transport: ConfigValue {
            value: config.transport,
            source: transport_source,
        },
        server: ConfigValue {
            value: config.server.clone(),
            source: server_source,
        },
        token_present: ConfigValue {
            value: config.token.is_some(),
            source: token_source,
        },
        namespace: ConfigValue {
            value: config.namespace.clone(),
            source: namespace_source,
        },
        chunk_size: ConfigValue {
            value: config.chunk_size,
            source: chunk_size_source,
        },
        status_timeout_secs: ConfigValue {
            value: config.status_timeout_secs,
            source: status_timeout_source,
        },
        verbose: ConfigValue {
            value: config.verbose,
            source: verbose_source,
        },
    };

    Ok(LoadResult { config, report })
}

fn read_config_file(path: &Path, required: bool) -> Result<FileConfig> {
    if !path.exists() {
        if required {
            anyhow::bail!("config file not found at {}", path.display());
        }
        return Ok(FileConfig::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn resolve_path(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    let expanded = shellexpand::tilde(raw);
    let path = PathBuf::from(expanded.as_ref());
    if path.is_absolute() {
        return path;
    }
    match base_dir {
        Some(dir) => dir.join(path),
        None => path,
    }
}

fn expand_path(path: PathBuf) -> PathBuf {
    let path_string = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&path_string);
    PathBuf::from(expanded.as_ref())
}

fn config_path_from_env() -> Result<Option<PathBuf>> {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(value) => {
            if value.is_empty() {
                anyhow::bail!("{CONFIG_ENV_VAR} is set but empty");
            }
            Ok(Some(PathBuf::from(value)))
        }
        None => Ok(None),
    }
}

fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("failed to resolve config directory")?;
    Ok(base.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}
