// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use podcp::adapters::cli::{self, Transport};
use podcp::{
    Copier, CopyError, Direction, ExecConnector, Launcher, ProcessConnector, Target,
    WebSocketConfig, WebSocketConnector,
};

mod config;
mod logging;

fn log_config_report(report: &config::ConfigReport) {
    match (&report.config_path, report.config_path_source) {
        (Some(path), Some(source)) => tracing::info!(
            path = %path.display(),
            source = source.as_str(),
            present = report.config_file_present,
            "config path"
        ),
        (Some(path), None) => tracing::info!(
            path = %path.display(),
            present = report.config_file_present,
            "config path"
        ),
        (None, _) => tracing::info!("config path: (none)"),
    }
    tracing::info!(
        value = report.transport.value.as_str(),
        source = report.transport.source.as_str(),
        "config transport"
    );
    tracing::info!(
        value = report
            .server
            .value
            .as_ref()
            .map(|url| url.as_str())
            .unwrap_or("(none)"),
        source = report.server.source.as_str(),
        "config server"
    );
    tracing::info!(
        present = report.token_present.value,
        source = report.token_present.source.as_str(),
        "config token"
    );
    tracing::info!(
        value = %report.namespace.value,
        source = report.namespace.source.as_str(),
        "config namespace"
    );
    tracing::info!(
        value = report.chunk_size.value,
        source = report.chunk_size.source.as_str(),
        "config chunk_size"
    );
    tracing::info!(
        value = report.status_timeout_secs.value,
        source = report.status_timeout_secs.source.as_str(),
        "config status_timeout_secs"
    );
    tracing::info!(
        value = report.verbose.value,
        source = report.verbose.source.as_str(),
        "config verbose"
    );
}

fn build_connector(config: &config::Config) -> anyhow::Result<Arc<dyn ExecConnector>> {
    match config.transport {
        Transport::Kubectl => Ok(Arc::new(ProcessConnector::new(Launcher::Kubectl {
            program: config.kubectl.clone(),
            context: config.kube_context.clone(),
            kubeconfig: config.kubeconfig.clone(),
        }))),
        Transport::Websocket => {
            let server = config
                .server
                .clone()
                .context("the websocket transport needs an API server")?;
            let mut ws = WebSocketConfig::new(server);
            ws.token = config.token.clone();
            ws.buffer_size = config.chunk_size;
            Ok(Arc::new(WebSocketConnector::new(ws)))
        }
    }
}

fn report_failure(err: &CopyError) {
    eprintln!("error[{}]: {err}", err.code());
    if let Some(failure) = err.remote_failure() {
        let stderr = failure.stderr.trim();
        if !stderr.is_empty() {
            eprintln!("remote stderr:");
            for line in stderr.lines() {
                eprintln!("  {line}");
            }
        }
    }
}

async fn run() -> anyhow::Result<Result<(), CopyError>> {
    let parsed = cli::parse_opts();
    let opts = parsed.opts;
    let config::LoadResult { config, report } = config::load_with_report(
        opts.config,
        config::Overrides {
            transport: opts.transport,
            server: opts.server,
            token: opts.token,
            namespace: opts.namespace,
            verbose: parsed.verbose_override,
        },
    )?;
    logging::init(config.verbose);
    log_config_report(&report);

    let plan = match cli::plan_transfer(&opts.src, &opts.dest) {
        Ok(plan) => plan,
        Err(err) => return Ok(Err(err)),
    };
    let namespace = plan.namespace.unwrap_or_else(|| config.namespace.clone());
    let mut target = Target::new(namespace, plan.pod);
    if let Some(container) = opts.container {
        target = target.with_container(container);
    }
    let request = plan.request.with_overwrite(opts.overwrite);

    let copier = Copier::new(build_connector(&config)?).with_options(config.copy_options());
    let summary = match copier.transfer(&target, &request).await {
        Ok(summary) => summary,
        Err(err) => return Ok(Err(err)),
    };
    match summary.direction {
        Direction::Upload => eprintln!(
            "Copied {} to {target}:{}",
            request.local_path.display(),
            request.remote_path
        ),
        Direction::Download => eprintln!(
            "Copied {target}:{} to {}",
            request.remote_path,
            request.local_path.display()
        ),
    }
    tracing::debug!(
        direction = summary.direction.as_str(),
        archive_bytes = summary.archive_bytes,
        entries = summary.entries,
        "transfer summary"
    );
    Ok(Ok(()))
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    match run().await? {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) => {
            tracing::debug!(code = err.code(), error = ?err, "transfer failed");
            report_failure(&err);
            Ok(ExitCode::FAILURE)
        }
    }
}
