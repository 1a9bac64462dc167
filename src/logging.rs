// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::env;
use std::io;
use std::path::Path;
use std::sync::OnceLock;

use tracing::Subscriber;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};
use tracing_subscriber::{EnvFilter, Registry};

const FILTER_ENV: &str = "PODCP_LOG";
const FORMAT_ENV: &str = "PODCP_LOG_FORMAT";
const SPAN_EVENTS_ENV: &str = "PODCP_LOG_SPAN_EVENTS";
const FILE_ENV: &str = "PODCP_LOG_FILE";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
    Compact,
}

/// Console logs go to stderr so stdout stays free for the user.
pub fn init(verbose: bool) {
    let format = parse_format(env_value(FORMAT_ENV).as_deref());
    let span_events = parse_span_events(env_value(SPAN_EVENTS_ENV).as_deref());

    let registry = Registry::default()
        .with(build_filter(verbose))
        .with(tracing_error::ErrorLayer::default());
    let console = fmt_layer(
        format,
        span_events.clone(),
        BoxMakeWriter::new(io::stderr),
        true,
    );
    let registry = registry.with(console);
    let file = build_file_writer().map(|(writer, guard)| {
        let _ = FILE_GUARD.set(guard);
        fmt_layer(format, span_events, BoxMakeWriter::new(writer), false)
    });
    registry.with(file).init();
}

fn fmt_layer<S>(
    format: LogFormat,
    span_events: FmtSpan,
    writer: BoxMakeWriter,
    ansi: bool,
) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_timer(UtcTime::rfc_3339())
        .with_span_events(span_events);
    match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
    }
}

fn build_filter(verbose: bool) -> EnvFilter {
    match env::var(FILTER_ENV) {
        Ok(value) => EnvFilter::new(value),
        Err(_) if verbose => EnvFilter::new("podcp=debug,info"),
        Err(_) => EnvFilter::new("podcp=info,warn"),
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty())
}

fn parse_format(value: Option<&str>) -> LogFormat {
    match value {
        Some("json") => LogFormat::Json,
        Some("pretty") => LogFormat::Pretty,
        _ => LogFormat::Compact,
    }
}

fn parse_span_events(value: Option<&str>) -> FmtSpan {
    match value {
        Some("new") => FmtSpan::NEW,
        Some("enter") => FmtSpan::ENTER,
        Some("exit") => FmtSpan::EXIT,
        Some("close") => FmtSpan::CLOSE,
        Some("full") => FmtSpan::FULL,
        _ => FmtSpan::NONE,
    }
}

fn build_file_writer() -> Option<(NonBlocking, WorkerGuard)> {
    let file_path = env::var(FILE_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())?;

    let path = Path::new(&file_path);
    let file_name = path.file_name()?.to_string_lossy().to_string();
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let appender = tracing_appender::rolling::never(dir, file_name);
    Some(tracing_appender::non_blocking(appender))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_format_falls_back_to_compact() {
        assert_eq!(parse_format(Some("json")), LogFormat::Json);
        assert_eq!(parse_format(Some("pretty")), LogFormat::Pretty);
        assert_eq!(parse_format(Some("yaml")), LogFormat::Compact);
        assert_eq!(parse_format(None), LogFormat::Compact);
    }

    #[test]
    fn span_events_parse_known_values() {
        assert_eq!(parse_span_events(Some("close")), FmtSpan::CLOSE);
        assert_eq!(parse_span_events(Some("full")), FmtSpan::FULL);
        assert_eq!(parse_span_events(Some("bogus")), FmtSpan::NONE);
    }
}
