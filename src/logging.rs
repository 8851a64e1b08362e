//! Structured logging
//!
//! JSON logs for production, a compact format for development. Events
//! raised during a join, a fan-out or a negotiation carry their
//! context through the span helpers below, so one client's flow can be
//! followed across services without grepping for ids.

use std::sync::Arc;
use tracing::{info_span, Level, Span};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, EnvFilter, Layer,
};

use crate::config::LoggingConfig;
use crate::models::{ClientId, ConnId};

/// Initialize logging from configuration.
///
/// `RUST_LOG` overrides the configured level when set.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = parse_log_level(&config.level)?;
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let file = match &config.file_path {
        Some(path) => Some(Arc::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?,
        )),
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(format_layer(&config.format, file))
        .init();
    Ok(())
}

/// The event formatting layer: json or compact, stdout or file
fn format_layer<S>(
    format: &str,
    file: Option<Arc<std::fs::File>>,
) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    let base = fmt::layer().with_target(true);
    match (format, file) {
        ("json", Some(file)) => base
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_writer(file)
            .boxed(),
        ("json", None) => base
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .boxed(),
        (_, Some(file)) => base.compact().with_writer(file).boxed(),
        (_, None) => base.compact().boxed(),
    }
}

/// Span for operations scoped to one group
pub fn group_span(group: &str) -> Span {
    info_span!("group", group = %group)
}

/// Span for operations about one client of a group
pub fn client_span(group: &str, client: &ClientId) -> Span {
    info_span!("client", group = %group, client = %client)
}

/// Span for one connection's negotiation and fan-out flow
pub fn conn_span(client: &ClientId, conn: &ConnId) -> Span {
    info_span!("conn", client = %client, conn = %conn)
}

/// Parse log level string to tracing Level
fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}
