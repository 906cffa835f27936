use crate::config::Environment;
use std::env;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "json" => Some(LogFormat::Json),
            "pretty" => Some(LogFormat::Pretty),
            "compact" => Some(LogFormat::Compact),
            _ => None,
        }
    }

    /// `LOG_FORMAT` wins; otherwise JSON in production, pretty in development.
    fn select(environment: Environment, requested: Option<&str>) -> Self {
        requested
            .and_then(Self::parse)
            .unwrap_or(match environment {
                Environment::Production => LogFormat::Json,
                Environment::Development => LogFormat::Pretty,
            })
    }
}

/// Install the global tracing subscriber.
///
/// Filtering follows `RUST_LOG` (default "info"). Everything is written to
/// stderr; stdout belongs to command output.
pub fn setup_logging(environment: Environment) {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let format = LogFormat::select(environment, env::var("LOG_FORMAT").ok().as_deref());

    let registry = tracing_subscriber::registry().with(env_filter);
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match format {
        LogFormat::Json => registry.with(layer.json().with_level(true)).init(),
        LogFormat::Pretty => registry.with(layer.pretty().with_ansi(true)).init(),
        LogFormat::Compact => registry.with(layer.compact().with_ansi(false)).init(),
    }

    announce(environment, format, env::var("LOG_FORMAT").ok().as_deref());
}

fn announce(environment: Environment, format: LogFormat, requested: Option<&str>) {
    if let Some(value) = requested
        && LogFormat::parse(value).is_none()
    {
        tracing::warn!(value, "Unknown LOG_FORMAT, using the environment default");
    }
    tracing::info!(environment = environment.as_str(), ?format, "Logging initialized");
}
