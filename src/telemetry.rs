//! Tracing subscriber setup for processes embedding the persistor

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingSection};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level; an unparsable level falls
/// back to `persistor=info`. Fails if a global subscriber is already set.
pub fn init_tracing(logging: &LoggingSection) -> anyhow::Result<()> {
    let registry = tracing_subscriber::registry().with(env_filter(logging));

    match logging.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?,
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init()?,
    }

    Ok(())
}

fn env_filter(logging: &LoggingSection) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("persistor=info"))
}
