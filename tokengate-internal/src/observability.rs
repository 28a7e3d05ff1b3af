//! Logging setup for the gateway.

use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, ErrorDetails};

#[derive(Clone, Copy, Debug, Default, PartialEq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter.
pub fn setup_observability(log_format: LogFormat) -> Result<(), Error> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,gateway=info,tokengate_internal=info"));

    let result = match log_format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .try_init(),
    };
    result.map_err(|e| {
        Error::new(ErrorDetails::Config {
            message: format!("Failed to initialize logging: {e}"),
        })
    })
}
