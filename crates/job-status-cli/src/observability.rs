//! Logging setup for the `jsl` binary.
//!
//! Log lines go to stderr so stdout stays reserved for JSON command results.

use std::sync::Once;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum LogFormat {
    /// One JSON object per event.
    Json,
    /// Human-readable multi-line output.
    #[default]
    Pretty,
}

/// Installs the global subscriber. `RUST_LOG` overrides the default `info`
/// filter. Later calls are no-ops.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json().with_writer(std::io::stderr))
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty().with_writer(std::io::stderr))
                    .init();
            }
        }
    });
}
