//! Tracing initialisation for chartfuse binaries and embedders.
//!
//! Call [`init_tracing`] once at program start. Later calls are ignored,
//! since the global subscriber can only be set once per process.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber at `info` unless `RUST_LOG` says otherwise.
///
/// With `json`, log lines are newline-delimited JSON.
pub fn init_tracing(json: bool) {
    init_tracing_with_level(json, Level::INFO);
}

/// Like [`init_tracing`] with an explicit default verbosity.
pub fn init_tracing_with_level(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .json(),
            )
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_initialisation_is_harmless() {
        init_tracing(false);
        init_tracing(true);
        init_tracing_with_level(false, Level::DEBUG);
        tracing::info!("still logging");
    }
}
