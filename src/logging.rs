//! Log setup for the service binaries
//!
//! One non-blocking rolling file plus a colored stdout stream. JSON
//! mode drops the stdout stream so containerized deployments get a
//! single machine-readable sink. A `RUST_LOG` env filter, when set,
//! wins over the configured level.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::LogConfig;

fn rotation_of(name: &str) -> Rotation {
    match name {
        "hourly" => Rotation::HOURLY,
        "daily" => Rotation::DAILY,
        _ => Rotation::NEVER,
    }
}

/// Install the global subscriber. The returned guard flushes the
/// file writer on drop, so the binary holds it for its lifetime.
pub fn init_logging(config: &LogConfig) -> WorkerGuard {
    let appender = RollingFileAppender::new(
        rotation_of(&config.rotation),
        &config.log_dir,
        &config.log_file,
    );
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let file_layer = fmt::layer().with_writer(file_writer).with_ansi(false);

    if config.use_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer.json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer.with_target(false))
            .with(fmt::layer().with_target(false))
            .init();
    }

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_parsing() {
        assert_eq!(rotation_of("hourly"), Rotation::HOURLY);
        assert_eq!(rotation_of("daily"), Rotation::DAILY);
        // Anything unrecognized means one unrotated file
        assert_eq!(rotation_of("never"), Rotation::NEVER);
        assert_eq!(rotation_of(""), Rotation::NEVER);
    }
}
