use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `level` when set. Logs go to stderr so command
/// output on stdout stays clean. Calling this twice is harmless.
pub fn init(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let _ = match format {
        LogFormat::Pretty => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}
