//! Logging setup: stdout plus a non-blocking file appender

use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Log file written next to the working directory
const LOG_FILE: &str = "tsrouter.log";

/// Initialize dual-output logging: human-readable stdout plus a plain
/// (no ANSI) file at [`LOG_FILE`].
///
/// Both outputs honor `RUST_LOG`; "info" when unset. The appender guard is
/// deliberately leaked so the writer thread outlives every caller.
pub fn init(directory: &str) {
    let file_appender = tracing_appender::rolling::never(directory, LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let stdout_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let file_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(stdout_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .init();

    std::mem::forget(guard);
}
