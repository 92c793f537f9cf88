/// Logging configuration and initialization
use std::path::Path;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging system for the embedding process
///
/// Console output always; when `log_dir` is given, a daily-rotated file
/// layer is added (ANSI off). Level defaults to DEBUG in debug builds
/// and INFO in release builds, overridable through `RUST_LOG`.
///
/// Returns the appender guard; dropping it stops the background writer,
/// so the caller keeps it alive for the process lifetime.
pub fn init_logger(
    log_dir: Option<&Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>, Box<dyn std::error::Error>> {
    #[cfg(debug_assertions)]
    let log_level = "debug";

    #[cfg(not(debug_assertions))]
    let log_level = "info";

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let console_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, "dpanahub-engine.log");
            let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .with(fmt::layer().with_writer(non_blocking_file).with_ansi(false))
                .init();

            tracing::info!(log_dir = %dir.display(), "Logger initialized");
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .init();

            tracing::info!("Logger initialized (console only)");
            Ok(None)
        }
    }
}
