use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing with a non-blocking stdout writer.
/// Returns a WorkerGuard that must be kept alive for the duration of the program.
pub fn init_tracing(log_level: tracing::Level) -> Result<WorkerGuard> {
    let (non_blocking_stdout, guard) = tracing_appender::non_blocking(std::io::stdout());

    // Application logs at the requested level, noisy dependencies at warn
    let filter_string = format!(
        "mqttd={},\
         tokio=warn,\
         sled=warn",
        log_level.as_str().to_lowercase()
    );

    let env_filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::WARN.into())
        .parse_lossy(&filter_string);

    let formatting_layer = fmt::layer()
        .with_writer(non_blocking_stdout)
        .with_ansi(true)
        .with_level(true)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(formatting_layer)
        .init();

    Ok(guard)
}
