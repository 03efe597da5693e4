use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Installs the global tracing subscriber.
///
/// The returned guard must be held for the lifetime of the process so the
/// non-blocking writer can flush buffered records on shutdown.
pub fn init_logging() -> WorkerGuard {
    let filter: EnvFilter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (non_blocking_writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    let formatting_layer = fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_thread_ids(true)
        .with_target(true)
        .compact()
        .with_ansi(false)
        .with_writer(non_blocking_writer);

    let subscriber = Registry::default().with(filter).with(formatting_layer);

    let _ = tracing::subscriber::set_global_default(subscriber);
    guard
}
