use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber for a binary embedding the
/// diagnostic engine. Returns the non-blocking writer guard; dropping it
/// flushes buffered lines, so keep it alive for the process lifetime.
///
/// Honors `RUST_LOG`; without it the service crate logs at info and
/// everything else at warn, which keeps edge-device logs small.
pub fn init_tracing(service_name: &str) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{service_name}=info,warn")));

    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stderr());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_target(true)
        .try_init();

    Some(guard)
}
