use tracing_subscriber::EnvFilter;

/// Map a configured level name onto a tracing level. Unknown names mean `info`.
pub fn parse_level(level: &str) -> tracing::Level {
    match level.trim().to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" | "warning" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set (e.g. `RUST_LOG=servicebus::broker=trace`);
/// otherwise everything at `default_level` and above is printed. Targets are
/// kept so broker, persistence and client lines can be told apart.
pub fn init(default_level: &str) {
    let fallback = parse_level(default_level);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(fallback.as_str().to_lowercase()));

    // try_init: tests and embedding services may call this more than once
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
