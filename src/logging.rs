use tracing_subscriber::EnvFilter;

/// Initialize the fmt subscriber once. `TASKBEAT_LOG` takes any env-filter
/// directive (`debug`, `taskbeat=trace,info`, ...); default is `info`.
pub fn init() {
    let filter =
        EnvFilter::try_from_env("TASKBEAT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
