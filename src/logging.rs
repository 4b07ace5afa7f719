use log::LevelFilter;

/// Initializes the global logger once.
///
/// `RUST_LOG` takes precedence over `default_filter`. Repeated calls are no-ops.
pub fn init_logging(default_filter: LevelFilter) {
    let result = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter.as_str()),
    )
    .format_timestamp(None)
    .try_init();
    if result.is_err() {
        log::debug!("logger already initialized");
    }
}
