use tracing_subscriber::EnvFilter;

/// Initialise structured logging. `RUST_LOG` overrides the default level;
/// the daemon defaults to info, keeping per-saga stage logs visible.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
