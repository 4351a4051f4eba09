pub mod execution;
pub mod lock;
pub mod models;
pub mod orchestration;
pub mod output;
pub mod progress;
pub mod status;

/// Install the process-wide log subscriber, filtered by `RUST_LOG` with an
/// `info` default. Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
