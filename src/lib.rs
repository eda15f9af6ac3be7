pub mod config;
pub mod pipeline;
pub mod pipeline_config;

use tracing_subscriber::EnvFilter;

pub use pipeline::processor::{DocumentProcessor, PipelineError};
pub use pipeline_config::PipelineConfig;

/// Install the global tracing subscriber. `RUST_LOG` wins over the built-in
/// filter. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .try_init();
}
