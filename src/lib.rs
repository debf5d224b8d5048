pub mod artifact;
pub mod chunk_store;
pub mod collective;
pub mod config;
pub mod dataset;
pub mod error;
pub mod launch;
pub mod loader;
pub mod manifest;
pub mod merge;
pub mod model;
pub mod orchestrator;
pub mod tensor;

pub use error::*;

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber honoring `RUST_LOG` (default `info`). Safe to call twice.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}
