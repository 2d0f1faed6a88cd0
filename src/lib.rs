use tracing_log::LogTracer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

/// Tracing bootstrap. JSON structured logs with RUST_LOG level filtering;
/// also bridges legacy log! macros from dependencies.
pub fn init_tracing() -> Result<(), String> {
    LogTracer::init().map_err(|e| {
        eprintln!("Failed to set LogTracer: {}", e);
        format!("logging init failed: {}", e)
    })?;

    let subscriber = Registry::default()
        .with(EnvFilter::from_default_env())
        .with(
            fmt::layer()
                .json()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        );

    tracing::subscriber::set_global_default(subscriber).map_err(|e| {
        eprintln!("Failed to set tracing subscriber: {}", e);
        format!("logging init failed: {}", e)
    })?;

    Ok(())
}

pub mod config;
pub mod engine;
pub mod errors;
pub mod features;
pub mod learner;
pub mod registry;
pub mod store;
pub mod trainer;
