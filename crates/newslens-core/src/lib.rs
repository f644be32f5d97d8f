/// Core library for the newslens article bias-scoring service.
///
/// This crate contains the scoring subsystem: configuration management,
/// the LLM provider client, the response parser, the composite calculator,
/// the single-flight score cache, the progress registry, the ensemble
/// engine, the score manager, and the SQLite persistence gateway.
pub mod config;
pub mod error;
pub mod llm;
pub mod scoring;
pub mod storage;

pub use error::*;

/// Returns the version of the newslens-core library.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
