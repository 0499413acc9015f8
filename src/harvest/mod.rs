//! Keyword image harvesting pipeline
//! Extract -> fetch -> normalize -> dedup, each stage finishing before the next

pub mod cli;
pub mod client;
pub mod config_loader;
pub mod deduplicator;
pub mod download_engine;
pub mod image_normalizer;
pub mod ledger;
pub mod logger;
pub mod orchestration;
pub mod url_extractor;

#[cfg(test)]
mod test_support;

// Re-export commonly used types for convenience
pub use cli::Cli;
pub use config_loader::Configuration;
pub use orchestration::Orchestrator;
