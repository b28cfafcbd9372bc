//! Crate error types.
//!
//! Only construction-time plumbing is fallible in a typed way; runtime
//! translation and admission failures are result flags, never errors
//! (see the mapper's `MapResult` and the coordinator's `Option` returns).

use thiserror::Error;

/// Errors surfaced while building a bridge from external inputs.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A configuration document failed to parse.
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),
}
