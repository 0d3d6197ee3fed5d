//! Configuration error types

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading or storing tunnel definitions
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No definition with the given name exists in the store
    #[error("tunnel '{0}' not found")]
    NotFound(String),

    /// Tunnel name contains characters unsafe for interface/unit/file names
    #[error("invalid tunnel name '{0}': use letters, digits, '-' and '_' only")]
    InvalidName(String),

    /// Address could not be parsed as `addr/prefix`
    #[error("invalid CIDR '{0}'")]
    InvalidCidr(String),

    /// Definition file exists but could not be parsed
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        /// Path of the offending file
        path: PathBuf,
        /// Underlying YAML error
        source: serde_yaml::Error,
    },

    /// Definition could not be serialized
    #[error("failed to serialize definition: {0}")]
    Serialize(#[from] serde_yaml::Error),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
