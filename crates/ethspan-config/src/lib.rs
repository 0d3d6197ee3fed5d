//! ethspan configuration
//!
//! Tunnel definitions and the on-disk YAML store that persists them.

#![warn(missing_docs)]

pub mod definition;
pub mod error;
pub mod store;

pub use definition::{Cidr, TunnelDefinition};
pub use error::ConfigError;
pub use store::ConfigStore;

/// Default directory holding one YAML file per tunnel definition
pub const DEFAULT_TUNNELS_DIR: &str = "/etc/ethspan/tunnels";
