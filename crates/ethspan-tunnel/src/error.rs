//! Engine error types

use thiserror::Error;

use crate::forward::ForwardError;
use crate::kernel::KernelError;
use ethspan_config::ConfigError;

/// Result type for tunnel engine operations
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Errors that can occur while reconciling a tunnel
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Two definitions claim the same identifier; neither is touched
    #[error("allocation conflict for tunnel '{name}': {reason}")]
    AllocationConflict {
        /// Affected tunnel
        name: String,
        /// Which identifier collided and with whom
        reason: String,
    },

    /// A kernel object with our ID exists but its parameters do not match
    /// the definition. Never auto-repaired; tear the tunnel down explicitly.
    #[error("state conflict for tunnel '{name}': {detail}")]
    StateConflict {
        /// Affected tunnel
        name: String,
        /// What differs between kernel and definition
        detail: String,
    },

    /// Definition has no interface index; the allocator has not run
    #[error("tunnel '{name}' has no interface index assigned")]
    MissingIndex {
        /// Affected tunnel
        name: String,
    },

    /// Definition lacks endpoint addresses and cannot be brought up
    #[error("tunnel '{name}' is not configured (local/remote endpoint missing)")]
    NotConfigured {
        /// Affected tunnel
        name: String,
    },

    /// The session was created but its interface never showed up
    #[error("interface '{interface}' did not appear after session creation")]
    InterfaceMissing {
        /// Expected interface name
        interface: String,
    },

    /// A kernel operation failed
    #[error(transparent)]
    Kernel(#[from] KernelError),

    /// A forward process operation failed
    #[error(transparent)]
    Forward(#[from] ForwardError),

    /// Definition could not be loaded or stored
    #[error(transparent)]
    Config(#[from] ConfigError),
}
