//! ethspan tunnel engine
//!
//! Reconciles declared L2TPv3 Ethernet tunnel definitions against live
//! kernel state and supervised port forwards. Kernel state is queried fresh
//! on every decision and never cached, so any invocation — boot, retry
//! after a partial failure, or a manual re-run — converges from whatever
//! state the host is actually in.

#![warn(missing_docs)]

pub mod alloc;
pub mod error;
pub mod forward;
pub mod kernel;
pub mod reconcile;
pub mod state;

#[cfg(test)]
pub(crate) mod testutil;

pub use alloc::AllocationReport;
pub use error::{TunnelError, TunnelResult};
pub use forward::{ForwardError, ForwardSpawner, SystemdSocat};
pub use kernel::{Iproute2, KernelError, KernelNet};
pub use reconcile::{ApplyReport, Reconciler, TunnelReport, TunnelStatus};
pub use state::{RuntimeTunnelState, TunnelMachine};
