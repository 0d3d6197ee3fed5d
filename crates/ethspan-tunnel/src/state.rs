//! Tunnel state machine
//!
//! Drives one tunnel definition between `Absent` and `Active`:
//!
//! ```text
//! absent -> tunnel_only -> session_created -> interface_configured -> active
//! ```
//!
//! State is never cached — every decision probes the kernel first, so a
//! half-completed previous run (or a manual `ip` invocation in between)
//! leaves nothing to repair beyond re-running. Each step checks whether its
//! target object already exists: matching objects are skipped, mismatched
//! ones fail with `StateConflict` instead of being overwritten.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{TunnelError, TunnelResult};
use crate::kernel::{KernelNet, KernelSession, KernelTunnel};
use ethspan_config::TunnelDefinition;

/// Observed lifecycle position of a tunnel, derived from kernel state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RuntimeTunnelState {
    /// No kernel tunnel object with our tunnel ID
    Absent,
    /// Tunnel object exists, session does not
    TunnelOnly,
    /// Session (and its interface) exist, address not yet assigned
    SessionCreated,
    /// Interface addressed but administratively down
    InterfaceConfigured,
    /// Interface addressed and up; forwards may run
    Active,
}

impl fmt::Display for RuntimeTunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Absent => "absent",
            Self::TunnelOnly => "tunnel-only",
            Self::SessionCreated => "session-created",
            Self::InterfaceConfigured => "interface-configured",
            Self::Active => "active",
        };
        f.write_str(s)
    }
}

/// How long to wait for the kernel to materialize the session interface
const INTERFACE_WAIT: Duration = Duration::from_secs(2);
const INTERFACE_POLL: Duration = Duration::from_millis(100);

/// State machine for a single tunnel definition
pub struct TunnelMachine<'a> {
    kernel: &'a dyn KernelNet,
}

impl<'a> TunnelMachine<'a> {
    /// Bind the machine to a kernel backend
    pub fn new(kernel: &'a dyn KernelNet) -> Self {
        Self { kernel }
    }

    /// Read-only probe of the tunnel's current lifecycle position
    pub fn status(&self, def: &TunnelDefinition) -> TunnelResult<RuntimeTunnelState> {
        let interface = required_interface(def)?;

        if self.kernel.get_tunnel(def.tunnel_id)?.is_none() {
            return Ok(RuntimeTunnelState::Absent);
        }
        if self
            .kernel
            .get_session(def.tunnel_id, def.session_id)?
            .is_none()
        {
            return Ok(RuntimeTunnelState::TunnelOnly);
        }
        if !self.kernel.interface_exists(&interface)?
            || !self
                .kernel
                .interface_addresses(&interface)?
                .contains(&def.interface_cidr)
        {
            return Ok(RuntimeTunnelState::SessionCreated);
        }
        if !self.kernel.interface_is_up(&interface)? {
            return Ok(RuntimeTunnelState::InterfaceConfigured);
        }
        Ok(RuntimeTunnelState::Active)
    }

    /// Walk the tunnel up to `Active`, creating whatever is missing.
    ///
    /// `Active` reflects local interface readiness only; the peer may still
    /// be unreachable — establishing end-to-end connectivity is its job.
    pub fn bring_up(&self, def: &TunnelDefinition) -> TunnelResult<RuntimeTunnelState> {
        let interface = required_interface(def)?;
        let (local_ip, remote_ip) = match (def.local_ip, def.remote_ip) {
            (Some(l), Some(r)) => (l, r),
            _ => {
                return Err(TunnelError::NotConfigured {
                    name: def.name.clone(),
                })
            }
        };

        match self.kernel.get_tunnel(def.tunnel_id)? {
            Some(existing) => check_tunnel_matches(def, &existing)?,
            None => {
                self.kernel
                    .create_tunnel(def.tunnel_id, def.peer_tunnel_id, local_ip, remote_ip)?;
                info!(tunnel = %def.name, tunnel_id = def.tunnel_id, "tunnel created");
            }
        }

        match self.kernel.get_session(def.tunnel_id, def.session_id)? {
            Some(existing) => check_session_matches(def, &existing, &interface)?,
            None => {
                self.kernel.create_session(
                    def.tunnel_id,
                    def.session_id,
                    def.peer_session_id,
                    &interface,
                )?;
                info!(tunnel = %def.name, session_id = def.session_id, "session created");
            }
        }

        // Read-after-write: the interface appears asynchronously once the
        // session exists. Wait briefly before addressing it.
        self.wait_for_interface(&interface)?;

        if !self
            .kernel
            .interface_addresses(&interface)?
            .contains(&def.interface_cidr)
        {
            self.kernel.add_address(&interface, &def.interface_cidr)?;
            info!(tunnel = %def.name, %interface, cidr = %def.interface_cidr, "address assigned");
        }

        if !self.kernel.interface_is_up(&interface)? {
            self.kernel.set_link_up(&interface)?;
            info!(tunnel = %def.name, %interface, "interface up");
        }

        Ok(RuntimeTunnelState::Active)
    }

    /// Walk the tunnel down to `Absent`, skipping already-absent steps.
    /// Callers must stop the tunnel's forwards first.
    pub fn tear_down(&self, def: &TunnelDefinition) -> TunnelResult<()> {
        let interface = required_interface(def)?;

        if self.kernel.interface_exists(&interface)? && self.kernel.interface_is_up(&interface)? {
            self.kernel.set_link_down(&interface)?;
            debug!(tunnel = %def.name, %interface, "interface down");
        }

        if self
            .kernel
            .get_session(def.tunnel_id, def.session_id)?
            .is_some()
        {
            self.kernel.delete_session(def.tunnel_id, def.session_id)?;
            info!(tunnel = %def.name, session_id = def.session_id, "session deleted");
        }

        if self.kernel.get_tunnel(def.tunnel_id)?.is_some() {
            self.kernel.delete_tunnel(def.tunnel_id)?;
            info!(tunnel = %def.name, tunnel_id = def.tunnel_id, "tunnel deleted");
        }

        Ok(())
    }

    fn wait_for_interface(&self, interface: &str) -> TunnelResult<()> {
        let deadline = Instant::now() + INTERFACE_WAIT;
        loop {
            if self.kernel.interface_exists(interface)? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TunnelError::InterfaceMissing {
                    interface: interface.to_string(),
                });
            }
            std::thread::sleep(INTERFACE_POLL);
        }
    }
}

fn required_interface(def: &TunnelDefinition) -> TunnelResult<String> {
    def.interface_name().ok_or_else(|| TunnelError::MissingIndex {
        name: def.name.clone(),
    })
}

/// A pre-existing tunnel object is only ours if every parameter the kernel
/// reports agrees with the definition.
fn check_tunnel_matches(def: &TunnelDefinition, existing: &KernelTunnel) -> TunnelResult<()> {
    let mut diffs = Vec::new();
    if let Some(peer) = existing.peer_tunnel_id {
        if peer != def.peer_tunnel_id {
            diffs.push(format!(
                "peer_tunnel_id is {peer}, definition says {}",
                def.peer_tunnel_id
            ));
        }
    }
    if let (Some(actual), Some(wanted)) = (existing.local_ip, def.local_ip) {
        if actual != wanted {
            diffs.push(format!("local endpoint is {actual}, definition says {wanted}"));
        }
    }
    if let (Some(actual), Some(wanted)) = (existing.remote_ip, def.remote_ip) {
        if actual != wanted {
            diffs.push(format!("remote endpoint is {actual}, definition says {wanted}"));
        }
    }
    if diffs.is_empty() {
        Ok(())
    } else {
        Err(TunnelError::StateConflict {
            name: def.name.clone(),
            detail: format!("kernel tunnel {}: {}", def.tunnel_id, diffs.join("; ")),
        })
    }
}

fn check_session_matches(
    def: &TunnelDefinition,
    existing: &KernelSession,
    interface: &str,
) -> TunnelResult<()> {
    let mut diffs = Vec::new();
    if let Some(peer) = existing.peer_session_id {
        if peer != def.peer_session_id {
            diffs.push(format!(
                "peer_session_id is {peer}, definition says {}",
                def.peer_session_id
            ));
        }
    }
    if let Some(actual) = existing.interface.as_deref() {
        if actual != interface {
            diffs.push(format!("interface is {actual}, definition says {interface}"));
        }
    }
    if diffs.is_empty() {
        Ok(())
    } else {
        Err(TunnelError::StateConflict {
            name: def.name.clone(),
            detail: format!("kernel session {}: {}", def.session_id, diffs.join("; ")),
        })
    }
}
