//! Reconciliation
//!
//! `apply` loads every definition, allocates identifiers, and converges each
//! tunnel toward its desired state (`active` when enabled, `absent`
//! otherwise). Tunnels are processed independently and sequentially; one
//! failure never blocks the others, and all outcomes are collected into an
//! [`ApplyReport`] whose aggregate success drives the boot-time exit code.
//!
//! Ordering within a tunnel is fixed: on the way up, kernel objects before
//! forwards; on the way down, forwards before kernel objects. A forward
//! never outlives or predates its tunnel.

use tracing::{info, warn};

use crate::alloc;
use crate::error::{TunnelError, TunnelResult};
use crate::forward::{self, ForwardError, ForwardSpawner};
use crate::kernel::KernelNet;
use crate::state::{RuntimeTunnelState, TunnelMachine};
use ethspan_config::{ConfigStore, TunnelDefinition};

/// Outcome for one tunnel in an apply pass
#[derive(Debug)]
pub struct TunnelReport {
    /// Tunnel name
    pub name: String,
    /// State reached, if reconciliation got that far
    pub state: Option<RuntimeTunnelState>,
    /// Fatal error for this tunnel, if any
    pub error: Option<TunnelError>,
    /// Forwards that failed to start; non-fatal, retried next apply
    pub forward_failures: Vec<(u16, ForwardError)>,
}

impl TunnelReport {
    fn failed(name: &str, error: TunnelError) -> Self {
        Self {
            name: name.to_string(),
            state: None,
            error: Some(error),
            forward_failures: Vec::new(),
        }
    }

    /// Fully converged, forwards included
    pub fn ok(&self) -> bool {
        self.error.is_none() && self.forward_failures.is_empty()
    }
}

/// Aggregate outcome of an apply pass
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Per-tunnel outcomes, in definition order
    pub tunnels: Vec<TunnelReport>,
}

impl ApplyReport {
    /// True when every tunnel converged and every forward is running
    pub fn success(&self) -> bool {
        self.tunnels.iter().all(TunnelReport::ok)
    }
}

/// Desired-vs-actual convergence over the whole definition set
pub struct Reconciler<'a> {
    store: &'a ConfigStore,
    kernel: &'a dyn KernelNet,
    spawner: &'a dyn ForwardSpawner,
}

/// A tunnel's definition together with its observed runtime state
#[derive(Debug)]
pub struct TunnelStatus {
    /// The stored definition
    pub definition: TunnelDefinition,
    /// Observed lifecycle state
    pub state: RuntimeTunnelState,
    /// Configured forwarded ports and whether each relay is alive
    pub forwards: Vec<(u16, bool)>,
}

impl<'a> Reconciler<'a> {
    /// Wire the reconciler to its collaborators
    pub fn new(
        store: &'a ConfigStore,
        kernel: &'a dyn KernelNet,
        spawner: &'a dyn ForwardSpawner,
    ) -> Self {
        Self {
            store,
            kernel,
            spawner,
        }
    }

    /// Converge every stored definition; never aborts early
    pub fn apply(&self) -> TunnelResult<ApplyReport> {
        let mut defs = self.store.list()?;
        let allocation = alloc::allocate(self.store, &mut defs)?;

        let mut report = ApplyReport::default();
        for def in &defs {
            let outcome = if let Some(reason) = allocation.conflicts.get(&def.name) {
                TunnelReport::failed(
                    &def.name,
                    TunnelError::AllocationConflict {
                        name: def.name.clone(),
                        reason: reason.clone(),
                    },
                )
            } else {
                self.converge(def)
            };
            report.tunnels.push(outcome);
        }
        Ok(report)
    }

    /// Bring a single tunnel up (persisting `enabled = true`)
    pub fn start_one(&self, name: &str) -> TunnelResult<TunnelReport> {
        self.set_enabled_and_converge(name, true)
    }

    /// Tear a single tunnel down (persisting `enabled = false`)
    pub fn stop_one(&self, name: &str) -> TunnelResult<TunnelReport> {
        self.set_enabled_and_converge(name, false)
    }

    fn set_enabled_and_converge(&self, name: &str, enabled: bool) -> TunnelResult<TunnelReport> {
        // Allocation needs the whole set: uniqueness is host-wide.
        let mut defs = self.store.list()?;
        let allocation = alloc::allocate(self.store, &mut defs)?;
        if let Some(reason) = allocation.conflicts.get(name) {
            return Err(TunnelError::AllocationConflict {
                name: name.to_string(),
                reason: reason.clone(),
            });
        }
        let def = defs
            .iter_mut()
            .find(|d| d.name == name)
            .ok_or_else(|| ethspan_config::ConfigError::NotFound(name.to_string()))?;
        if def.enabled != enabled {
            def.enabled = enabled;
            self.store.put(def)?;
        }
        Ok(self.converge(def))
    }

    /// Observed status of one tunnel, read-only
    pub fn status(&self, name: &str) -> TunnelResult<TunnelStatus> {
        let def = self.store.get(name)?;
        self.status_of(def)
    }

    /// Observed status of every tunnel, read-only
    pub fn status_all(&self) -> TunnelResult<Vec<TunnelStatus>> {
        self.store
            .list()?
            .into_iter()
            .map(|def| self.status_of(def))
            .collect()
    }

    fn status_of(&self, def: TunnelDefinition) -> TunnelResult<TunnelStatus> {
        let machine = TunnelMachine::new(self.kernel);
        let state = if def.interface_index.is_some() {
            machine.status(&def)?
        } else {
            RuntimeTunnelState::Absent
        };
        let mut forwards = Vec::new();
        for &port in &def.forwarded_ports {
            forwards.push((port, self.spawner.is_alive(&def.name, port)?));
        }
        Ok(TunnelStatus {
            definition: def,
            state,
            forwards,
        })
    }

    fn converge(&self, def: &TunnelDefinition) -> TunnelReport {
        let machine = TunnelMachine::new(self.kernel);

        let mut desired_active = def.enabled;
        if def.enabled && !def.is_configured() {
            warn!(tunnel = %def.name, "enabled but endpoints not configured; leaving absent");
            desired_active = false;
        }

        if desired_active {
            match machine.bring_up(def) {
                Ok(state) => {
                    info!(tunnel = %def.name, %state, "tunnel converged");
                    match forward::reconcile_ports(
                        self.spawner,
                        &def.name,
                        &def.forwarded_ports,
                        def.remote_forward_ip,
                    ) {
                        Ok(forward_failures) => TunnelReport {
                            name: def.name.clone(),
                            state: Some(state),
                            error: None,
                            forward_failures,
                        },
                        Err(e) => TunnelReport::failed(&def.name, e.into()),
                    }
                }
                Err(e) => {
                    // A relay must not keep listening for a tunnel that
                    // failed to converge; best-effort stop, the error that
                    // matters is the bring-up failure.
                    if let Err(stop_err) = forward::stop_all(self.spawner, &def.name) {
                        warn!(tunnel = %def.name, error = %stop_err, "failed to stop forwards");
                    }
                    TunnelReport::failed(&def.name, e)
                }
            }
        } else {
            // Forwards must stop before the interface disappears.
            let result = forward::stop_all(self.spawner, &def.name)
                .map_err(TunnelError::from)
                .and_then(|()| machine.tear_down(def));
            match result {
                Ok(()) => TunnelReport {
                    name: def.name.clone(),
                    state: Some(RuntimeTunnelState::Absent),
                    error: None,
                    forward_failures: Vec::new(),
                },
                Err(e) => TunnelReport::failed(&def.name, e),
            }
        }
    }
}
