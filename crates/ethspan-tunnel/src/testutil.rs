//! In-memory fakes shared by the engine tests

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use crate::forward::{ForwardError, ForwardSpawner};
use crate::kernel::{KernelError, KernelNet, KernelSession, KernelTunnel};
use ethspan_config::{Cidr, TunnelDefinition};

/// A fully configured definition ready for bring_up
pub fn test_definition(name: &str, index: u32) -> TunnelDefinition {
    let mut def = TunnelDefinition::new(name, index).unwrap();
    def.local_ip = Some("192.0.2.1".parse().unwrap());
    def.remote_ip = Some("198.51.100.1".parse().unwrap());
    def
}

#[derive(Default)]
struct Iface {
    addrs: Vec<Cidr>,
    up: bool,
}

#[derive(Default)]
struct KernelState {
    tunnels: BTreeMap<u32, KernelTunnel>,
    sessions: BTreeMap<(u32, u32), KernelSession>,
    interfaces: BTreeMap<String, Iface>,
    mutations: Vec<String>,
    fail_ops: BTreeSet<&'static str>,
}

/// Fake kernel: tracks tunnels/sessions/interfaces and logs every mutation,
/// so tests can assert idempotence by counting log entries.
#[derive(Default)]
pub struct MockKernel {
    state: RefCell<KernelState>,
}

impl MockKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mutation_log(&self) -> Vec<String> {
        self.state.borrow().mutations.clone()
    }

    pub fn clear_mutation_log(&self) {
        self.state.borrow_mut().mutations.clear();
    }

    /// Make the named operation fail until cleared
    pub fn fail_op(&self, op: &'static str) {
        self.state.borrow_mut().fail_ops.insert(op);
    }

    pub fn clear_failures(&self) {
        self.state.borrow_mut().fail_ops.clear();
    }

    fn check_fail(&self, op: &'static str) -> Result<(), KernelError> {
        if self.state.borrow().fail_ops.contains(op) {
            Err(KernelError::CommandFailed {
                cmd: format!("mock {op}"),
                stderr: "injected failure".into(),
            })
        } else {
            Ok(())
        }
    }
}

impl KernelNet for MockKernel {
    fn list_tunnels(&self) -> Result<Vec<KernelTunnel>, KernelError> {
        self.check_fail("list_tunnels")?;
        Ok(self.state.borrow().tunnels.values().cloned().collect())
    }

    fn list_sessions(&self) -> Result<Vec<KernelSession>, KernelError> {
        self.check_fail("list_sessions")?;
        Ok(self.state.borrow().sessions.values().cloned().collect())
    }

    fn create_tunnel(
        &self,
        tunnel_id: u32,
        peer_tunnel_id: u32,
        local_ip: IpAddr,
        remote_ip: IpAddr,
    ) -> Result<(), KernelError> {
        self.check_fail("create_tunnel")?;
        let mut state = self.state.borrow_mut();
        if state.tunnels.contains_key(&tunnel_id) {
            return Err(KernelError::AlreadyExists {
                cmd: format!("mock create_tunnel {tunnel_id}"),
            });
        }
        state.tunnels.insert(
            tunnel_id,
            KernelTunnel {
                tunnel_id,
                peer_tunnel_id: Some(peer_tunnel_id),
                local_ip: Some(local_ip),
                remote_ip: Some(remote_ip),
            },
        );
        state.mutations.push(format!("create_tunnel {tunnel_id}"));
        Ok(())
    }

    fn create_session(
        &self,
        tunnel_id: u32,
        session_id: u32,
        peer_session_id: u32,
        interface: &str,
    ) -> Result<(), KernelError> {
        self.check_fail("create_session")?;
        let mut state = self.state.borrow_mut();
        if !state.tunnels.contains_key(&tunnel_id) {
            return Err(KernelError::CommandFailed {
                cmd: format!("mock create_session {tunnel_id}/{session_id}"),
                stderr: "tunnel does not exist".into(),
            });
        }
        if state.sessions.contains_key(&(tunnel_id, session_id)) {
            return Err(KernelError::AlreadyExists {
                cmd: format!("mock create_session {tunnel_id}/{session_id}"),
            });
        }
        state.sessions.insert(
            (tunnel_id, session_id),
            KernelSession {
                tunnel_id,
                session_id,
                peer_session_id: Some(peer_session_id),
                interface: Some(interface.to_string()),
            },
        );
        // The kernel materializes the Ethernet interface with the session.
        state.interfaces.insert(interface.to_string(), Iface::default());
        state
            .mutations
            .push(format!("create_session {tunnel_id}/{session_id}"));
        Ok(())
    }

    fn delete_session(&self, tunnel_id: u32, session_id: u32) -> Result<(), KernelError> {
        self.check_fail("delete_session")?;
        let mut state = self.state.borrow_mut();
        if let Some(session) = state.sessions.remove(&(tunnel_id, session_id)) {
            if let Some(iface) = session.interface {
                state.interfaces.remove(&iface);
            }
        }
        state
            .mutations
            .push(format!("delete_session {tunnel_id}/{session_id}"));
        Ok(())
    }

    fn delete_tunnel(&self, tunnel_id: u32) -> Result<(), KernelError> {
        self.check_fail("delete_tunnel")?;
        let mut state = self.state.borrow_mut();
        state.tunnels.remove(&tunnel_id);
        state.mutations.push(format!("delete_tunnel {tunnel_id}"));
        Ok(())
    }

    fn interface_exists(&self, interface: &str) -> Result<bool, KernelError> {
        Ok(self.state.borrow().interfaces.contains_key(interface))
    }

    fn interface_is_up(&self, interface: &str) -> Result<bool, KernelError> {
        Ok(self
            .state
            .borrow()
            .interfaces
            .get(interface)
            .map(|i| i.up)
            .unwrap_or(false))
    }

    fn interface_addresses(&self, interface: &str) -> Result<Vec<Cidr>, KernelError> {
        Ok(self
            .state
            .borrow()
            .interfaces
            .get(interface)
            .map(|i| i.addrs.clone())
            .unwrap_or_default())
    }

    fn add_address(&self, interface: &str, cidr: &Cidr) -> Result<(), KernelError> {
        self.check_fail("add_address")?;
        let mut state = self.state.borrow_mut();
        let iface = state.interfaces.entry(interface.to_string()).or_default();
        if !iface.addrs.contains(cidr) {
            iface.addrs.push(*cidr);
        }
        state
            .mutations
            .push(format!("add_address {interface} {cidr}"));
        Ok(())
    }

    fn set_link_up(&self, interface: &str) -> Result<(), KernelError> {
        self.check_fail("set_link_up")?;
        let mut state = self.state.borrow_mut();
        state.interfaces.entry(interface.to_string()).or_default().up = true;
        state.mutations.push(format!("set_link_up {interface}"));
        Ok(())
    }

    fn set_link_down(&self, interface: &str) -> Result<(), KernelError> {
        self.check_fail("set_link_down")?;
        let mut state = self.state.borrow_mut();
        if let Some(iface) = state.interfaces.get_mut(interface) {
            iface.up = false;
        }
        state.mutations.push(format!("set_link_down {interface}"));
        Ok(())
    }
}

#[derive(Default)]
struct SpawnerState {
    registered: BTreeMap<(String, u16), bool>,
    events: Vec<String>,
    fail_spawn: BTreeSet<(String, u16)>,
}

/// Fake forward supervisor recording spawn/terminate events
#[derive(Default)]
pub struct MockSpawner {
    state: RefCell<SpawnerState>,
}

impl MockSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a forward, optionally already dead
    pub fn set_alive(&self, tunnel: &str, port: u16, alive: bool) {
        self.state
            .borrow_mut()
            .registered
            .insert((tunnel.to_string(), port), alive);
    }

    /// Keep the forward registered but mark its process exited
    pub fn mark_dead(&self, tunnel: &str, port: u16) {
        self.set_alive(tunnel, port, false);
    }

    /// Make spawn fail for this (tunnel, port)
    pub fn fail_spawn(&self, tunnel: &str, port: u16) {
        self.state
            .borrow_mut()
            .fail_spawn
            .insert((tunnel.to_string(), port));
    }

    pub fn events(&self) -> Vec<String> {
        self.state.borrow().events.clone()
    }
}

impl ForwardSpawner for MockSpawner {
    fn spawn(&self, tunnel: &str, port: u16, _target: IpAddr) -> Result<(), ForwardError> {
        let mut state = self.state.borrow_mut();
        state.events.push(format!("spawn {tunnel}:{port}"));
        if state.fail_spawn.contains(&(tunnel.to_string(), port)) {
            return Err(ForwardError::SpawnFailed {
                tunnel: tunnel.to_string(),
                port,
                reason: "injected failure".into(),
            });
        }
        state.registered.insert((tunnel.to_string(), port), true);
        Ok(())
    }

    fn is_alive(&self, tunnel: &str, port: u16) -> Result<bool, ForwardError> {
        Ok(self
            .state
            .borrow()
            .registered
            .get(&(tunnel.to_string(), port))
            .copied()
            .unwrap_or(false))
    }

    fn terminate(&self, tunnel: &str, port: u16) -> Result<(), ForwardError> {
        let mut state = self.state.borrow_mut();
        state.events.push(format!("terminate {tunnel}:{port}"));
        state.registered.remove(&(tunnel.to_string(), port));
        Ok(())
    }

    fn registered(&self, tunnel: &str) -> Result<BTreeSet<u16>, ForwardError> {
        Ok(self
            .state
            .borrow()
            .registered
            .keys()
            .filter(|(t, _)| t == tunnel)
            .map(|(_, p)| *p)
            .collect())
    }
}
