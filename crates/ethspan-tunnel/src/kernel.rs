//! Kernel network interface
//!
//! All interaction with the kernel's L2TP and link/address namespace goes
//! through the [`KernelNet`] trait. The production implementation,
//! [`Iproute2`], shells out to `ip(8)` and parses its output; tests use an
//! in-memory fake. Nothing here is cached — every query re-reads live state,
//! which is what makes repeated reconciliation safe.

use std::io;
use std::net::IpAddr;
use std::process::Command;

use thiserror::Error;
use tracing::{debug, trace};

use ethspan_config::Cidr;

/// An L2TP tunnel object as reported by the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelTunnel {
    /// Local tunnel ID
    pub tunnel_id: u32,
    /// Peer tunnel ID
    pub peer_tunnel_id: Option<u32>,
    /// Local encapsulation endpoint
    pub local_ip: Option<IpAddr>,
    /// Remote encapsulation endpoint
    pub remote_ip: Option<IpAddr>,
}

/// An L2TP session object as reported by the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSession {
    /// Owning tunnel ID
    pub tunnel_id: u32,
    /// Local session ID
    pub session_id: u32,
    /// Peer session ID
    pub peer_session_id: Option<u32>,
    /// Name of the Ethernet interface backing this session
    pub interface: Option<String>,
}

/// Errors from kernel operations, classified so callers can tell
/// "already exists" from "not allowed" from "module not loaded".
#[derive(Debug, Error)]
pub enum KernelError {
    /// The object the command tried to create already exists
    #[error("'{cmd}' failed: object already exists")]
    AlreadyExists {
        /// Command that failed
        cmd: String,
    },

    /// Insufficient privileges (needs root or CAP_NET_ADMIN)
    #[error("'{cmd}' failed: permission denied (run as root or with CAP_NET_ADMIN)")]
    PermissionDenied {
        /// Command that failed
        cmd: String,
    },

    /// The l2tp kernel modules are not loaded
    #[error("'{cmd}' failed: L2TP kernel support missing (try `ethspan setup`)")]
    ModuleNotLoaded {
        /// Command that failed
        cmd: String,
    },

    /// Any other non-zero exit
    #[error("'{cmd}' failed: {stderr}")]
    CommandFailed {
        /// Command that failed
        cmd: String,
        /// Captured stderr
        stderr: String,
    },

    /// The command could not be spawned at all
    #[error("failed to run '{cmd}': {source}")]
    Spawn {
        /// Command that failed to start
        cmd: String,
        /// Underlying I/O error
        source: io::Error,
    },
}

/// Operations the reconciler needs from the kernel
pub trait KernelNet {
    /// All L2TP tunnels currently present
    fn list_tunnels(&self) -> Result<Vec<KernelTunnel>, KernelError>;

    /// Look up one tunnel by local ID
    fn get_tunnel(&self, tunnel_id: u32) -> Result<Option<KernelTunnel>, KernelError> {
        Ok(self
            .list_tunnels()?
            .into_iter()
            .find(|t| t.tunnel_id == tunnel_id))
    }

    /// All L2TP sessions currently present (across all tunnels)
    fn list_sessions(&self) -> Result<Vec<KernelSession>, KernelError>;

    /// Look up one session by (tunnel, session) ID pair
    fn get_session(
        &self,
        tunnel_id: u32,
        session_id: u32,
    ) -> Result<Option<KernelSession>, KernelError> {
        Ok(self
            .list_sessions()?
            .into_iter()
            .find(|s| s.tunnel_id == tunnel_id && s.session_id == session_id))
    }

    /// Create an IP-encapsulated L2TPv3 tunnel
    fn create_tunnel(
        &self,
        tunnel_id: u32,
        peer_tunnel_id: u32,
        local_ip: IpAddr,
        remote_ip: IpAddr,
    ) -> Result<(), KernelError>;

    /// Create a session inside an existing tunnel; the kernel materializes
    /// the named Ethernet interface as a side effect
    fn create_session(
        &self,
        tunnel_id: u32,
        session_id: u32,
        peer_session_id: u32,
        interface: &str,
    ) -> Result<(), KernelError>;

    /// Delete a session (sessions must go before their tunnel)
    fn delete_session(&self, tunnel_id: u32, session_id: u32) -> Result<(), KernelError>;

    /// Delete a tunnel
    fn delete_tunnel(&self, tunnel_id: u32) -> Result<(), KernelError>;

    /// Whether a link with this name exists
    fn interface_exists(&self, interface: &str) -> Result<bool, KernelError>;

    /// Whether the link is administratively up
    fn interface_is_up(&self, interface: &str) -> Result<bool, KernelError>;

    /// Addresses currently assigned to the link
    fn interface_addresses(&self, interface: &str) -> Result<Vec<Cidr>, KernelError>;

    /// Assign an address; "already assigned" is not an error
    fn add_address(&self, interface: &str, cidr: &Cidr) -> Result<(), KernelError>;

    /// Bring the link administratively up
    fn set_link_up(&self, interface: &str) -> Result<(), KernelError>;

    /// Bring the link administratively down
    fn set_link_down(&self, interface: &str) -> Result<(), KernelError>;
}

/// Production backend shelling out to `ip(8)`
#[derive(Debug, Default)]
pub struct Iproute2;

impl Iproute2 {
    /// Run `ip` with the given arguments, classifying failures
    fn run(&self, args: &[&str]) -> Result<String, KernelError> {
        let cmd = format!("ip {}", args.join(" "));
        trace!(%cmd, "exec");
        let output = Command::new("ip")
            .args(args)
            .output()
            .map_err(|source| KernelError::Spawn {
                cmd: cmd.clone(),
                source,
            })?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify(cmd, stderr))
    }
}

fn classify(cmd: String, stderr: String) -> KernelError {
    let lower = stderr.to_lowercase();
    if lower.contains("file exists") {
        KernelError::AlreadyExists { cmd }
    } else if lower.contains("permission denied") || lower.contains("operation not permitted") {
        KernelError::PermissionDenied { cmd }
    } else if lower.contains("no such protocol")
        || lower.contains("protocol not supported")
        || lower.contains("unknown protocol")
    {
        KernelError::ModuleNotLoaded { cmd }
    } else {
        KernelError::CommandFailed { cmd, stderr }
    }
}

impl KernelNet for Iproute2 {
    fn list_tunnels(&self) -> Result<Vec<KernelTunnel>, KernelError> {
        let out = self.run(&["l2tp", "show", "tunnel"])?;
        Ok(parse_tunnel_show(&out))
    }

    fn list_sessions(&self) -> Result<Vec<KernelSession>, KernelError> {
        let out = self.run(&["l2tp", "show", "session"])?;
        Ok(parse_session_show(&out))
    }

    fn create_tunnel(
        &self,
        tunnel_id: u32,
        peer_tunnel_id: u32,
        local_ip: IpAddr,
        remote_ip: IpAddr,
    ) -> Result<(), KernelError> {
        let tid = tunnel_id.to_string();
        let ptid = peer_tunnel_id.to_string();
        let local = local_ip.to_string();
        let remote = remote_ip.to_string();
        self.run(&[
            "l2tp", "add", "tunnel", "tunnel_id", &tid, "peer_tunnel_id", &ptid, "encap", "ip",
            "local", &local, "remote", &remote,
        ])?;
        debug!(tunnel_id, peer_tunnel_id, "l2tp tunnel created");
        Ok(())
    }

    fn create_session(
        &self,
        tunnel_id: u32,
        session_id: u32,
        peer_session_id: u32,
        interface: &str,
    ) -> Result<(), KernelError> {
        let tid = tunnel_id.to_string();
        let sid = session_id.to_string();
        let psid = peer_session_id.to_string();
        // Naming the session interface pins the index mapping; the kernel's
        // own l2tpethN numbering depends on creation order.
        self.run(&[
            "l2tp",
            "add",
            "session",
            "name",
            interface,
            "tunnel_id",
            &tid,
            "session_id",
            &sid,
            "peer_session_id",
            &psid,
        ])?;
        debug!(tunnel_id, session_id, interface, "l2tp session created");
        Ok(())
    }

    fn delete_session(&self, tunnel_id: u32, session_id: u32) -> Result<(), KernelError> {
        let tid = tunnel_id.to_string();
        let sid = session_id.to_string();
        self.run(&[
            "l2tp", "del", "session", "tunnel_id", &tid, "session_id", &sid,
        ])?;
        debug!(tunnel_id, session_id, "l2tp session deleted");
        Ok(())
    }

    fn delete_tunnel(&self, tunnel_id: u32) -> Result<(), KernelError> {
        let tid = tunnel_id.to_string();
        self.run(&["l2tp", "del", "tunnel", "tunnel_id", &tid])?;
        debug!(tunnel_id, "l2tp tunnel deleted");
        Ok(())
    }

    fn interface_exists(&self, interface: &str) -> Result<bool, KernelError> {
        match self.run(&["-o", "link", "show", "dev", interface]) {
            Ok(_) => Ok(true),
            Err(KernelError::CommandFailed { stderr, .. })
                if stderr.to_lowercase().contains("does not exist") =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn interface_is_up(&self, interface: &str) -> Result<bool, KernelError> {
        let out = self.run(&["-o", "link", "show", "dev", interface])?;
        Ok(parse_link_flags(&out).iter().any(|f| f == "UP"))
    }

    fn interface_addresses(&self, interface: &str) -> Result<Vec<Cidr>, KernelError> {
        let out = self.run(&["-o", "addr", "show", "dev", interface])?;
        Ok(parse_addr_show(&out))
    }

    fn add_address(&self, interface: &str, cidr: &Cidr) -> Result<(), KernelError> {
        let addr = cidr.to_string();
        match self.run(&["addr", "add", &addr, "dev", interface]) {
            Ok(_) => {
                debug!(interface, %addr, "address assigned");
                Ok(())
            }
            // Re-running after a partial apply hits this; same end state.
            Err(KernelError::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn set_link_up(&self, interface: &str) -> Result<(), KernelError> {
        self.run(&["link", "set", "dev", interface, "up"])?;
        debug!(interface, "link up");
        Ok(())
    }

    fn set_link_down(&self, interface: &str) -> Result<(), KernelError> {
        self.run(&["link", "set", "dev", interface, "down"])?;
        debug!(interface, "link down");
        Ok(())
    }
}

/// Parse `ip l2tp show tunnel` output:
///
/// ```text
/// Tunnel 1000, encap IP
///   From 192.0.2.1 to 198.51.100.1
///   Peer tunnel 2000
/// ```
fn parse_tunnel_show(out: &str) -> Vec<KernelTunnel> {
    let mut tunnels: Vec<KernelTunnel> = Vec::new();
    for line in out.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Tunnel ") {
            let id = rest.split([',', ' ']).next().and_then(|s| s.parse().ok());
            if let Some(tunnel_id) = id {
                tunnels.push(KernelTunnel {
                    tunnel_id,
                    peer_tunnel_id: None,
                    local_ip: None,
                    remote_ip: None,
                });
            }
        } else if let Some(current) = tunnels.last_mut() {
            if let Some(rest) = line.strip_prefix("From ") {
                let mut words = rest.split_whitespace();
                current.local_ip = words.next().and_then(|s| s.parse().ok());
                if words.next() == Some("to") {
                    current.remote_ip = words.next().and_then(|s| s.parse().ok());
                }
            } else if let Some(rest) = line.strip_prefix("Peer tunnel ") {
                current.peer_tunnel_id = rest.trim().parse().ok();
            }
        }
    }
    tunnels
}

/// Parse `ip l2tp show session` output:
///
/// ```text
/// Session 10 in tunnel 1000
///   Peer session 20, tunnel 2000
///   interface name: l2tpeth0
/// ```
fn parse_session_show(out: &str) -> Vec<KernelSession> {
    let mut sessions: Vec<KernelSession> = Vec::new();
    for line in out.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Session ") {
            let mut words = rest.split_whitespace();
            let session_id = words.next().and_then(|s| s.parse().ok());
            let tunnel_id = match (words.next(), words.next(), words.next()) {
                (Some("in"), Some("tunnel"), Some(id)) => id.parse().ok(),
                _ => None,
            };
            if let (Some(session_id), Some(tunnel_id)) = (session_id, tunnel_id) {
                sessions.push(KernelSession {
                    tunnel_id,
                    session_id,
                    peer_session_id: None,
                    interface: None,
                });
            }
        } else if let Some(current) = sessions.last_mut() {
            if let Some(rest) = line.strip_prefix("Peer session ") {
                current.peer_session_id =
                    rest.split([',', ' ']).next().and_then(|s| s.parse().ok());
            } else if let Some(rest) = line.strip_prefix("interface name:") {
                current.interface = Some(rest.trim().to_string());
            }
        }
    }
    sessions
}

/// Extract the `<...>` flag list from `ip -o link show` output
fn parse_link_flags(out: &str) -> Vec<String> {
    let Some(start) = out.find('<') else {
        return Vec::new();
    };
    let Some(end) = out[start..].find('>') else {
        return Vec::new();
    };
    out[start + 1..start + end]
        .split(',')
        .map(|s| s.trim().to_string())
        .collect()
}

/// Extract inet/inet6 addresses from `ip -o addr show` output
fn parse_addr_show(out: &str) -> Vec<Cidr> {
    let mut addrs = Vec::new();
    for line in out.lines() {
        let mut words = line.split_whitespace();
        while let Some(word) = words.next() {
            if word == "inet" || word == "inet6" {
                if let Some(cidr) = words.next().and_then(|s| s.parse().ok()) {
                    addrs.push(cidr);
                }
                break;
            }
        }
    }
    addrs
}

/// L2TP kernel modules required for Ethernet pseudowires
pub const REQUIRED_MODULES: &[&str] = &["l2tp_core", "l2tp_netlink", "l2tp_eth"];

/// Load the L2TP kernel modules and verify they are present
pub fn ensure_modules() -> Result<(), KernelError> {
    for module in REQUIRED_MODULES {
        let cmd = format!("modprobe {module}");
        let output = Command::new("modprobe")
            .arg(module)
            .output()
            .map_err(|source| KernelError::Spawn {
                cmd: cmd.clone(),
                source,
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(classify(cmd, stderr));
        }
        debug!(module, "kernel module loaded");
    }

    let output = Command::new("lsmod")
        .output()
        .map_err(|source| KernelError::Spawn {
            cmd: "lsmod".into(),
            source,
        })?;
    let listed = String::from_utf8_lossy(&output.stdout);
    if !listed.lines().any(|l| l.starts_with("l2tp_eth")) {
        return Err(KernelError::CommandFailed {
            cmd: "lsmod".into(),
            stderr: "l2tp_eth not present after modprobe".into(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tunnel_show() {
        let out = "\
Tunnel 1000, encap IP
  From 192.0.2.1 to 198.51.100.1
  Peer tunnel 2000
Tunnel 1100, encap UDP
  From 192.0.2.1 to 203.0.113.9
  Peer tunnel 2100
  UDP source / dest ports: 1701/1701
";
        let tunnels = parse_tunnel_show(out);
        assert_eq!(tunnels.len(), 2);
        assert_eq!(tunnels[0].tunnel_id, 1000);
        assert_eq!(tunnels[0].peer_tunnel_id, Some(2000));
        assert_eq!(tunnels[0].local_ip, Some("192.0.2.1".parse().unwrap()));
        assert_eq!(tunnels[0].remote_ip, Some("198.51.100.1".parse().unwrap()));
        assert_eq!(tunnels[1].tunnel_id, 1100);
        assert_eq!(tunnels[1].peer_tunnel_id, Some(2100));
    }

    #[test]
    fn test_parse_tunnel_show_empty() {
        assert!(parse_tunnel_show("").is_empty());
    }

    #[test]
    fn test_parse_session_show() {
        let out = "\
Session 10 in tunnel 1000
  Peer session 20, tunnel 2000
  interface name: l2tpeth0
Session 11 in tunnel 1100
  Peer session 21, tunnel 2100
  interface name: l2tpeth1
";
        let sessions = parse_session_show(out);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].tunnel_id, 1000);
        assert_eq!(sessions[0].session_id, 10);
        assert_eq!(sessions[0].peer_session_id, Some(20));
        assert_eq!(sessions[0].interface.as_deref(), Some("l2tpeth0"));
        assert_eq!(sessions[1].session_id, 11);
        assert_eq!(sessions[1].interface.as_deref(), Some("l2tpeth1"));
    }

    #[test]
    fn test_parse_link_flags() {
        let out = "2: l2tpeth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1488 ...";
        let flags = parse_link_flags(out);
        assert!(flags.iter().any(|f| f == "UP"));

        let down = "2: l2tpeth0: <BROADCAST,MULTICAST> mtu 1488 ...";
        assert!(!parse_link_flags(down).iter().any(|f| f == "UP"));
    }

    #[test]
    fn test_parse_addr_show() {
        let out = "\
2: l2tpeth0    inet 10.30.30.1/30 scope global l2tpeth0\\       valid_lft forever preferred_lft forever
2: l2tpeth0    inet6 fe80::1/64 scope link \\       valid_lft forever preferred_lft forever
";
        let addrs = parse_addr_show(out);
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0], "10.30.30.1/30".parse().unwrap());
    }

    #[test]
    fn test_classify_errors() {
        assert!(matches!(
            classify("ip".into(), "RTNETLINK answers: File exists".into()),
            KernelError::AlreadyExists { .. }
        ));
        assert!(matches!(
            classify("ip".into(), "RTNETLINK answers: Operation not permitted".into()),
            KernelError::PermissionDenied { .. }
        ));
        assert!(matches!(
            classify("ip".into(), "RTNETLINK answers: No such protocol".into()),
            KernelError::ModuleNotLoaded { .. }
        ));
        assert!(matches!(
            classify("ip".into(), "something else".into()),
            KernelError::CommandFailed { .. }
        ));
    }
}
