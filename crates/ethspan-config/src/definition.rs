//! Tunnel definition data model
//!
//! A `TunnelDefinition` is the declared state of one L2TPv3 Ethernet tunnel:
//! the encapsulating endpoints, the local/peer tunnel and session IDs, the
//! address of the Ethernet-over-L2TP interface, and the set of forwarded TCP
//! ports. Definitions are authored independently on each host; the IDs must
//! follow the swap convention (`tunnel_id` here equals `peer_tunnel_id` on
//! the far side, and vice versa) for the tunnel to establish. That agreement
//! cannot be verified locally — only local uniqueness is enforced.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::ConfigError;

/// An interface address in CIDR notation (`10.30.30.1/30`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cidr {
    /// Host address assigned to the interface
    pub addr: IpAddr,
    /// Prefix length
    pub prefix: u8,
}

impl FromStr for Cidr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| ConfigError::InvalidCidr(s.to_string()))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| ConfigError::InvalidCidr(s.to_string()))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| ConfigError::InvalidCidr(s.to_string()))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(ConfigError::InvalidCidr(s.to_string()));
        }
        Ok(Self { addr, prefix })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl TryFrom<String> for Cidr {
    type Error = ConfigError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Cidr> for String {
    fn from(c: Cidr) -> String {
        c.to_string()
    }
}

/// Declared configuration for a single L2TPv3 tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelDefinition {
    /// Unique tunnel name, immutable once created
    pub name: String,

    /// Whether the tunnel should be up; `apply` tears down disabled tunnels
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Local endpoint of the encapsulating IP transport
    #[serde(default)]
    pub local_ip: Option<IpAddr>,

    /// Remote endpoint of the encapsulating IP transport
    #[serde(default)]
    pub remote_ip: Option<IpAddr>,

    /// Address/prefix assigned to the local l2tpeth interface
    pub interface_cidr: Cidr,

    /// Far-side address that forwarded connections are relayed to
    pub remote_forward_ip: IpAddr,

    /// Local tunnel ID (must equal the peer's `peer_tunnel_id`)
    pub tunnel_id: u32,
    /// Tunnel ID the peer uses for this tunnel
    pub peer_tunnel_id: u32,
    /// Local session ID (must equal the peer's `peer_session_id`)
    pub session_id: u32,
    /// Session ID the peer uses for this session
    pub peer_session_id: u32,

    /// Disambiguator mapped to the kernel interface name (`l2tpeth<n>`);
    /// assigned once by the allocator and kept stable across runs
    #[serde(default)]
    pub interface_index: Option<u32>,

    /// TCP ports forwarded over this tunnel, each one an independent relay
    #[serde(default)]
    pub forwarded_ports: BTreeSet<u16>,
}

fn default_enabled() -> bool {
    true
}

impl TunnelDefinition {
    /// Create a definition with defaults derived from the interface index,
    /// spacing IDs out so independently created tunnels do not collide.
    pub fn new(name: &str, interface_index: u32) -> Result<Self, ConfigError> {
        validate_name(name)?;
        let base_tunnel_id = 1000 + interface_index * 100;
        // Each index gets its own /30 so default addresses never collide.
        let octet = (30 + interface_index % 200) as u8;
        Ok(Self {
            name: name.to_string(),
            enabled: true,
            local_ip: None,
            remote_ip: None,
            interface_cidr: Cidr {
                addr: IpAddr::from([10, 30, octet, 1]),
                prefix: 30,
            },
            remote_forward_ip: IpAddr::from([10, 30, octet, 2]),
            tunnel_id: base_tunnel_id,
            peer_tunnel_id: base_tunnel_id + 1000,
            session_id: 10 + interface_index,
            peer_session_id: 20 + interface_index,
            interface_index: Some(interface_index),
            forwarded_ports: BTreeSet::new(),
        })
    }

    /// Kernel interface name for this tunnel, if an index has been assigned
    pub fn interface_name(&self) -> Option<String> {
        self.interface_index.map(|i| format!("l2tpeth{i}"))
    }

    /// Both encapsulation endpoints are set
    pub fn is_configured(&self) -> bool {
        self.local_ip.is_some() && self.remote_ip.is_some()
    }

    /// Check structural validity (name charset, ID sanity)
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_name(&self.name)?;
        Ok(())
    }
}

/// Names become part of file paths, systemd unit names and log lines,
/// so restrict them to a safe charset.
pub fn validate_name(name: &str) -> Result<(), ConfigError> {
    let ok = !name.is_empty()
        && name.len() <= 32
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_parse_roundtrip() {
        let c: Cidr = "10.30.30.1/30".parse().unwrap();
        assert_eq!(c.addr, IpAddr::from([10, 30, 30, 1]));
        assert_eq!(c.prefix, 30);
        assert_eq!(c.to_string(), "10.30.30.1/30");
    }

    #[test]
    fn test_cidr_rejects_garbage() {
        assert!("10.30.30.1".parse::<Cidr>().is_err());
        assert!("10.30.30.1/33".parse::<Cidr>().is_err());
        assert!("not-an-ip/24".parse::<Cidr>().is_err());
    }

    #[test]
    fn test_new_derives_ids_from_index() {
        let t0 = TunnelDefinition::new("alpha", 0).unwrap();
        let t2 = TunnelDefinition::new("gamma", 2).unwrap();
        assert_eq!(t0.tunnel_id, 1000);
        assert_eq!(t0.peer_tunnel_id, 2000);
        assert_eq!(t0.session_id, 10);
        assert_eq!(t2.tunnel_id, 1200);
        assert_eq!(t2.peer_tunnel_id, 2200);
        assert_eq!(t2.session_id, 12);
        assert_eq!(t2.peer_session_id, 22);
        assert_eq!(t2.interface_name().unwrap(), "l2tpeth2");
        // Defaults must not collide across indices.
        assert_ne!(t0.interface_cidr, t2.interface_cidr);
        assert_eq!(t2.interface_cidr.to_string(), "10.30.32.1/30");
        assert_eq!(t2.remote_forward_ip.to_string(), "10.30.32.2");
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("site-a_1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("../escape").is_err());
    }

    #[test]
    fn test_yaml_defaults_for_missing_keys() {
        // Files written by older versions may lack newer keys.
        let yaml = r#"
name: legacy
interface_cidr: 10.40.40.1/30
remote_forward_ip: 10.40.40.2
tunnel_id: 1000
peer_tunnel_id: 2000
session_id: 10
peer_session_id: 20
"#;
        let def: TunnelDefinition = serde_yaml::from_str(yaml).unwrap();
        assert!(def.enabled);
        assert!(def.local_ip.is_none());
        assert!(def.interface_index.is_none());
        assert!(def.forwarded_ports.is_empty());
        assert!(!def.is_configured());
    }
}
