//! Port forward supervision
//!
//! Every forwarded port of an active tunnel is relayed by one socat process,
//! run as its own systemd unit so it survives reboots and gets restarted on
//! failure independently of the reconciler. Units are named per
//! (tunnel, port) pair; the forward is a child resource of its tunnel and is
//! stopped before the tunnel interface goes away.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Command;

use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from forward process management
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The forward unit could not be started; retried on the next apply
    #[error("failed to start forward {tunnel}:{port}: {reason}")]
    SpawnFailed {
        /// Owning tunnel
        tunnel: String,
        /// Forwarded port
        port: u16,
        /// systemctl output
        reason: String,
    },

    /// The forward unit could not be stopped
    #[error("failed to stop forward {tunnel}:{port}: {reason}")]
    StopFailed {
        /// Owning tunnel
        tunnel: String,
        /// Forwarded port
        port: u16,
        /// systemctl output
        reason: String,
    },

    /// Filesystem or process-spawn error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Process supervision seam: spawn/inspect/terminate one forward per
/// (tunnel, port) pair
pub trait ForwardSpawner {
    /// Start a relay from local `port` to `target:port`; must be idempotent
    /// when the forward is already running
    fn spawn(&self, tunnel: &str, port: u16, target: IpAddr) -> Result<(), ForwardError>;

    /// Whether the registered forward process is currently running
    fn is_alive(&self, tunnel: &str, port: u16) -> Result<bool, ForwardError>;

    /// Stop and deregister the forward; success if none is running
    fn terminate(&self, tunnel: &str, port: u16) -> Result<(), ForwardError>;

    /// Ports that currently have a registered forward for this tunnel
    fn registered(&self, tunnel: &str) -> Result<BTreeSet<u16>, ForwardError>;
}

/// Ensure exactly one live forward per desired port.
///
/// Symmetric-difference reconciliation: ports no longer desired are stopped,
/// newly desired ports are started, live unchanged forwards are not touched.
/// Spawn failures are collected rather than propagated — the owning tunnel
/// stays active and the next apply retries.
pub fn reconcile_ports(
    spawner: &dyn ForwardSpawner,
    tunnel: &str,
    desired: &BTreeSet<u16>,
    target: IpAddr,
) -> Result<Vec<(u16, ForwardError)>, ForwardError> {
    let current = spawner.registered(tunnel)?;
    let mut failures = Vec::new();

    for &port in current.difference(desired) {
        spawner.terminate(tunnel, port)?;
        info!(tunnel, port, "forward removed");
    }

    for &port in desired {
        let alive = spawner.is_alive(tunnel, port)?;
        if alive {
            continue;
        }
        match spawner.spawn(tunnel, port, target) {
            Ok(()) => info!(tunnel, port, %target, "forward running"),
            Err(e) => {
                warn!(tunnel, port, error = %e, "forward failed to start");
                failures.push((port, e));
            }
        }
    }

    Ok(failures)
}

/// Stop every forward registered for a tunnel. Called before interface
/// teardown so no relay outlives its tunnel.
pub fn stop_all(spawner: &dyn ForwardSpawner, tunnel: &str) -> Result<(), ForwardError> {
    for port in spawner.registered(tunnel)? {
        spawner.terminate(tunnel, port)?;
        info!(tunnel, port, "forward stopped");
    }
    Ok(())
}

const UNIT_PREFIX: &str = "ethspan-fwd-";

/// systemd-supervised socat relays, one unit per (tunnel, port)
pub struct SystemdSocat {
    unit_dir: PathBuf,
}

impl Default for SystemdSocat {
    fn default() -> Self {
        Self {
            unit_dir: PathBuf::from("/etc/systemd/system"),
        }
    }
}

impl SystemdSocat {
    /// Use an alternate unit directory (tests)
    pub fn with_unit_dir(unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            unit_dir: unit_dir.into(),
        }
    }

    fn unit_name(tunnel: &str, port: u16) -> String {
        format!("{UNIT_PREFIX}{tunnel}-{port}.service")
    }

    fn unit_path(&self, tunnel: &str, port: u16) -> PathBuf {
        self.unit_dir.join(Self::unit_name(tunnel, port))
    }

    fn unit_contents(tunnel: &str, port: u16, target: IpAddr) -> String {
        format!(
            "[Unit]\n\
             Description=ethspan forward {tunnel} port {port}\n\
             After=network.target\n\
             \n\
             [Service]\n\
             Type=simple\n\
             ExecStart=/usr/bin/socat TCP4-LISTEN:{port},reuseaddr,fork TCP4:{target}:{port}\n\
             Restart=always\n\
             RestartSec=5\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n"
        )
    }

    fn systemctl(args: &[&str]) -> Result<(bool, String), io::Error> {
        let output = Command::new("systemctl").args(args).output()?;
        let text = if output.stdout.is_empty() {
            String::from_utf8_lossy(&output.stderr).trim().to_string()
        } else {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        };
        Ok((output.status.success(), text))
    }

    fn daemon_reload() -> Result<(), io::Error> {
        let (ok, out) = Self::systemctl(&["daemon-reload"])?;
        if !ok {
            warn!(output = %out, "systemctl daemon-reload failed");
        }
        Ok(())
    }
}

impl ForwardSpawner for SystemdSocat {
    fn spawn(&self, tunnel: &str, port: u16, target: IpAddr) -> Result<(), ForwardError> {
        let path = self.unit_path(tunnel, port);
        fs::write(&path, Self::unit_contents(tunnel, port, target))?;
        Self::daemon_reload()?;

        let unit = Self::unit_name(tunnel, port);
        let (ok, out) = Self::systemctl(&["enable", "--now", &unit])?;
        if !ok {
            // Leave no half-registered unit behind.
            let _ = fs::remove_file(&path);
            return Err(ForwardError::SpawnFailed {
                tunnel: tunnel.to_string(),
                port,
                reason: out,
            });
        }
        debug!(unit, "forward unit enabled");
        Ok(())
    }

    fn is_alive(&self, tunnel: &str, port: u16) -> Result<bool, ForwardError> {
        if !self.unit_path(tunnel, port).exists() {
            return Ok(false);
        }
        let unit = Self::unit_name(tunnel, port);
        let (ok, _) = Self::systemctl(&["is-active", "--quiet", &unit])?;
        Ok(ok)
    }

    fn terminate(&self, tunnel: &str, port: u16) -> Result<(), ForwardError> {
        let unit = Self::unit_name(tunnel, port);
        let path = self.unit_path(tunnel, port);
        if !path.exists() {
            return Ok(());
        }

        let (stopped, out) = Self::systemctl(&["stop", &unit])?;
        if !stopped && !out.contains("not loaded") {
            return Err(ForwardError::StopFailed {
                tunnel: tunnel.to_string(),
                port,
                reason: out,
            });
        }
        let _ = Self::systemctl(&["disable", &unit])?;
        fs::remove_file(&path)?;
        Self::daemon_reload()?;
        debug!(unit, "forward unit removed");
        Ok(())
    }

    fn registered(&self, tunnel: &str) -> Result<BTreeSet<u16>, ForwardError> {
        let mut ports = BTreeSet::new();
        let prefix = format!("{UNIT_PREFIX}{tunnel}-");
        let entries = match fs::read_dir(&self.unit_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ports),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(rest) = name
                .strip_prefix(&prefix)
                .and_then(|r| r.strip_suffix(".service"))
            {
                if let Ok(port) = rest.parse() {
                    ports.insert(port);
                }
            }
        }
        Ok(ports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockSpawner;

    fn target() -> IpAddr {
        "10.30.30.2".parse().unwrap()
    }

    #[test]
    fn test_reconcile_starts_missing_and_stops_removed() {
        let spawner = MockSpawner::new();
        spawner.set_alive("t1", 80, true);
        spawner.set_alive("t1", 8080, true);

        let desired: BTreeSet<u16> = [80, 443].into_iter().collect();
        let failures = reconcile_ports(&spawner, "t1", &desired, target()).unwrap();
        assert!(failures.is_empty());

        assert!(spawner.is_alive("t1", 80).unwrap());
        assert!(spawner.is_alive("t1", 443).unwrap());
        assert!(!spawner.is_alive("t1", 8080).unwrap());
        // The unchanged port 80 forward must not have been restarted.
        assert!(!spawner.events().contains(&"spawn t1:80".to_string()));
        assert!(spawner.events().contains(&"spawn t1:443".to_string()));
        assert!(spawner.events().contains(&"terminate t1:8080".to_string()));
    }

    #[test]
    fn test_reconcile_restarts_dead_forward() {
        let spawner = MockSpawner::new();
        spawner.set_alive("t1", 443, true);
        spawner.mark_dead("t1", 443);

        let desired: BTreeSet<u16> = [443].into_iter().collect();
        reconcile_ports(&spawner, "t1", &desired, target()).unwrap();
        assert!(spawner.is_alive("t1", 443).unwrap());
        assert!(spawner.events().contains(&"spawn t1:443".to_string()));
    }

    #[test]
    fn test_spawn_failure_is_collected_not_fatal() {
        let spawner = MockSpawner::new();
        spawner.fail_spawn("t1", 443);

        let desired: BTreeSet<u16> = [80, 443].into_iter().collect();
        let failures = reconcile_ports(&spawner, "t1", &desired, target()).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, 443);
        // The other port still came up.
        assert!(spawner.is_alive("t1", 80).unwrap());
    }

    #[test]
    fn test_stop_all_is_idempotent() {
        let spawner = MockSpawner::new();
        spawner.set_alive("t1", 80, true);
        stop_all(&spawner, "t1").unwrap();
        assert!(spawner.registered("t1").unwrap().is_empty());
        // Nothing registered; second call is a no-op.
        stop_all(&spawner, "t1").unwrap();
    }

    #[test]
    fn test_tunnels_do_not_share_forwards() {
        let spawner = MockSpawner::new();
        spawner.set_alive("t1", 80, true);
        spawner.set_alive("t2", 80, true);
        stop_all(&spawner, "t1").unwrap();
        assert!(spawner.is_alive("t2", 80).unwrap());
    }

    #[test]
    fn test_systemd_unit_naming_and_registry() {
        let dir = tempfile::tempdir().unwrap();
        let socat = SystemdSocat::with_unit_dir(dir.path());
        std::fs::write(
            dir.path().join("ethspan-fwd-t1-443.service"),
            SystemdSocat::unit_contents("t1", 443, target()),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("ethspan-fwd-t1-80.service"),
            SystemdSocat::unit_contents("t1", 80, target()),
        )
        .unwrap();
        std::fs::write(dir.path().join("ethspan-fwd-other-22.service"), "").unwrap();
        std::fs::write(dir.path().join("unrelated.service"), "").unwrap();

        let ports = socat.registered("t1").unwrap();
        assert_eq!(ports, [80, 443].into_iter().collect());
    }

    #[test]
    fn test_unit_contents_relay_target() {
        let unit = SystemdSocat::unit_contents("t1", 443, target());
        assert!(unit.contains("TCP4-LISTEN:443,reuseaddr,fork"));
        assert!(unit.contains("TCP4:10.30.30.2:443"));
        assert!(unit.contains("Restart=always"));
    }
}
