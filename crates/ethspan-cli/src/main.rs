//! ethspan — declarative L2TPv3 Ethernet tunnels with supervised TCP forwards

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ethspan_config::{Cidr, ConfigStore, TunnelDefinition};
use ethspan_tunnel::{kernel, Iproute2, Reconciler, SystemdSocat, TunnelReport, TunnelStatus};

mod menu;

/// ethspan — L2TPv3 Ethernet tunnel manager
#[derive(Parser)]
#[command(name = "ethspan")]
#[command(version)]
#[command(about = "Manage L2TPv3 Ethernet tunnels and TCP port forwards", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Tunnel definition directory (default: /etc/ethspan/tunnels)
    #[arg(long, global = true, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Converge every tunnel to its declared state (boot entry point)
    Apply,

    /// Bring one tunnel up and mark it enabled
    Up {
        /// Tunnel name
        name: String,
    },

    /// Tear one tunnel down and mark it disabled
    Down {
        /// Tunnel name
        name: String,
    },

    /// Show tunnel status
    Status {
        /// Tunnel name (all tunnels if omitted)
        name: Option<String>,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// List configured tunnel names
    List,

    /// Create a new tunnel definition
    Add {
        /// Tunnel name
        name: String,

        /// Local endpoint of the encapsulating transport
        #[arg(long)]
        local_ip: Option<IpAddr>,

        /// Remote endpoint of the encapsulating transport
        #[arg(long)]
        remote_ip: Option<IpAddr>,

        /// Address/prefix for the tunnel interface
        #[arg(long)]
        interface_cidr: Option<Cidr>,

        /// Far-side address that forwards relay to
        #[arg(long)]
        remote_forward_ip: Option<IpAddr>,

        /// Local tunnel ID (peer must configure it as peer_tunnel_id)
        #[arg(long)]
        tunnel_id: Option<u32>,

        /// Peer's tunnel ID
        #[arg(long)]
        peer_tunnel_id: Option<u32>,

        /// Local session ID
        #[arg(long)]
        session_id: Option<u32>,

        /// Peer's session ID
        #[arg(long)]
        peer_session_id: Option<u32>,
    },

    /// Tear down and delete a tunnel definition
    Remove {
        /// Tunnel name
        name: String,
    },

    /// Manage forwarded ports
    Port {
        #[command(subcommand)]
        action: PortAction,
    },

    /// Load the required L2TP kernel modules
    Setup,
}

#[derive(Subcommand)]
enum PortAction {
    /// Add forwarded ports ("443" or "80,443")
    Add {
        /// Tunnel name
        name: String,
        /// Comma-separated TCP ports
        ports: String,
    },
    /// Remove forwarded ports
    Del {
        /// Tunnel name
        name: String,
        /// Comma-separated TCP ports
        ports: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let store = match &cli.config_dir {
        Some(dir) => ConfigStore::open(dir),
        None => ConfigStore::open_default(),
    };
    debug!(config_dir = %store.root().display(), "config store opened");
    let kernel = Iproute2;
    let spawner = SystemdSocat::default();
    let reconciler = Reconciler::new(&store, &kernel, &spawner);

    match cli.command {
        Some(Commands::Apply) => cmd_apply(&reconciler),
        Some(Commands::Up { name }) => cmd_up(&reconciler, &name),
        Some(Commands::Down { name }) => cmd_down(&reconciler, &name),
        Some(Commands::Status { name, json }) => cmd_status(&reconciler, name.as_deref(), json),
        Some(Commands::List) => cmd_list(&store),
        Some(Commands::Add {
            name,
            local_ip,
            remote_ip,
            interface_cidr,
            remote_forward_ip,
            tunnel_id,
            peer_tunnel_id,
            session_id,
            peer_session_id,
        }) => cmd_add(
            &store,
            &name,
            local_ip,
            remote_ip,
            interface_cidr,
            remote_forward_ip,
            tunnel_id,
            peer_tunnel_id,
            session_id,
            peer_session_id,
        ),
        Some(Commands::Remove { name }) => cmd_remove(&store, &reconciler, &name),
        Some(Commands::Port { action }) => match action {
            PortAction::Add { name, ports } => cmd_port(&store, &reconciler, &name, &ports, true),
            PortAction::Del { name, ports } => cmd_port(&store, &reconciler, &name, &ports, false),
        },
        Some(Commands::Setup) => cmd_setup(),
        None => menu::run(&store, &reconciler),
    }
}

/// Converge all tunnels; exit non-zero unless everything reached its
/// declared state and every forward is running.
fn cmd_apply(reconciler: &Reconciler<'_>) -> Result<()> {
    let report = reconciler.apply().context("apply failed")?;
    for tunnel in &report.tunnels {
        print_report(tunnel);
    }
    if report.tunnels.is_empty() {
        println!("No tunnels configured.");
    }
    if !report.success() {
        bail!("one or more tunnels failed to converge");
    }
    Ok(())
}

fn print_report(tunnel: &TunnelReport) {
    match (&tunnel.error, tunnel.state) {
        (Some(e), _) => println!("{}: FAILED — {e}", tunnel.name),
        (None, Some(state)) => println!("{}: {state}", tunnel.name),
        (None, None) => println!("{}: unknown", tunnel.name),
    }
    for (port, err) in &tunnel.forward_failures {
        println!("  forward {port}: FAILED — {err}");
    }
}

fn cmd_up(reconciler: &Reconciler<'_>, name: &str) -> Result<()> {
    let report = reconciler.start_one(name)?;
    print_report(&report);
    if !report.ok() {
        bail!("tunnel '{name}' did not fully converge");
    }
    Ok(())
}

fn cmd_down(reconciler: &Reconciler<'_>, name: &str) -> Result<()> {
    let report = reconciler.stop_one(name)?;
    print_report(&report);
    if !report.ok() {
        bail!("tunnel '{name}' did not fully tear down");
    }
    Ok(())
}

#[derive(serde::Serialize)]
struct StatusOutput<'a> {
    name: &'a str,
    state: String,
    enabled: bool,
    interface: Option<String>,
    interface_cidr: String,
    local_ip: Option<IpAddr>,
    remote_ip: Option<IpAddr>,
    tunnel_id: u32,
    session_id: u32,
    forwards: Vec<ForwardOutput>,
}

#[derive(serde::Serialize)]
struct ForwardOutput {
    port: u16,
    running: bool,
}

fn to_output(status: &TunnelStatus) -> StatusOutput<'_> {
    let def = &status.definition;
    StatusOutput {
        name: &def.name,
        state: status.state.to_string(),
        enabled: def.enabled,
        interface: def.interface_name(),
        interface_cidr: def.interface_cidr.to_string(),
        local_ip: def.local_ip,
        remote_ip: def.remote_ip,
        tunnel_id: def.tunnel_id,
        session_id: def.session_id,
        forwards: status
            .forwards
            .iter()
            .map(|&(port, running)| ForwardOutput { port, running })
            .collect(),
    }
}

fn cmd_status(reconciler: &Reconciler<'_>, name: Option<&str>, json: bool) -> Result<()> {
    let statuses = match name {
        Some(name) => vec![reconciler.status(name)?],
        None => reconciler.status_all()?,
    };

    if json {
        let out: Vec<StatusOutput<'_>> = statuses.iter().map(to_output).collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if statuses.is_empty() {
        println!("No tunnels configured.");
        return Ok(());
    }
    for status in &statuses {
        print_status(status);
    }
    Ok(())
}

fn print_status(status: &TunnelStatus) {
    let def = &status.definition;
    println!("tunnel: {}", def.name);
    println!("  state: {}", status.state);
    println!("  enabled: {}", def.enabled);
    match (def.local_ip, def.remote_ip) {
        (Some(local), Some(remote)) => println!("  transport: {local} -> {remote}"),
        _ => println!("  transport: not configured"),
    }
    if let Some(interface) = def.interface_name() {
        println!("  interface: {interface} ({})", def.interface_cidr);
    }
    println!(
        "  ids: tunnel {}/{} session {}/{}",
        def.tunnel_id, def.peer_tunnel_id, def.session_id, def.peer_session_id
    );
    if status.forwards.is_empty() {
        println!("  forwards: none");
    } else {
        for (port, running) in &status.forwards {
            let flag = if *running { "running" } else { "stopped" };
            println!("  forward {port} -> {}:{port} [{flag}]", def.remote_forward_ip);
        }
    }
    println!();
}

fn cmd_list(store: &ConfigStore) -> Result<()> {
    let names = store.list_names()?;
    if names.is_empty() {
        println!("No tunnels configured.");
    }
    for name in names {
        println!("{name}");
    }
    Ok(())
}

/// Smallest interface index not used by any stored definition
fn next_free_index(store: &ConfigStore) -> Result<u32> {
    let used: std::collections::BTreeSet<u32> = store
        .list()?
        .iter()
        .filter_map(|d| d.interface_index)
        .collect();
    let mut index = 0;
    while used.contains(&index) {
        index += 1;
    }
    Ok(index)
}

#[allow(clippy::too_many_arguments)]
fn cmd_add(
    store: &ConfigStore,
    name: &str,
    local_ip: Option<IpAddr>,
    remote_ip: Option<IpAddr>,
    interface_cidr: Option<Cidr>,
    remote_forward_ip: Option<IpAddr>,
    tunnel_id: Option<u32>,
    peer_tunnel_id: Option<u32>,
    session_id: Option<u32>,
    peer_session_id: Option<u32>,
) -> Result<()> {
    if store.exists(name) {
        bail!("tunnel '{name}' already exists");
    }
    let index = next_free_index(store)?;
    let mut def = TunnelDefinition::new(name, index)?;
    def.local_ip = local_ip;
    def.remote_ip = remote_ip;
    if let Some(cidr) = interface_cidr {
        def.interface_cidr = cidr;
    }
    if let Some(ip) = remote_forward_ip {
        def.remote_forward_ip = ip;
    }
    if let Some(id) = tunnel_id {
        def.tunnel_id = id;
    }
    if let Some(id) = peer_tunnel_id {
        def.peer_tunnel_id = id;
    }
    if let Some(id) = session_id {
        def.session_id = id;
    }
    if let Some(id) = peer_session_id {
        def.peer_session_id = id;
    }
    store.put(&def)?;

    println!("Created tunnel '{name}' (interface l2tpeth{index}).");
    println!(
        "Peer must mirror the IDs: tunnel_id={} peer_tunnel_id={} session_id={} peer_session_id={}",
        def.peer_tunnel_id, def.tunnel_id, def.peer_session_id, def.session_id
    );
    if !def.is_configured() {
        println!("Set endpoints with --local-ip/--remote-ip before bringing it up.");
    }
    Ok(())
}

fn cmd_remove(store: &ConfigStore, reconciler: &Reconciler<'_>, name: &str) -> Result<()> {
    // Tear down kernel state and forwards before dropping the definition.
    let report = reconciler.stop_one(name)?;
    if let Some(e) = &report.error {
        bail!("cannot remove '{name}': teardown failed: {e}");
    }
    store.delete(name)?;
    println!("Tunnel '{name}' removed.");
    Ok(())
}

/// Parse "80" or "80,443" into ports
fn parse_ports(spec: &str) -> Result<Vec<u16>> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u16>().with_context(|| format!("invalid port '{s}'")))
        .collect()
}

fn cmd_port(
    store: &ConfigStore,
    reconciler: &Reconciler<'_>,
    name: &str,
    ports: &str,
    add: bool,
) -> Result<()> {
    let ports = parse_ports(ports)?;
    if ports.is_empty() {
        bail!("no ports given");
    }
    let mut def = store.get(name)?;
    for &port in &ports {
        if add {
            def.forwarded_ports.insert(port);
        } else {
            def.forwarded_ports.remove(&port);
        }
    }
    store.put(&def)?;

    // Converge immediately so running forwards match the new set.
    if def.enabled {
        let report = reconciler.start_one(name)?;
        print_report(&report);
        if !report.ok() {
            bail!("forward reconciliation for '{name}' failed");
        }
    } else {
        println!(
            "Ports updated; tunnel '{name}' is disabled, forwards start on next `ethspan up`."
        );
    }
    Ok(())
}

fn cmd_setup() -> Result<()> {
    kernel::ensure_modules().context("failed to load L2TP kernel modules")?;
    println!("L2TP kernel modules loaded.");
    Ok(())
}
