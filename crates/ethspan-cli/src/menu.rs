//! Interactive menu shown when `ethspan` runs without a subcommand.
//!
//! Plain stdin prompts; every action goes through the same store and
//! reconciler paths as the subcommands.

use std::io::{self, BufRead, Write};
use std::net::IpAddr;

use anyhow::{Context, Result};

use ethspan_config::{ConfigStore, TunnelDefinition};
use ethspan_tunnel::{kernel, Reconciler};

pub fn run(store: &ConfigStore, reconciler: &Reconciler<'_>) -> Result<()> {
    loop {
        println!();
        println!("ethspan — L2TPv3 tunnel manager");
        println!("  [1] List tunnels");
        println!("  [2] Show tunnel status");
        println!("  [3] Create tunnel");
        println!("  [4] Configure endpoints");
        println!("  [5] Start tunnel");
        println!("  [6] Stop tunnel");
        println!("  [7] Manage forwarded ports");
        println!("  [8] Delete tunnel");
        println!("  [9] Apply all");
        println!("  [s] Load kernel modules");
        println!("  [0] Exit");

        let choice = prompt("Select option")?;
        let outcome = match choice.as_str() {
            "1" => list_tunnels(reconciler),
            "2" => show_status(store, reconciler),
            "3" => create_tunnel(store),
            "4" => configure_endpoints(store),
            "5" => start_tunnel(store, reconciler),
            "6" => stop_tunnel(store, reconciler),
            "7" => manage_ports(store, reconciler),
            "8" => delete_tunnel(store, reconciler),
            "9" => apply_all(reconciler),
            "s" => setup_modules(),
            "0" | "q" | "" => return Ok(()),
            other => {
                println!("Unknown option '{other}'");
                Ok(())
            }
        };
        // Keep the menu alive on failures; the error is already descriptive.
        if let Err(e) = outcome {
            println!("Error: {e:#}");
        }
    }
}

/// Read one trimmed line from stdin
fn prompt(label: &str) -> Result<String> {
    print!("{label}: ");
    io::stdout().flush()?;
    let mut line = String::new();
    let n = io::stdin().lock().read_line(&mut line)?;
    if n == 0 {
        // EOF behaves like choosing to exit.
        return Ok("0".to_string());
    }
    Ok(line.trim().to_string())
}

/// Prompt until the input parses as an IP address; empty keeps `current`.
fn prompt_ip(label: &str, current: Option<IpAddr>) -> Result<Option<IpAddr>> {
    loop {
        let shown = match current {
            Some(ip) => format!("{label} [{ip}]"),
            None => format!("{label} [unset]"),
        };
        let input = prompt(&shown)?;
        if input.is_empty() {
            return Ok(current);
        }
        match input.parse::<IpAddr>() {
            Ok(ip) => return Ok(Some(ip)),
            Err(_) => println!("Invalid IP address: {input}"),
        }
    }
}

/// Prompt for an existing tunnel name, listing the choices first
fn prompt_tunnel(store: &ConfigStore) -> Result<Option<String>> {
    let names = store.list_names()?;
    if names.is_empty() {
        println!("No tunnels configured.");
        return Ok(None);
    }
    println!("Tunnels: {}", names.join(", "));
    let name = prompt("Tunnel name")?;
    if name.is_empty() {
        return Ok(None);
    }
    if !names.iter().any(|n| n == &name) {
        println!("No tunnel named '{name}'");
        return Ok(None);
    }
    Ok(Some(name))
}

fn list_tunnels(reconciler: &Reconciler<'_>) -> Result<()> {
    let statuses = reconciler.status_all()?;
    if statuses.is_empty() {
        println!("No tunnels configured.");
        return Ok(());
    }
    for status in &statuses {
        let def = &status.definition;
        let enabled = if def.enabled { "enabled" } else { "disabled" };
        println!(
            "  {:<20} {:<22} {} forwards: {}",
            def.name,
            status.state.to_string(),
            enabled,
            def.forwarded_ports.len()
        );
    }
    Ok(())
}

fn show_status(store: &ConfigStore, reconciler: &Reconciler<'_>) -> Result<()> {
    let Some(name) = prompt_tunnel(store)? else {
        return Ok(());
    };
    let status = reconciler.status(&name)?;
    crate::print_status(&status);
    Ok(())
}

fn create_tunnel(store: &ConfigStore) -> Result<()> {
    let name = prompt("New tunnel name")?;
    if name.is_empty() {
        return Ok(());
    }
    if store.exists(&name) {
        println!("Tunnel '{name}' already exists.");
        return Ok(());
    }
    let index = crate::next_free_index(store)?;
    let mut def = TunnelDefinition::new(&name, index)?;
    def.local_ip = prompt_ip("Local endpoint IP", None)?;
    def.remote_ip = prompt_ip("Remote endpoint IP", None)?;
    store.put(&def)?;

    println!("Created tunnel '{name}' (interface l2tpeth{index}).");
    println!(
        "Peer must mirror the IDs: tunnel_id={} peer_tunnel_id={} session_id={} peer_session_id={}",
        def.peer_tunnel_id, def.tunnel_id, def.peer_session_id, def.session_id
    );
    if !def.is_configured() {
        println!("Endpoints incomplete; configure them before starting the tunnel.");
    }
    Ok(())
}

fn configure_endpoints(store: &ConfigStore) -> Result<()> {
    let Some(name) = prompt_tunnel(store)? else {
        return Ok(());
    };
    let mut def = store.get(&name)?;
    def.local_ip = prompt_ip("Local endpoint IP", def.local_ip)?;
    def.remote_ip = prompt_ip("Remote endpoint IP", def.remote_ip)?;
    store.put(&def)?;
    println!("Saved. Restart the tunnel for endpoint changes to take effect.");
    Ok(())
}

fn start_tunnel(store: &ConfigStore, reconciler: &Reconciler<'_>) -> Result<()> {
    let Some(name) = prompt_tunnel(store)? else {
        return Ok(());
    };
    let report = reconciler.start_one(&name)?;
    crate::print_report(&report);
    Ok(())
}

fn stop_tunnel(store: &ConfigStore, reconciler: &Reconciler<'_>) -> Result<()> {
    let Some(name) = prompt_tunnel(store)? else {
        return Ok(());
    };
    let report = reconciler.stop_one(&name)?;
    crate::print_report(&report);
    Ok(())
}

fn manage_ports(store: &ConfigStore, reconciler: &Reconciler<'_>) -> Result<()> {
    let Some(name) = prompt_tunnel(store)? else {
        return Ok(());
    };
    let mut def = store.get(&name)?;
    if def.forwarded_ports.is_empty() {
        println!("No forwarded ports.");
    } else {
        let ports: Vec<String> = def.forwarded_ports.iter().map(|p| p.to_string()).collect();
        println!("Forwarded ports: {}", ports.join(", "));
    }

    let action = prompt("Action ([a]dd / [d]elete / enter to cancel)")?;
    let add = match action.as_str() {
        "a" | "add" => true,
        "d" | "del" | "delete" => false,
        _ => return Ok(()),
    };
    let spec = prompt("Ports (comma-separated)")?;
    let ports = crate::parse_ports(&spec)?;
    if ports.is_empty() {
        return Ok(());
    }
    for &port in &ports {
        if add {
            def.forwarded_ports.insert(port);
        } else {
            def.forwarded_ports.remove(&port);
        }
    }
    store.put(&def)?;

    if def.enabled {
        let report = reconciler.start_one(&name)?;
        crate::print_report(&report);
    } else {
        println!("Ports updated; forwards start when the tunnel is started.");
    }
    Ok(())
}

fn delete_tunnel(store: &ConfigStore, reconciler: &Reconciler<'_>) -> Result<()> {
    let Some(name) = prompt_tunnel(store)? else {
        return Ok(());
    };
    let confirm = prompt(&format!("Delete tunnel '{name}'? [y/N]"))?;
    if confirm != "y" && confirm != "yes" {
        println!("Cancelled.");
        return Ok(());
    }
    let report = reconciler.stop_one(&name)?;
    if let Some(e) = &report.error {
        println!("Teardown failed, definition kept: {e}");
        return Ok(());
    }
    store.delete(&name)?;
    println!("Tunnel '{name}' removed.");
    Ok(())
}

fn apply_all(reconciler: &Reconciler<'_>) -> Result<()> {
    let report = reconciler.apply()?;
    if report.tunnels.is_empty() {
        println!("No tunnels configured.");
    }
    for tunnel in &report.tunnels {
        crate::print_report(tunnel);
    }
    Ok(())
}

fn setup_modules() -> Result<()> {
    kernel::ensure_modules().context("failed to load L2TP kernel modules")?;
    println!("L2TP kernel modules loaded.");
    Ok(())
}
