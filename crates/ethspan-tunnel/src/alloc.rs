//! Identifier allocation
//!
//! Interface indices, tunnel IDs and session IDs all live in host-wide
//! namespaces. Definitions may arrive with some identifiers set explicitly;
//! the allocator fills in missing interface indices with the smallest free
//! value and flags any cross-definition collision so the reconciler skips
//! the affected tunnels without touching the kernel.
//!
//! Assigned indices are persisted back into the store immediately —
//! interface names must stay stable across runs.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{info, warn};

use crate::error::TunnelResult;
use ethspan_config::{ConfigStore, TunnelDefinition};

/// Outcome of an allocation pass
#[derive(Debug, Default)]
pub struct AllocationReport {
    /// Tunnels excluded from reconciliation, with the collision that
    /// disqualified them
    pub conflicts: BTreeMap<String, String>,
}

impl AllocationReport {
    /// Whether a tunnel was flagged as conflicting
    pub fn is_conflicted(&self, name: &str) -> bool {
        self.conflicts.contains_key(name)
    }
}

/// Fill in missing interface indices and detect identifier collisions.
///
/// Definitions flagged in the report keep whatever identifiers they had;
/// nothing is assigned to or persisted for them.
pub fn allocate(
    store: &ConfigStore,
    defs: &mut [TunnelDefinition],
) -> TunnelResult<AllocationReport> {
    let mut report = AllocationReport::default();

    flag_duplicates(defs, &mut report, "tunnel_id", |d| Some(d.tunnel_id as u64));
    flag_duplicates(defs, &mut report, "session_id", |d| {
        Some(d.session_id as u64)
    });
    flag_duplicates(defs, &mut report, "interface_index", |d| {
        d.interface_index.map(u64::from)
    });
    flag_duplicate_addrs(defs, &mut report);

    // Explicit indices stay reserved even on conflicted definitions, so a
    // later conflict fix does not force an interface rename.
    let mut used: BTreeSet<u32> = defs.iter().filter_map(|d| d.interface_index).collect();

    for def in defs.iter_mut() {
        if def.interface_index.is_some() || report.is_conflicted(&def.name) {
            continue;
        }
        let mut index = 0u32;
        while used.contains(&index) {
            index += 1;
        }
        used.insert(index);
        def.interface_index = Some(index);
        store.put(def)?;
        info!(tunnel = %def.name, index, "interface index assigned");
    }

    for (name, reason) in &report.conflicts {
        warn!(tunnel = %name, %reason, "skipping conflicted definition");
    }
    Ok(report)
}

fn flag_duplicates(
    defs: &[TunnelDefinition],
    report: &mut AllocationReport,
    what: &str,
    key: impl Fn(&TunnelDefinition) -> Option<u64>,
) {
    let mut by_value: BTreeMap<u64, Vec<&str>> = BTreeMap::new();
    for def in defs {
        if let Some(value) = key(def) {
            by_value.entry(value).or_default().push(&def.name);
        }
    }
    for (value, names) in by_value {
        if names.len() < 2 {
            continue;
        }
        for name in &names {
            let others: Vec<&str> = names.iter().filter(|n| *n != name).copied().collect();
            report.conflicts.entry(name.to_string()).or_insert_with(|| {
                format!("{what} {value} also used by '{}'", others.join("', '"))
            });
        }
    }
}

fn flag_duplicate_addrs(defs: &[TunnelDefinition], report: &mut AllocationReport) {
    let mut by_addr: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for def in defs {
        by_addr
            .entry(def.interface_cidr.addr.to_string())
            .or_default()
            .push(&def.name);
    }
    for (addr, names) in by_addr {
        if names.len() < 2 {
            continue;
        }
        for name in &names {
            let others: Vec<&str> = names.iter().filter(|n| *n != name).copied().collect();
            report.conflicts.entry(name.to_string()).or_insert_with(|| {
                format!("interface address {addr} also used by '{}'", others.join("', '"))
            });
        }
    }
}
