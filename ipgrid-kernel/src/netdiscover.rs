//! Local network enumeration.
//!
//! Lists the /24 prefixes reachable from this machine's own interfaces so
//! an operator can pick a subnet to scan without typing it blind.
//! Loopback and non-IPv4 addresses are skipped; prefixes are deduplicated
//! and sorted.

use anyhow::{Context, Result};
use if_addrs::{get_if_addrs, IfAddr};
use serde::Serialize;
use tracing::debug;

/// Un /24 candidat vu depuis une interface locale.
#[derive(Debug, Clone, Serialize)]
pub struct LocalNetwork {
    pub interface: String,
    /// Préfixe /24 ("10.0.0").
    pub subnet: String,
    /// Adresse de cette machine sur ce réseau.
    pub local_address: String,
}

/// Énumère les /24 des interfaces IPv4 non-loopback de la machine.
pub fn discover_local_networks() -> Result<Vec<LocalNetwork>> {
    let if_addrs = get_if_addrs().context("failed to enumerate network interfaces")?;

    let mut networks = Vec::new();
    for if_addr in if_addrs {
        if if_addr.is_loopback() {
            continue;
        }
        let ip = match &if_addr.addr {
            IfAddr::V4(v4) => v4.ip,
            IfAddr::V6(_) => continue,
        };
        let octets = ip.octets();
        let subnet = format!("{}.{}.{}", octets[0], octets[1], octets[2]);
        debug!("[netdiscover] {} -> {}.0/24", if_addr.name, subnet);
        networks.push(LocalNetwork {
            interface: if_addr.name.clone(),
            subnet,
            local_address: ip.to_string(),
        });
    }

    networks.sort_by(|a, b| a.subnet.cmp(&b.subnet));
    networks.dedup_by(|a, b| a.subnet == b.subnet);
    Ok(networks)
}
