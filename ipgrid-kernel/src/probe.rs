//! Discovery collaborator for IPGrid scans.
//!
//! The reconciler only sees the `HostProbe` trait: a bounded-time ping
//! sweep returning the set of responding addresses plus whatever metadata
//! the scanner could collect. `NmapProbe` shells out to `nmap -sn` and
//! parses its human-readable report. Any failure (spawn, timeout, non-zero
//! exit) is surfaced as an error so the reconciler can abstain from
//! writing anything.

use crate::models::{Observation, Subnet};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("scan timed out after {0}s")]
    Timeout(u64),
    #[error("failed to launch scanner: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("scanner failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait HostProbe: Send + Sync {
    /// Ping sweep over `subnet.start` .. `subnet.end` inclusive. Returns
    /// only the addresses that responded.
    async fn discover(
        &self,
        subnet: &Subnet,
        start: u8,
        end: u8,
    ) -> Result<Vec<Observation>, ProbeError>;
}

/// Probe backed by the system nmap binary (`-sn` host discovery, no port
/// scan). MAC address and vendor are only present when nmap runs with
/// enough privileges to ARP-scan the local segment.
pub struct NmapProbe {
    timeout_secs: u64,
}

impl NmapProbe {
    pub fn new(timeout_secs: u64) -> Self {
        Self { timeout_secs }
    }
}

#[async_trait]
impl HostProbe for NmapProbe {
    async fn discover(
        &self,
        subnet: &Subnet,
        start: u8,
        end: u8,
    ) -> Result<Vec<Observation>, ProbeError> {
        let range = format!("{}.{}-{}", subnet.as_str(), start, end);
        debug!("[probe] running nmap -sn on {}", range);

        let output = tokio::time::timeout(
            Duration::from_secs(self.timeout_secs),
            Command::new("nmap")
                .args(["-sn", "-T4", &range])
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await
        .map_err(|_| ProbeError::Timeout(self.timeout_secs))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::Failed(stderr.trim().to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_nmap_report(&stdout))
    }
}

/// Parse la sortie humaine de `nmap -sn`.
///
/// Forme attendue par hôte répondant :
/// ```text
/// Nmap scan report for gateway.lan (10.0.0.1)
/// Host is up (0.00042s latency).
/// MAC Address: AA:BB:CC:DD:EE:FF (Some Vendor)
/// ```
/// Sans résolution DNS la première ligne est "Nmap scan report for 10.0.0.1".
fn parse_nmap_report(output: &str) -> Vec<Observation> {
    let mut observations = Vec::new();
    let mut pending: Option<Observation> = None;
    let mut confirmed = false;

    for line in output.lines() {
        let line = line.trim();
        if let Some(target) = line.strip_prefix("Nmap scan report for ") {
            if confirmed {
                if let Some(obs) = pending.take() {
                    observations.push(obs);
                }
            }
            pending = Some(parse_report_target(target));
            confirmed = false;
        } else if line.starts_with("Host is up") {
            confirmed = true;
        } else if let Some(rest) = line.strip_prefix("MAC Address: ") {
            if let Some(obs) = pending.as_mut() {
                let (mac, vendor) = parse_mac_line(rest);
                obs.mac_address = Some(mac);
                obs.vendor = vendor;
            }
        }
    }
    if confirmed {
        if let Some(obs) = pending.take() {
            observations.push(obs);
        }
    }
    observations
}

/// "gateway.lan (10.0.0.1)" -> hostname + adresse ; "10.0.0.1" -> adresse seule.
fn parse_report_target(target: &str) -> Observation {
    if let Some((name, rest)) = target.split_once(" (") {
        let address = rest.trim_end_matches(')').to_string();
        Observation {
            address,
            hostname: Some(name.to_string()),
            mac_address: None,
            vendor: None,
        }
    } else {
        Observation {
            address: target.to_string(),
            hostname: None,
            mac_address: None,
            vendor: None,
        }
    }
}

/// "AA:BB:CC:DD:EE:FF (Some Vendor)" -> (mac, vendor). Le vendor "Unknown"
/// de nmap est rendu comme absent.
fn parse_mac_line(rest: &str) -> (String, Option<String>) {
    match rest.split_once(" (") {
        Some((mac, vendor)) => {
            let vendor = vendor.trim_end_matches(')');
            let vendor = if vendor.is_empty() || vendor == "Unknown" {
                None
            } else {
                Some(vendor.to_string())
            };
            (mac.to_string(), vendor)
        }
        None => (rest.to_string(), None),
    }
}
