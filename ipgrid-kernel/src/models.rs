use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// Statut persistant d'un hôte connu. Jamais `unknown` : une adresse sans
/// enregistrement est affichée `unknown` côté API, mais n'existe pas ici.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Up,
    Down,
    PreviouslyUsed,
    Reserved,
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostStatus::Up => "up",
            HostStatus::Down => "down",
            HostStatus::PreviouslyUsed => "previously_used",
            HostStatus::Reserved => "reserved",
        };
        f.write_str(s)
    }
}

/// Enregistrement d'un hôte : existe ssi l'adresse a répondu au moins une
/// fois, ou a été réservée explicitement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRecord {
    pub address: String,
    pub subnet: String,
    pub last_octet: u8,
    pub status: HostStatus,
    pub hostname: Option<String>,
    pub mac_address: Option<String>,
    pub vendor: Option<String>,
    /// Nombre d'observations `up`. Croît strictement, jamais remis à zéro.
    pub times_seen: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub first_seen: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    /// Dernière réconciliation ayant touché l'enregistrement (y compris down).
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_scanned: Option<OffsetDateTime>,
    pub is_reserved: bool,
    pub reserved_for: Option<String>,
    pub reserved_by: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub reserved_at: Option<OffsetDateTime>,
    pub notes: Option<String>,
}

/// Observation d'un scan : l'adresse a répondu, avec métadonnées optionnelles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub address: String,
    pub hostname: Option<String>,
    pub mac_address: Option<String>,
    pub vendor: Option<String>,
}

/// Entrée d'historique append-only, une par décision de réconciliation qui
/// change ou réaffirme le statut observé d'un hôte.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub address: String,
    pub status: HostStatus,
    pub hostname: Option<String>,
    pub mac_address: Option<String>,
    pub vendor: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

/// Résumé write-once d'une invocation du réconciliateur sur une plage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRecord {
    pub subnet: String,
    pub start_octet: u8,
    pub end_octet: u8,
    pub total: u32,
    pub up: u32,
    pub down: u32,
    pub previously_used: u32,
    pub reserved: u32,
    pub unknown: u32,
    pub duration_seconds: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
}

/// Statut de présentation d'une adresse dans un résultat de scan.
/// `Unknown` = aucun enregistrement pour cette adresse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Up,
    Down,
    PreviouslyUsed,
    Reserved,
    Unknown,
}

impl From<HostStatus> for ScanStatus {
    fn from(s: HostStatus) -> Self {
        match s {
            HostStatus::Up => ScanStatus::Up,
            HostStatus::Down => ScanStatus::Down,
            HostStatus::PreviouslyUsed => ScanStatus::PreviouslyUsed,
            HostStatus::Reserved => ScanStatus::Reserved,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("subnet must be three octets x.x.x: {0}")]
    BadSubnet(String),
    #[error("octet range {start}-{end} is invalid")]
    BadRange { start: u8, end: u8 },
    #[error("not an IPv4 address: {0}")]
    BadAddress(String),
}

/// Préfixe /24 validé ("10.0.0"). Les trois premiers octets uniquement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    prefix: String,
}

impl Subnet {
    pub fn as_str(&self) -> &str {
        &self.prefix
    }

    /// Adresse complète pour le dernier octet donné.
    pub fn address(&self, octet: u8) -> String {
        format!("{}.{}", self.prefix, octet)
    }

    /// Préfixe /24 d'une adresse complète ("10.0.0.7" -> "10.0.0").
    pub fn of_address(address: &str) -> Result<Subnet, RequestError> {
        let (prefix, last) = address
            .rsplit_once('.')
            .ok_or_else(|| RequestError::BadAddress(address.to_string()))?;
        last.parse::<u8>()
            .map_err(|_| RequestError::BadAddress(address.to_string()))?;
        prefix.parse()
    }
}

impl FromStr for Subnet {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.parse::<u8>().is_err()) {
            return Err(RequestError::BadSubnet(s.to_string()));
        }
        Ok(Subnet { prefix: s.to_string() })
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefix)
    }
}

/// Valide une plage de derniers octets avant tout effet de bord.
pub fn check_range(start: u8, end: u8) -> Result<(), RequestError> {
    if start > end {
        return Err(RequestError::BadRange { start, end });
    }
    Ok(())
}

/// Valide qu'une chaîne est bien une adresse IPv4 pointée.
pub fn check_address(address: &str) -> Result<(), RequestError> {
    address
        .parse::<std::net::Ipv4Addr>()
        .map(|_| ())
        .map_err(|_| RequestError::BadAddress(address.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subnet_parsing() {
        assert!("10.0.0".parse::<Subnet>().is_ok());
        assert!("192.168.1".parse::<Subnet>().is_ok());
        assert!("10.0".parse::<Subnet>().is_err());
        assert!("10.0.0.0".parse::<Subnet>().is_err());
        assert!("10.0.256".parse::<Subnet>().is_err());
        assert!("a.b.c".parse::<Subnet>().is_err());
    }

    #[test]
    fn test_subnet_address() {
        let subnet: Subnet = "10.0.0".parse().unwrap();
        assert_eq!(subnet.address(7), "10.0.0.7");
    }

    #[test]
    fn test_subnet_of_address() {
        let subnet = Subnet::of_address("192.168.1.42").unwrap();
        assert_eq!(subnet.as_str(), "192.168.1");
        assert!(Subnet::of_address("192.168.1").is_err());
        assert!(Subnet::of_address("not-an-ip").is_err());
    }

    #[test]
    fn test_range_validation() {
        assert!(check_range(0, 255).is_ok());
        assert!(check_range(10, 10).is_ok());
        assert!(check_range(20, 10).is_err());
    }

    #[test]
    fn test_address_validation() {
        assert!(check_address("10.0.0.1").is_ok());
        assert!(check_address("10.0.0").is_err());
        assert!(check_address("example.org").is_err());
    }
}
