/**
 * SCAN RECONCILER - Fusion d'un instantané de scan dans l'inventaire
 *
 * RÔLE :
 * Ce module applique la machine à états de réconciliation : pour chaque
 * adresse d'une plage, la décision (créer / rafraîchir / basculer
 * previously_used / ne rien faire) est une fonction pure de
 * (enregistrement existant, observation). Les effets passent par le
 * HostStore, une adresse à la fois, chaque read-modify-write étant
 * atomique.
 *
 * RÈGLES (voir decide) :
 * - Aucun enregistrement n'est créé pour une adresse qui n'a jamais
 *   répondu : l'absence de donnée est distincte de `down`
 * - `previously_used` ne s'arme que sur un front up -> down réel
 * - Une réservation est prioritaire : aucun scan ne change son statut
 * - `times_seen` ne croît que sur observation `up`, jamais remis à zéro
 *
 * ÉCHEC DU PROBE :
 * Si la découverte échoue, la plage entière est rendue `unknown` et rien
 * n'est écrit : jamais d'application partielle.
 */

use crate::models::{
    check_range, HistoryEntry, HostRecord, HostStatus, Observation, RequestError, ScanRecord,
    ScanStatus, Subnet,
};
use crate::probe::HostProbe;
use crate::store::{HostStore, HostUpdate, StoreError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error(transparent)]
    InvalidRequest(#[from] RequestError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Ligne de résultat pour une adresse de la plage scannée.
#[derive(Debug, Clone, Serialize)]
pub struct ScanEntry {
    pub address: String,
    pub status: ScanStatus,
    pub record: Option<HostRecord>,
}

/// Vue d'ensemble d'une réconciliation, une ligne par adresse de la plage.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
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
    /// Renseigné quand la découverte a échoué (plage rendue unknown).
    pub error: Option<String>,
    pub entries: Vec<ScanEntry>,
}

/// Machine à états de réconciliation, pure et sans I/O.
///
/// `observed` est Some si l'adresse a répondu au scan. Retourne la mise à
/// jour à committer pour cette adresse (éventuellement aucune).
pub fn decide(
    existing: Option<&HostRecord>,
    subnet: &Subnet,
    octet: u8,
    observed: Option<&Observation>,
    now: OffsetDateTime,
) -> HostUpdate {
    match (existing, observed) {
        // Jamais vue et ne répond pas : pas d'enregistrement, pas d'historique
        (None, None) => HostUpdate::none(),

        // Première réponse : création
        (None, Some(obs)) => {
            let record = HostRecord {
                address: subnet.address(octet),
                subnet: subnet.as_str().to_string(),
                last_octet: octet,
                status: HostStatus::Up,
                hostname: obs.hostname.clone(),
                mac_address: obs.mac_address.clone(),
                vendor: obs.vendor.clone(),
                times_seen: 1,
                first_seen: Some(now),
                last_seen: Some(now),
                last_scanned: Some(now),
                is_reserved: false,
                reserved_for: None,
                reserved_by: None,
                reserved_at: None,
                notes: None,
            };
            let history = history_entry(&record, now);
            HostUpdate { record: Some(record), history: Some(history) }
        }

        // Réservation prioritaire : seul last_scanned avance, quel que soit
        // le résultat du scan
        (Some(rec), _) if rec.status == HostStatus::Reserved => {
            let mut record = rec.clone();
            record.last_scanned = Some(now);
            HostUpdate { record: Some(record), history: None }
        }

        // De nouveau (ou toujours) en ligne : rafraîchissement complet
        (Some(rec), Some(obs)) => {
            let mut record = rec.clone();
            record.status = HostStatus::Up;
            record.hostname = obs.hostname.clone();
            record.mac_address = obs.mac_address.clone();
            record.vendor = obs.vendor.clone();
            record.times_seen += 1;
            record.first_seen = record.first_seen.or(Some(now));
            record.last_seen = Some(now);
            record.last_scanned = Some(now);
            let history = history_entry(&record, now);
            HostUpdate { record: Some(record), history: Some(history) }
        }

        // Front up -> down réel : l'hôte a été confirmé en ligne avant.
        // Le garde sur status == up évite d'armer previously_used pour un
        // hôte qui n'a jamais répondu. Métadonnées et times_seen intacts,
        // pas d'historique pour la transition down.
        (Some(rec), None) if rec.status == HostStatus::Up => {
            let mut record = rec.clone();
            record.status = HostStatus::PreviouslyUsed;
            record.last_scanned = Some(now);
            HostUpdate { record: Some(record), history: None }
        }

        // Déjà down ou previously_used : le statut reste tel quel pour ne
        // pas écraser la distinction previously_used au scan suivant
        (Some(rec), None) => {
            let mut record = rec.clone();
            record.last_scanned = Some(now);
            HostUpdate { record: Some(record), history: None }
        }
    }
}

fn history_entry(record: &HostRecord, now: OffsetDateTime) -> HistoryEntry {
    HistoryEntry {
        address: record.address.clone(),
        status: record.status,
        hostname: record.hostname.clone(),
        mac_address: record.mac_address.clone(),
        vendor: record.vendor.clone(),
        recorded_at: now,
    }
}

/// Applique la réconciliation d'une plage complète via le probe et le store.
pub struct Scanner {
    store: Arc<dyn HostStore>,
    probe: Arc<dyn HostProbe>,
}

impl Scanner {
    pub fn new(store: Arc<dyn HostStore>, probe: Arc<dyn HostProbe>) -> Self {
        Self { store, probe }
    }

    pub async fn scan(&self, subnet: &Subnet, start: u8, end: u8) -> Result<ScanReport, ScanError> {
        check_range(start, end)?;
        let began = Instant::now();

        let observations = match self.probe.discover(subnet, start, end).await {
            Ok(list) => list,
            Err(e) => {
                // Pas d'application partielle : plage entière unknown, zéro écriture
                warn!("[scan] discovery failed for {}.{}-{}: {}", subnet, start, end, e);
                return Ok(unknown_report(subnet, start, end, began, e.to_string()));
            }
        };
        info!(
            "[scan] {} responding hosts in {}.{}-{}",
            observations.len(),
            subnet,
            start,
            end
        );

        let by_address: HashMap<String, Observation> = observations
            .into_iter()
            .map(|obs| (obs.address.clone(), obs))
            .collect();

        let now = OffsetDateTime::now_utc();
        let mut entries = Vec::with_capacity((end - start) as usize + 1);
        for octet in start..=end {
            let address = subnet.address(octet);
            let observed = by_address.get(&address);
            let record = self
                .store
                .update(&address, &mut |existing| decide(existing, subnet, octet, observed, now))?;
            let status = record
                .as_ref()
                .map(|r| ScanStatus::from(r.status))
                .unwrap_or(ScanStatus::Unknown);
            entries.push(ScanEntry { address, status, record });
        }

        let mut report = tally(subnet, start, end, entries);
        report.duration_seconds = began.elapsed().as_secs_f64();

        self.store.append_scan(ScanRecord {
            subnet: report.subnet.clone(),
            start_octet: start,
            end_octet: end,
            total: report.total,
            up: report.up,
            down: report.down,
            previously_used: report.previously_used,
            reserved: report.reserved,
            unknown: report.unknown,
            duration_seconds: report.duration_seconds,
            finished_at: now,
        })?;

        Ok(report)
    }
}

fn tally(subnet: &Subnet, start: u8, end: u8, entries: Vec<ScanEntry>) -> ScanReport {
    let mut report = ScanReport {
        subnet: subnet.as_str().to_string(),
        start_octet: start,
        end_octet: end,
        total: entries.len() as u32,
        up: 0,
        down: 0,
        previously_used: 0,
        reserved: 0,
        unknown: 0,
        duration_seconds: 0.0,
        error: None,
        entries,
    };
    for entry in &report.entries {
        match entry.status {
            ScanStatus::Up => report.up += 1,
            ScanStatus::Down => report.down += 1,
            ScanStatus::PreviouslyUsed => report.previously_used += 1,
            ScanStatus::Reserved => report.reserved += 1,
            ScanStatus::Unknown => report.unknown += 1,
        }
    }
    report
}

fn unknown_report(
    subnet: &Subnet,
    start: u8,
    end: u8,
    began: Instant,
    error: String,
) -> ScanReport {
    let entries: Vec<ScanEntry> = (start..=end)
        .map(|octet| ScanEntry {
            address: subnet.address(octet),
            status: ScanStatus::Unknown,
            record: None,
        })
        .collect();
    let mut report = tally(subnet, start, end, entries);
    report.duration_seconds = began.elapsed().as_secs_f64();
    report.error = Some(error);
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeError;
    use crate::store::FileStore;
    use async_trait::async_trait;

    fn subnet() -> Subnet {
        "10.0.0".parse().unwrap()
    }

    fn observation(address: &str) -> Observation {
        Observation {
            address: address.to_string(),
            hostname: Some("vm-1".to_string()),
            mac_address: Some("AA:BB:CC:DD:EE:02".to_string()),
            vendor: Some("Acme".to_string()),
        }
    }

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    // ---- decide() : la table de transition, sans I/O ----

    #[test]
    fn test_decide_creates_record_on_first_up() {
        let update = decide(None, &subnet(), 2, Some(&observation("10.0.0.2")), now());
        let record = update.record.unwrap();
        assert_eq!(record.status, HostStatus::Up);
        assert_eq!(record.times_seen, 1);
        assert_eq!(record.subnet, "10.0.0");
        assert_eq!(record.last_octet, 2);
        assert_eq!(record.first_seen, record.last_seen);
        assert_eq!(record.hostname.as_deref(), Some("vm-1"));
        assert!(update.history.is_some());
    }

    #[test]
    fn test_decide_ignores_silent_unknown_address() {
        let update = decide(None, &subnet(), 2, None, now());
        assert!(update.record.is_none());
        assert!(update.history.is_none());
    }

    #[test]
    fn test_decide_refreshes_existing_on_up() {
        let first = decide(None, &subnet(), 2, Some(&observation("10.0.0.2")), now())
            .record
            .unwrap();
        let update = decide(Some(&first), &subnet(), 2, Some(&observation("10.0.0.2")), now());
        let record = update.record.unwrap();
        assert_eq!(record.status, HostStatus::Up);
        assert_eq!(record.times_seen, 2);
        assert_eq!(record.first_seen, first.first_seen);
        assert!(update.history.is_some());
    }

    #[test]
    fn test_decide_up_to_down_becomes_previously_used() {
        let up = decide(None, &subnet(), 2, Some(&observation("10.0.0.2")), now())
            .record
            .unwrap();
        let update = decide(Some(&up), &subnet(), 2, None, now());
        let record = update.record.unwrap();
        assert_eq!(record.status, HostStatus::PreviouslyUsed);
        // métadonnées et compteur intacts, pas d'historique pour le down
        assert_eq!(record.times_seen, 1);
        assert_eq!(record.hostname.as_deref(), Some("vm-1"));
        assert!(update.history.is_none());
    }

    #[test]
    fn test_decide_previously_used_stays_on_repeated_down() {
        let mut record = decide(None, &subnet(), 2, Some(&observation("10.0.0.2")), now())
            .record
            .unwrap();
        record.status = HostStatus::PreviouslyUsed;
        let update = decide(Some(&record), &subnet(), 2, None, now());
        assert_eq!(update.record.unwrap().status, HostStatus::PreviouslyUsed);
    }

    #[test]
    fn test_decide_reserved_is_sticky() {
        let mut record = decide(None, &subnet(), 2, Some(&observation("10.0.0.2")), now())
            .record
            .unwrap();
        record.status = HostStatus::Reserved;
        record.is_reserved = true;

        // ni up ni down ne changent le statut
        let on_up = decide(Some(&record), &subnet(), 2, Some(&observation("10.0.0.2")), now());
        assert_eq!(on_up.record.as_ref().unwrap().status, HostStatus::Reserved);
        assert_eq!(on_up.record.as_ref().unwrap().times_seen, 1);
        assert!(on_up.history.is_none());

        let on_down = decide(Some(&record), &subnet(), 2, None, now());
        assert_eq!(on_down.record.as_ref().unwrap().status, HostStatus::Reserved);
        assert!(on_down.history.is_none());
    }

    #[test]
    fn test_decide_times_seen_only_grows_on_up() {
        let mut record = decide(None, &subnet(), 2, Some(&observation("10.0.0.2")), now())
            .record
            .unwrap();
        for _ in 0..3 {
            record = decide(Some(&record), &subnet(), 2, None, now()).record.unwrap();
        }
        assert_eq!(record.times_seen, 1);
        record = decide(Some(&record), &subnet(), 2, Some(&observation("10.0.0.2")), now())
            .record
            .unwrap();
        assert_eq!(record.times_seen, 2);
    }

    // ---- Scanner : plage complète contre un store fichier ----

    struct StubProbe {
        up: Vec<Observation>,
    }

    #[async_trait]
    impl HostProbe for StubProbe {
        async fn discover(
            &self,
            _subnet: &Subnet,
            _start: u8,
            _end: u8,
        ) -> Result<Vec<Observation>, ProbeError> {
            Ok(self.up.clone())
        }
    }

    struct FailProbe;

    #[async_trait]
    impl HostProbe for FailProbe {
        async fn discover(
            &self,
            _subnet: &Subnet,
            _start: u8,
            _end: u8,
        ) -> Result<Vec<Observation>, ProbeError> {
            Err(ProbeError::Failed("network unreachable".to_string()))
        }
    }

    fn file_store(dir: &tempfile::TempDir) -> Arc<FileStore> {
        Arc::new(FileStore::new(dir.path().join("hosts.json")).unwrap())
    }

    #[tokio::test]
    async fn test_scan_single_responder_in_range() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        let probe = Arc::new(StubProbe { up: vec![observation("10.0.0.2")] });
        let scanner = Scanner::new(store.clone(), probe);

        let report = scanner.scan(&subnet(), 1, 3).await.unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.up, 1);
        assert_eq!(report.unknown, 2);
        assert_eq!(report.entries[0].status, ScanStatus::Unknown);
        assert_eq!(report.entries[1].status, ScanStatus::Up);
        assert_eq!(report.entries[2].status, ScanStatus::Unknown);

        // seul .2 a un enregistrement
        assert_eq!(store.host_count(), 1);
        let record = store.get("10.0.0.2").unwrap().unwrap();
        assert_eq!(record.times_seen, 1);
        assert_eq!(store.scan_count(), 1);
    }

    #[tokio::test]
    async fn test_rescan_empty_flips_to_previously_used() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        let scanner =
            Scanner::new(store.clone(), Arc::new(StubProbe { up: vec![observation("10.0.0.2")] }));
        scanner.scan(&subnet(), 1, 3).await.unwrap();

        let rescan = Scanner::new(store.clone(), Arc::new(StubProbe { up: vec![] }));
        let report = rescan.scan(&subnet(), 1, 3).await.unwrap();
        assert_eq!(report.previously_used, 1);
        assert_eq!(report.unknown, 2);

        let record = store.get("10.0.0.2").unwrap().unwrap();
        assert_eq!(record.status, HostStatus::PreviouslyUsed);
        assert_eq!(record.times_seen, 1);
        // le .1 et le .3 n'existent toujours pas
        assert!(store.get("10.0.0.1").unwrap().is_none());
        assert!(store.get("10.0.0.3").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rescan_identical_is_status_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        let probe = Arc::new(StubProbe { up: vec![observation("10.0.0.2")] });
        let scanner = Scanner::new(store.clone(), probe);

        scanner.scan(&subnet(), 1, 3).await.unwrap();
        let second = scanner.scan(&subnet(), 1, 3).await.unwrap();
        assert_eq!(second.up, 1);

        let record = store.get("10.0.0.2").unwrap().unwrap();
        // statut stable, mais times_seen et historique avancent
        assert_eq!(record.status, HostStatus::Up);
        assert_eq!(record.times_seen, 2);
        assert_eq!(store.history("10.0.0.2", 10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_discovery_failure_reports_unknown_and_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        let scanner = Scanner::new(store.clone(), Arc::new(FailProbe));

        let report = scanner.scan(&subnet(), 1, 3).await.unwrap();
        assert_eq!(report.unknown, 3);
        assert!(report.error.as_deref().unwrap().contains("network unreachable"));
        assert_eq!(store.host_count(), 0);
        assert_eq!(store.scan_count(), 0);
    }

    #[tokio::test]
    async fn test_scan_rejects_inverted_range() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        let scanner = Scanner::new(store.clone(), Arc::new(StubProbe { up: vec![] }));
        assert!(scanner.scan(&subnet(), 30, 10).await.is_err());
        assert_eq!(store.scan_count(), 0);
    }
}
