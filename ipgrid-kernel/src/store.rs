/**
 * HOST STORE - Persistence de l'inventaire IPGrid
 *
 * RÔLE :
 * Ce module définit la frontière de persistance du kernel : lookup ponctuel
 * par adresse, read-modify-write atomique par adresse, journaux append-only
 * (historique des transitions, résumés de scan) et opérations bulk par
 * subnet (clear, reset de statut).
 *
 * FONCTIONNEMENT :
 * - HostStore trait = contrat que le réconciliateur et la réservation
 *   consomment, sans connaître la techno de stockage
 * - FileStore = implémentation fichier JSON avec cache mémoire
 * - Chaque mutation passe par le même verrou : la lecture, la décision et
 *   l'écriture d'une adresse ne s'entrelacent jamais avec un autre writer
 */

use crate::models::{HistoryEntry, HostRecord, HostStatus, ScanRecord, Subnet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Résultat d'une décision appliquée à une adresse : nouvel état éventuel
/// de l'enregistrement, plus une entrée d'historique éventuelle.
#[derive(Debug, Clone)]
pub struct HostUpdate {
    /// `None` = ne rien écrire (l'adresse reste absente ou inchangée).
    pub record: Option<HostRecord>,
    pub history: Option<HistoryEntry>,
}

impl HostUpdate {
    pub fn none() -> Self {
        Self { record: None, history: None }
    }
}

/// Frontière de persistance consommée par le réconciliateur et la
/// réservation. Chaque opération single-record est atomique.
pub trait HostStore: Send + Sync {
    fn get(&self, address: &str) -> Result<Option<HostRecord>, StoreError>;

    /// Read-modify-write atomique : `apply` reçoit l'enregistrement courant
    /// et rend la mise à jour à committer. Retourne l'état résultant.
    fn update(
        &self,
        address: &str,
        apply: &mut dyn FnMut(Option<&HostRecord>) -> HostUpdate,
    ) -> Result<Option<HostRecord>, StoreError>;

    fn list_subnet(&self, subnet: &Subnet) -> Result<Vec<HostRecord>, StoreError>;

    /// Dernières entrées d'historique d'une adresse, les plus récentes d'abord.
    fn history(&self, address: &str, limit: usize) -> Result<Vec<HistoryEntry>, StoreError>;

    /// Journal write-once des scans.
    fn append_scan(&self, scan: ScanRecord) -> Result<(), StoreError>;

    /// Supprime hôtes, historique et scans d'un subnet. Retourne le nombre
    /// d'hôtes supprimés.
    fn clear_subnet(&self, subnet: &Subnet) -> Result<usize, StoreError>;

    /// Force les hôtes non réservés d'un subnet à `down` et efface leur
    /// `last_scanned`. Retourne le nombre d'hôtes touchés.
    fn reset_subnet(&self, subnet: &Subnet) -> Result<usize, StoreError>;

    fn host_count(&self) -> usize;

    fn scan_count(&self) -> usize;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    hosts: HashMap<String, HostRecord>,
    history: Vec<HistoryEntry>,
    scans: Vec<ScanRecord>,
}

/// Implémentation fichier JSON du HostStore, cache mémoire sous mutex.
pub struct FileStore {
    storage_path: PathBuf,
    state: Mutex<StoreState>,
}

impl FileStore {
    pub fn new<P: Into<PathBuf>>(storage_path: P) -> Result<Self, StoreError> {
        let path = storage_path.into();
        let state = if path.exists() {
            let content = fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                StoreState::default()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            StoreState::default()
        };
        info!("[store] loaded {} hosts from {:?}", state.hosts.len(), path);
        Ok(Self { storage_path: path, state: Mutex::new(state) })
    }

    /// Sauvegarde l'état complet. Appelé verrou tenu, après chaque mutation.
    fn save(&self, state: &StoreState) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(state)?;
        fs::write(&self.storage_path, json)?;
        Ok(())
    }
}

impl HostStore for FileStore {
    fn get(&self, address: &str) -> Result<Option<HostRecord>, StoreError> {
        Ok(self.state.lock().hosts.get(address).cloned())
    }

    fn update(
        &self,
        address: &str,
        apply: &mut dyn FnMut(Option<&HostRecord>) -> HostUpdate,
    ) -> Result<Option<HostRecord>, StoreError> {
        let mut state = self.state.lock();
        let update = apply(state.hosts.get(address));

        let mut dirty = false;
        if let Some(record) = update.record {
            state.hosts.insert(address.to_string(), record);
            dirty = true;
        }
        if let Some(entry) = update.history {
            state.history.push(entry);
            dirty = true;
        }
        if dirty {
            self.save(&state)?;
        }
        Ok(state.hosts.get(address).cloned())
    }

    fn list_subnet(&self, subnet: &Subnet) -> Result<Vec<HostRecord>, StoreError> {
        let state = self.state.lock();
        let mut records: Vec<HostRecord> = state
            .hosts
            .values()
            .filter(|r| r.subnet == subnet.as_str())
            .cloned()
            .collect();
        records.sort_by_key(|r| r.last_octet);
        Ok(records)
    }

    fn history(&self, address: &str, limit: usize) -> Result<Vec<HistoryEntry>, StoreError> {
        let state = self.state.lock();
        let mut entries: Vec<HistoryEntry> = state
            .history
            .iter()
            .filter(|e| e.address == address)
            .cloned()
            .collect();
        entries.reverse(); // append-only : les plus récentes en queue
        entries.truncate(limit);
        Ok(entries)
    }

    fn append_scan(&self, scan: ScanRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.scans.push(scan);
        self.save(&state)
    }

    fn clear_subnet(&self, subnet: &Subnet) -> Result<usize, StoreError> {
        let mut state = self.state.lock();
        let before = state.hosts.len();
        state.hosts.retain(|_, r| r.subnet != subnet.as_str());
        let removed = before - state.hosts.len();

        let prefix = format!("{}.", subnet.as_str());
        state.history.retain(|e| !e.address.starts_with(&prefix));
        state.scans.retain(|s| s.subnet != subnet.as_str());

        self.save(&state)?;
        info!("[store] cleared {} hosts for subnet {}", removed, subnet);
        Ok(removed)
    }

    fn reset_subnet(&self, subnet: &Subnet) -> Result<usize, StoreError> {
        let mut state = self.state.lock();
        let mut touched = 0;
        for record in state.hosts.values_mut() {
            if record.subnet == subnet.as_str() && !record.is_reserved {
                record.status = HostStatus::Down;
                record.last_scanned = None;
                touched += 1;
            }
        }
        self.save(&state)?;
        Ok(touched)
    }

    fn host_count(&self) -> usize {
        self.state.lock().hosts.len()
    }

    fn scan_count(&self) -> usize {
        self.state.lock().scans.len()
    }
}
