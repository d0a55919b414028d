/**
 * RESERVATION MANAGER - Pose et levée de réservations administratives
 *
 * RÔLE :
 * Une réservation fige une adresse : tant qu'elle tient, aucune
 * réconciliation de scan ne peut en changer le statut. Elle se pose même
 * sur une adresse jamais observée (création implicite d'un
 * enregistrement) et se lève explicitement.
 *
 * RÈGLES :
 * - reserve écrase `notes` avec la description fournie (y compris None)
 * - release repasse le statut à `down`, efface reserved_for/by/at, mais
 *   conserve `notes`
 * - Aucune entrée d'historique : une réservation n'est pas une
 *   observation de vivacité
 */

use crate::models::{check_address, HostRecord, HostStatus, RequestError, Subnet};
use crate::store::{HostStore, HostUpdate, StoreError};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ReservationError {
    #[error(transparent)]
    InvalidRequest(#[from] RequestError),
    #[error("no record for address {0}")]
    NotFound(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Paramètres d'une pose de réservation.
#[derive(Debug, Clone)]
pub struct ReserveParams {
    pub address: String,
    /// Objet de la réservation (nom de VM, de manip...).
    pub reserved_for: String,
    /// Opérateur, si distinct de l'objet.
    pub reserved_by: Option<String>,
    pub description: Option<String>,
}

/// Annotation manuelle d'un enregistrement existant.
#[derive(Debug, Clone, Default)]
pub struct Annotation {
    pub notes: Option<String>,
    pub is_reserved: Option<bool>,
}

pub struct ReservationManager {
    store: Arc<dyn HostStore>,
}

impl ReservationManager {
    pub fn new(store: Arc<dyn HostStore>) -> Self {
        Self { store }
    }

    /// Pose une réservation, en créant l'enregistrement si besoin.
    pub fn reserve(&self, params: &ReserveParams) -> Result<HostRecord, ReservationError> {
        check_address(&params.address)?;
        let subnet = Subnet::of_address(&params.address)?;
        let now = OffsetDateTime::now_utc();

        let record = self.store.update(&params.address, &mut |existing| {
            let mut record = match existing {
                Some(rec) => rec.clone(),
                None => blank_record(&params.address, &subnet),
            };
            record.status = HostStatus::Reserved;
            record.is_reserved = true;
            record.reserved_for = Some(params.reserved_for.clone());
            record.reserved_by = params.reserved_by.clone();
            record.reserved_at = Some(now);
            record.notes = params.description.clone();
            HostUpdate { record: Some(record), history: None }
        })?;

        info!("[reservation] {} reserved for {}", params.address, params.reserved_for);
        // update vient d'écrire Some : le Some est structurel ici
        record.ok_or_else(|| ReservationError::NotFound(params.address.clone()))
    }

    /// Lève la réservation. L'adresse repasse `down`, les notes restent.
    pub fn release(&self, address: &str) -> Result<HostRecord, ReservationError> {
        check_address(address)?;

        let record = self.store.update(address, &mut |existing| match existing {
            None => HostUpdate::none(),
            Some(rec) => {
                let mut record = rec.clone();
                record.status = HostStatus::Down;
                record.is_reserved = false;
                record.reserved_for = None;
                record.reserved_by = None;
                record.reserved_at = None;
                HostUpdate { record: Some(record), history: None }
            }
        })?;

        match record {
            Some(rec) => {
                info!("[reservation] {} released", address);
                Ok(rec)
            }
            None => Err(ReservationError::NotFound(address.to_string())),
        }
    }

    /// Annotation manuelle : notes et/ou bascule de réservation, sans
    /// toucher au reste. Exige un enregistrement existant.
    pub fn annotate(
        &self,
        address: &str,
        annotation: &Annotation,
    ) -> Result<HostRecord, ReservationError> {
        check_address(address)?;
        let now = OffsetDateTime::now_utc();

        let record = self.store.update(address, &mut |existing| match existing {
            None => HostUpdate::none(),
            Some(rec) => {
                let mut record = rec.clone();
                if let Some(notes) = &annotation.notes {
                    record.notes = Some(notes.clone());
                }
                match annotation.is_reserved {
                    Some(true) => {
                        record.status = HostStatus::Reserved;
                        record.is_reserved = true;
                        if record.reserved_at.is_none() {
                            record.reserved_at = Some(now);
                        }
                    }
                    Some(false) => {
                        if record.is_reserved {
                            record.status = HostStatus::Down;
                        }
                        record.is_reserved = false;
                        record.reserved_for = None;
                        record.reserved_by = None;
                        record.reserved_at = None;
                    }
                    None => {}
                }
                HostUpdate { record: Some(record), history: None }
            }
        })?;

        record.ok_or_else(|| ReservationError::NotFound(address.to_string()))
    }
}

fn blank_record(address: &str, subnet: &Subnet) -> HostRecord {
    let last_octet = address
        .rsplit('.')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    HostRecord {
        address: address.to_string(),
        subnet: subnet.as_str().to_string(),
        last_octet,
        status: HostStatus::Reserved,
        hostname: None,
        mac_address: None,
        vendor: None,
        times_seen: 0,
        first_seen: None,
        last_seen: None,
        last_scanned: None,
        is_reserved: true,
        reserved_for: None,
        reserved_by: None,
        reserved_at: None,
        notes: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileStore;

    fn manager(dir: &tempfile::TempDir) -> (ReservationManager, Arc<FileStore>) {
        let store = Arc::new(FileStore::new(dir.path().join("hosts.json")).unwrap());
        (ReservationManager::new(store.clone()), store)
    }

    fn params(address: &str) -> ReserveParams {
        ReserveParams {
            address: address.to_string(),
            reserved_for: "test-vm".to_string(),
            reserved_by: Some("ops".to_string()),
            description: Some("bench A".to_string()),
        }
    }

    #[test]
    fn test_reserve_creates_record_implicitly() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, store) = manager(&dir);

        let record = manager.reserve(&params("10.0.0.2")).unwrap();
        assert_eq!(record.status, HostStatus::Reserved);
        assert!(record.is_reserved);
        assert_eq!(record.reserved_for.as_deref(), Some("test-vm"));
        assert_eq!(record.reserved_by.as_deref(), Some("ops"));
        assert_eq!(record.notes.as_deref(), Some("bench A"));
        assert_eq!(record.times_seen, 0);
        assert!(record.first_seen.is_none());

        // pas d'entrée d'historique pour une réservation
        assert!(store.history("10.0.0.2", 10).unwrap().is_empty());
    }

    #[test]
    fn test_reserve_overwrites_notes() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(&dir);

        manager.reserve(&params("10.0.0.2")).unwrap();
        let mut second = params("10.0.0.2");
        second.description = None;
        let record = manager.reserve(&second).unwrap();
        assert!(record.notes.is_none());
    }

    #[test]
    fn test_release_restores_down_and_keeps_notes() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(&dir);

        manager.reserve(&params("10.0.0.2")).unwrap();
        let record = manager.release("10.0.0.2").unwrap();
        assert_eq!(record.status, HostStatus::Down);
        assert!(!record.is_reserved);
        assert!(record.reserved_for.is_none());
        assert!(record.reserved_by.is_none());
        assert!(record.reserved_at.is_none());
        assert_eq!(record.notes.as_deref(), Some("bench A"));
    }

    #[test]
    fn test_release_unknown_address_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(&dir);
        assert!(matches!(
            manager.release("10.0.0.9"),
            Err(ReservationError::NotFound(_))
        ));
    }

    #[test]
    fn test_reserve_rejects_bad_address() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(&dir);
        let mut bad = params("not-an-ip");
        bad.address = "not-an-ip".to_string();
        assert!(matches!(
            manager.reserve(&bad),
            Err(ReservationError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_annotate_updates_notes_and_toggles_reservation() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(&dir);
        manager.reserve(&params("10.0.0.2")).unwrap();

        let record = manager
            .annotate(
                "10.0.0.2",
                &Annotation { notes: Some("new note".to_string()), is_reserved: Some(false) },
            )
            .unwrap();
        assert_eq!(record.status, HostStatus::Down);
        assert!(!record.is_reserved);
        assert_eq!(record.notes.as_deref(), Some("new note"));

        let record = manager
            .annotate("10.0.0.2", &Annotation { notes: None, is_reserved: Some(true) })
            .unwrap();
        assert_eq!(record.status, HostStatus::Reserved);
        assert!(record.reserved_at.is_some());
        assert_eq!(record.notes.as_deref(), Some("new note"));
    }
}
