//! In-memory snapshot of known identities.
//!
//! The registry is built once at startup from raw store rows and is never
//! mutated afterwards; workers share it through an `Arc` without locking.

use crate::types::{Descriptor, DescriptorError, Identity, IdentityId};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("identity store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt record id={id}: {reason}")]
    CorruptRecord { id: IdentityId, reason: String },
}

/// Raw row as returned by the identity store: `(id, display_name, group_label, descriptor_blob)`.
#[derive(Debug, Clone)]
pub struct IdentityRow {
    pub id: IdentityId,
    pub display_name: String,
    pub group_label: String,
    pub descriptor_blob: Vec<u8>,
}

/// One row as read from a store. A row the store could not read is
/// `Err(CorruptRecord)` and is skipped like an undecodable descriptor.
pub type FetchedRow = Result<IdentityRow, RegistryError>;

/// Source of identity rows (database, fixture, ...).
pub trait IdentityStore {
    fn fetch_rows(&self) -> Result<Vec<FetchedRow>, RegistryError>;
}

/// Records skipped while building a registry.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: Vec<RegistryError>,
}

/// Ordered, read-only set of identities with an id → position index.
#[derive(Debug, Default)]
pub struct Registry {
    identities: Vec<Identity>,
    by_id: HashMap<IdentityId, usize>,
}

impl Registry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load every row from `store`.
    ///
    /// Fails only when the store itself cannot be read. Undecodable rows are
    /// logged and skipped; an empty result is a valid, degraded registry.
    pub fn load(store: &dyn IdentityStore) -> Result<(Self, LoadReport), RegistryError> {
        let rows = store.fetch_rows()?;
        let (registry, report) = Self::from_fetched(rows);
        tracing::info!(
            loaded = report.loaded,
            skipped = report.skipped.len(),
            "identity registry loaded"
        );
        if registry.is_empty() {
            tracing::warn!("identity registry is empty; every face will classify as unknown");
        }
        Ok((registry, report))
    }

    /// Build a registry from raw rows, skipping corrupt or duplicate entries.
    ///
    /// The first decoded descriptor fixes the registry's dimension; rows with
    /// a different dimension are treated as corrupt.
    pub fn from_rows(rows: Vec<IdentityRow>) -> (Self, LoadReport) {
        Self::from_fetched(rows.into_iter().map(Ok))
    }

    /// Like [`Registry::from_rows`], also skipping rows the store already
    /// reported as unreadable.
    pub fn from_fetched(rows: impl IntoIterator<Item = FetchedRow>) -> (Self, LoadReport) {
        let mut registry = Self::default();
        let mut report = LoadReport::default();
        let mut dimension: Option<usize> = None;

        for row in rows {
            let row = match row {
                Ok(row) => row,
                Err(e) => {
                    report.skipped.push(e);
                    continue;
                }
            };
            let descriptor = match Descriptor::decode(&row.descriptor_blob) {
                Ok(d) => d,
                Err(e) => {
                    report.skipped.push(corrupt(row.id, &e));
                    continue;
                }
            };

            if let Some(dim) = dimension {
                if descriptor.len() != dim {
                    report.skipped.push(RegistryError::CorruptRecord {
                        id: row.id,
                        reason: format!("descriptor has {} values, expected {dim}", descriptor.len()),
                    });
                    continue;
                }
            }

            if registry.by_id.contains_key(&row.id) {
                report.skipped.push(RegistryError::CorruptRecord {
                    id: row.id,
                    reason: "duplicate identity id".into(),
                });
                continue;
            }

            dimension.get_or_insert(descriptor.len());
            registry.by_id.insert(row.id, registry.identities.len());
            registry.identities.push(Identity {
                id: row.id,
                display_name: row.display_name,
                group_label: row.group_label,
                descriptor,
            });
        }

        for err in &report.skipped {
            tracing::error!(kind = "corrupt_record", error = %err, "skipping identity record");
        }
        report.loaded = registry.identities.len();

        (registry, report)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Identities in load order.
    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn get(&self, id: IdentityId) -> Option<&Identity> {
        self.by_id.get(&id).map(|&idx| &self.identities[idx])
    }

    /// Descriptor dimension shared by every entry, if any entry exists.
    pub fn dimension(&self) -> Option<usize> {
        self.identities.first().map(|i| i.descriptor.len())
    }
}

fn corrupt(id: IdentityId, err: &DescriptorError) -> RegistryError {
    RegistryError::CorruptRecord {
        id,
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: IdentityId, values: &[f32]) -> IdentityRow {
        IdentityRow {
            id,
            display_name: format!("person {id}"),
            group_label: "ops".into(),
            descriptor_blob: Descriptor::new(values.to_vec()).encode(),
        }
    }

    struct FailingStore;

    impl IdentityStore for FailingStore {
        fn fetch_rows(&self) -> Result<Vec<FetchedRow>, RegistryError> {
            Err(RegistryError::Unavailable("connection refused".into()))
        }
    }

    struct FixedStore(Vec<IdentityRow>);

    impl IdentityStore for FixedStore {
        fn fetch_rows(&self) -> Result<Vec<FetchedRow>, RegistryError> {
            Ok(self.0.iter().cloned().map(Ok).collect())
        }
    }

    #[test]
    fn test_from_rows_preserves_order_and_index() {
        let (reg, report) = Registry::from_rows(vec![row(7, &[1.0, 0.0]), row(3, &[0.0, 1.0])]);
        assert_eq!(report.loaded, 2);
        assert!(report.skipped.is_empty());
        let ids: Vec<_> = reg.identities().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![7, 3]);
        assert_eq!(reg.get(3).map(|i| i.descriptor.values.clone()), Some(vec![0.0, 1.0]));
        assert_eq!(reg.dimension(), Some(2));
    }

    #[test]
    fn test_corrupt_record_skipped_load_continues() {
        let mut bad = row(2, &[0.0]);
        bad.descriptor_blob = vec![1, 2, 3];
        let (reg, report) = Registry::from_rows(vec![row(1, &[1.0]), bad, row(3, &[2.0])]);
        assert_eq!(reg.len(), 2);
        assert_eq!(report.skipped.len(), 1);
        assert!(matches!(
            report.skipped[0],
            RegistryError::CorruptRecord { id: 2, .. }
        ));
    }

    #[test]
    fn test_duplicate_id_skipped() {
        let (reg, report) = Registry::from_rows(vec![row(1, &[1.0]), row(1, &[2.0])]);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(1).map(|i| i.descriptor.values[0]), Some(1.0));
        assert_eq!(report.skipped.len(), 1);
    }

    #[test]
    fn test_dimension_mismatch_skipped() {
        let (reg, report) = Registry::from_rows(vec![row(1, &[1.0, 2.0]), row(2, &[1.0])]);
        assert_eq!(reg.len(), 1);
        assert_eq!(report.skipped.len(), 1);
    }

    #[test]
    fn test_all_corrupt_yields_empty_registry() {
        let mut bad = row(1, &[0.0]);
        bad.descriptor_blob.clear();
        let (reg, report) = Registry::from_rows(vec![bad]);
        assert!(reg.is_empty());
        assert_eq!(reg.dimension(), None);
        assert_eq!(report.loaded, 0);
    }

    #[test]
    fn test_unreadable_row_skipped_load_continues() {
        let rows = vec![
            Ok(row(1, &[1.0])),
            Err(RegistryError::CorruptRecord {
                id: 2,
                reason: "display_name is not text".into(),
            }),
            Ok(row(3, &[2.0])),
        ];
        let (reg, report) = Registry::from_fetched(rows);
        assert_eq!(reg.len(), 2);
        assert_eq!(report.loaded, 2);
        assert!(matches!(
            report.skipped[..],
            [RegistryError::CorruptRecord { id: 2, .. }]
        ));
    }

    #[test]
    fn test_load_unavailable_store_fails() {
        let err = Registry::load(&FailingStore).unwrap_err();
        assert!(matches!(err, RegistryError::Unavailable(_)));
    }

    #[test]
    fn test_load_from_store() {
        let store = FixedStore(vec![row(1, &[0.5]), row(2, &[0.7])]);
        let (reg, report) = Registry::load(&store).unwrap();
        assert_eq!(reg.len(), 2);
        assert_eq!(report.loaded, 2);
    }
}
