//! SQLite-backed identity store.

use presence_core::{FetchedRow, IdentityRow, IdentityStore, RegistryError};
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};

const SELECT_IDENTITIES: &str =
    "SELECT id, display_name, group_label, descriptor FROM identities ORDER BY id";

/// Reads the `identities` table once at startup. The database is opened read-only.
pub struct SqliteIdentityStore {
    path: PathBuf,
}

impl SqliteIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdentityStore for SqliteIdentityStore {
    fn fetch_rows(&self) -> Result<Vec<FetchedRow>, RegistryError> {
        let unavailable =
            |e: rusqlite::Error| RegistryError::Unavailable(format!("{}: {e}", self.path.display()));

        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(unavailable)?;

        let mut stmt = conn.prepare(SELECT_IDENTITIES).map_err(unavailable)?;
        let rows = stmt
            .query_map([], |row| {
                let id = row.get(0)?;
                let fields = (row.get(1)?, row.get(2)?, row.get(3)?);
                Ok(identity_row(id, fields))
            })
            .map_err(unavailable)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(unavailable)?;

        tracing::debug!(path = %self.path.display(), rows = rows.len(), "identity rows fetched");
        Ok(rows)
    }
}

/// Build a row from raw column values. A mistyped name or group marks only
/// this row as corrupt.
fn identity_row(id: i64, (name, group, descriptor): (Value, Value, Value)) -> FetchedRow {
    let text = |column: &str, value: Value| match value {
        Value::Text(text) => Ok(text),
        Value::Null => Ok(String::new()),
        other => Err(RegistryError::CorruptRecord {
            id,
            reason: format!("{column} is {:?}, expected text", other.data_type()),
        }),
    };
    Ok(IdentityRow {
        id,
        display_name: text("display_name", name)?,
        group_label: text("group_label", group)?,
        descriptor_blob: descriptor_bytes(descriptor),
    })
}

/// Descriptor column contents as bytes. TEXT holds the JSON form; anything
/// else yields an empty blob, which the registry rejects as corrupt.
fn descriptor_bytes(value: Value) -> Vec<u8> {
    match value {
        Value::Blob(bytes) => bytes,
        Value::Text(text) => text.into_bytes(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::{Descriptor, Registry};

    fn create_db(dir: &tempfile::TempDir) -> (PathBuf, Connection) {
        let path = dir.path().join("presence.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE identities (
                id INTEGER PRIMARY KEY,
                display_name TEXT NOT NULL,
                group_label TEXT,
                descriptor BLOB
            );",
        )
        .unwrap();
        (path, conn)
    }

    #[test]
    fn test_fetch_rows() {
        let dir = tempfile::tempdir().unwrap();
        let (path, conn) = create_db(&dir);
        let blob = Descriptor::new(vec![0.1, 0.2, 0.3]).encode();
        conn.execute(
            "INSERT INTO identities VALUES (2, 'Bob', 'Ops', ?1)",
            [&blob],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO identities VALUES (1, 'Alice', NULL, '[0.3, 0.2, 0.1]')",
            [],
        )
        .unwrap();

        let rows: Vec<_> = SqliteIdentityStore::new(&path)
            .fetch_rows()
            .unwrap()
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, 1);
        assert_eq!(rows[0].group_label, "");
        assert_eq!(rows[0].descriptor_blob, b"[0.3, 0.2, 0.1]".to_vec());
        assert_eq!(rows[1].display_name, "Bob");
        assert_eq!(rows[1].descriptor_blob, blob);

        let (registry, report) = Registry::from_rows(rows);
        assert_eq!(registry.len(), 2);
        assert!(report.skipped.is_empty());
    }

    #[test]
    fn test_null_descriptor_is_skipped_as_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let (path, conn) = create_db(&dir);
        conn.execute("INSERT INTO identities VALUES (7, 'Eve', 'R&D', NULL)", [])
            .unwrap();

        let store = SqliteIdentityStore::new(&path);
        let (registry, report) = Registry::load(&store).unwrap();
        assert!(registry.is_empty());
        assert_eq!(report.skipped.len(), 1);
    }

    #[test]
    fn test_mistyped_name_skips_only_that_row() {
        let dir = tempfile::tempdir().unwrap();
        let (path, conn) = create_db(&dir);
        let blob = Descriptor::new(vec![0.1, 0.2]).encode();
        conn.execute("INSERT INTO identities VALUES (1, 'Alice', 'Ops', ?1)", [&blob])
            .unwrap();
        conn.execute("INSERT INTO identities VALUES (2, X'00FF', 'Ops', ?1)", [&blob])
            .unwrap();
        conn.execute("INSERT INTO identities VALUES (3, 'Carol', X'01', ?1)", [&blob])
            .unwrap();
        conn.execute("INSERT INTO identities VALUES (4, 'Dan', NULL, ?1)", [&blob])
            .unwrap();

        let (registry, report) = Registry::load(&SqliteIdentityStore::new(&path)).unwrap();
        let ids: Vec<_> = registry.identities().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 4]);
        assert_eq!(report.skipped.len(), 2);
        assert!(matches!(
            report.skipped[0],
            RegistryError::CorruptRecord { id: 2, .. }
        ));
        assert!(report.skipped[1].to_string().contains("group_label"));
    }

    #[test]
    fn test_missing_database_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteIdentityStore::new(dir.path().join("absent.db"));
        assert!(matches!(
            store.fetch_rows(),
            Err(RegistryError::Unavailable(_))
        ));
    }

    #[test]
    fn test_missing_table_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE other (x INTEGER);")
            .unwrap();
        assert!(matches!(
            SqliteIdentityStore::new(&path).fetch_rows(),
            Err(RegistryError::Unavailable(_))
        ));
    }
}
