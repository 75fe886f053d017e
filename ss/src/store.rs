//! SQLite-backed record store

use std::path::{Path, PathBuf};

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Transaction, params, params_from_iter};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::record::{Filter, Record};

/// Database file name used when the store is opened on a directory
pub const DEFAULT_DB_FILE: &str = "stratstore.db";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    data TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (collection, id)
);
CREATE TABLE IF NOT EXISTS record_indexes (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    field TEXT NOT NULL,
    value_text TEXT,
    value_num REAL,
    PRIMARY KEY (collection, id, field),
    FOREIGN KEY (collection, id) REFERENCES records (collection, id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_record_indexes_text ON record_indexes (collection, field, value_text);
CREATE INDEX IF NOT EXISTS idx_record_indexes_num ON record_indexes (collection, field, value_num);
";

/// Persistent store of JSON records with indexed-field queries
///
/// The store is synchronous and not shared: callers that need concurrent
/// access put it behind a single owner (see the daemon's state actor).
pub struct Store {
    conn: Connection,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

impl Store {
    /// Open (or create) a store
    ///
    /// A path with a file extension is used as the database file; anything
    /// else is treated as a directory holding [`DEFAULT_DB_FILE`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db_path = if path.is_dir() || path.extension().is_none() {
            std::fs::create_dir_all(path)?;
            path.join(DEFAULT_DB_FILE)
        } else {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            path.to_path_buf()
        };
        debug!(?db_path, "Store::open: called");

        let conn = Connection::open(&db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA foreign_keys=ON;\
             PRAGMA busy_timeout=5000;",
        )?;
        conn.execute_batch(SCHEMA)?;

        info!(?db_path, "Store opened");
        Ok(Self {
            conn,
            path: Some(db_path),
        })
    }

    /// Open a throwaway in-memory store
    pub fn open_in_memory() -> Result<Self> {
        debug!("Store::open_in_memory: called");
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn, path: None })
    }

    /// Database file backing this store (None for in-memory stores)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Insert a new record, failing if the id already exists
    pub fn create<R: Record>(&mut self, record: R) -> Result<String> {
        let collection = R::collection_name();
        let id = record.id().to_string();
        debug!(%collection, %id, "Store::create: called");

        let tx = self.conn.transaction()?;
        if exists(&tx, collection, &id)? {
            return Err(StoreError::Duplicate {
                collection: collection.to_string(),
                id,
            });
        }
        write_record(&tx, &record)?;
        tx.commit()?;
        Ok(id)
    }

    /// Replace an existing record, failing if it does not exist
    pub fn update<R: Record>(&mut self, record: R) -> Result<()> {
        let collection = R::collection_name();
        let id = record.id().to_string();
        debug!(%collection, %id, "Store::update: called");

        let tx = self.conn.transaction()?;
        if !exists(&tx, collection, &id)? {
            return Err(StoreError::NotFound {
                collection: collection.to_string(),
                id,
            });
        }
        write_record(&tx, &record)?;
        tx.commit()?;
        Ok(())
    }

    /// Insert or replace a record; returns true if it was newly inserted
    pub fn upsert<R: Record>(&mut self, record: R) -> Result<bool> {
        let collection = R::collection_name();
        let id = record.id().to_string();
        debug!(%collection, %id, "Store::upsert: called");

        let tx = self.conn.transaction()?;
        let inserted = !exists(&tx, collection, &id)?;
        write_record(&tx, &record)?;
        tx.commit()?;
        Ok(inserted)
    }

    /// Fetch a record by id
    pub fn get<R: Record>(&self, id: &str) -> Result<Option<R>> {
        let collection = R::collection_name();
        debug!(%collection, %id, "Store::get: called");
        let data: Option<String> = self
            .conn
            .query_row(
                "SELECT data FROM records WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get(0),
            )
            .optional()?;

        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// List records matching every filter, in insertion order
    pub fn list<R: Record>(&self, filters: &[Filter]) -> Result<Vec<R>> {
        let collection = R::collection_name();
        debug!(%collection, filter_count = filters.len(), "Store::list: called");

        let (sql, values) = build_query("SELECT r.data FROM records r", collection, filters);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(serde_json::from_str(&row?)?);
        }
        debug!(%collection, count = records.len(), "Store::list: returning");
        Ok(records)
    }

    /// Recompute the secondary index for every record of a type
    ///
    /// Needed after `indexed_fields` changes between releases.
    pub fn rebuild_indexes<R: Record>(&mut self) -> Result<usize> {
        let collection = R::collection_name();
        debug!(%collection, "Store::rebuild_indexes: called");
        let records: Vec<R> = self.list(&[])?;

        let tx = self.conn.transaction()?;
        for record in &records {
            write_indexes(&tx, record)?;
        }
        tx.commit()?;

        debug!(%collection, count = records.len(), "Store::rebuild_indexes: done");
        Ok(records.len())
    }
}

fn exists(tx: &Transaction<'_>, collection: &str, id: &str) -> Result<bool> {
    let found: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM records WHERE collection = ?1 AND id = ?2",
            params![collection, id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn write_record<R: Record>(tx: &Transaction<'_>, record: &R) -> Result<()> {
    let data = serde_json::to_string(record)?;
    tx.execute(
        "INSERT INTO records (collection, id, data, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (collection, id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
        params![R::collection_name(), record.id(), data, record.updated_at()],
    )?;
    write_indexes(tx, record)
}

fn write_indexes<R: Record>(tx: &Transaction<'_>, record: &R) -> Result<()> {
    let collection = R::collection_name();
    tx.execute(
        "DELETE FROM record_indexes WHERE collection = ?1 AND id = ?2",
        params![collection, record.id()],
    )?;
    for (field, value) in record.indexed_fields() {
        tx.execute(
            "INSERT INTO record_indexes (collection, id, field, value_text, value_num) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![collection, record.id(), field, value.as_text(), value.as_number()],
        )?;
    }
    Ok(())
}

fn build_query(select: &str, collection: &str, filters: &[Filter]) -> (String, Vec<SqlValue>) {
    let mut sql = format!("{} WHERE r.collection = ?1", select);
    let mut values = vec![SqlValue::Text(collection.to_string())];

    for filter in filters {
        let field_param = values.len() + 1;
        let value_param = values.len() + 2;
        let (column, value) = match filter.value.as_text() {
            Some(text) => ("value_text", SqlValue::Text(text.to_string())),
            None => ("value_num", SqlValue::Real(filter.value.as_number().unwrap_or_default())),
        };
        sql.push_str(&format!(
            " AND EXISTS (SELECT 1 FROM record_indexes i WHERE i.collection = r.collection AND i.id = r.id \
             AND i.field = ?{} AND i.{} {} ?{})",
            field_param,
            column,
            filter.op.as_sql(),
            value_param
        ));
        values.push(SqlValue::Text(filter.field.clone()));
        values.push(value);
    }

    sql.push_str(" ORDER BY r.rowid");
    (sql, values)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::record::{FilterOp, IndexValue};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        owner: String,
        score: f64,
        pinned: bool,
        updated_at: i64,
    }

    impl Note {
        fn new(id: &str, owner: &str, score: f64, pinned: bool) -> Self {
            Self {
                id: id.to_string(),
                owner: owner.to_string(),
                score,
                pinned,
                updated_at: crate::now_ms(),
            }
        }
    }

    impl Record for Note {
        fn id(&self) -> &str {
            &self.id
        }

        fn updated_at(&self) -> i64 {
            self.updated_at
        }

        fn collection_name() -> &'static str {
            "notes"
        }

        fn indexed_fields(&self) -> HashMap<String, IndexValue> {
            let mut fields = HashMap::new();
            fields.insert("owner".to_string(), IndexValue::String(self.owner.clone()));
            fields.insert("score".to_string(), IndexValue::Float(self.score));
            fields.insert("pinned".to_string(), IndexValue::Bool(self.pinned));
            fields
        }
    }

    #[test]
    fn test_create_and_get() {
        let mut store = Store::open_in_memory().unwrap();
        let id = store.create(Note::new("n1", "ann", 1.0, false)).unwrap();
        assert_eq!(id, "n1");

        let note: Note = store.get("n1").unwrap().unwrap();
        assert_eq!(note.owner, "ann");
        assert!(store.get::<Note>("missing").unwrap().is_none());
    }

    #[test]
    fn test_create_duplicate_rejected() {
        let mut store = Store::open_in_memory().unwrap();
        store.create(Note::new("n1", "ann", 1.0, false)).unwrap();
        let err = store.create(Note::new("n1", "bob", 2.0, false)).unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));
    }

    #[test]
    fn test_update_missing_is_not_found() {
        let mut store = Store::open_in_memory().unwrap();
        let err = store.update(Note::new("ghost", "ann", 1.0, false)).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn test_upsert_overwrites_without_duplicating() {
        let mut store = Store::open_in_memory().unwrap();
        assert!(store.upsert(Note::new("n1", "ann", 1.0, false)).unwrap());
        assert!(!store.upsert(Note::new("n1", "bob", 5.0, true)).unwrap());

        let all: Vec<Note> = store.list(&[]).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].owner, "bob");

        // Stale index rows for the old owner are gone
        let anns: Vec<Note> = store.list(&[Filter::eq("owner", "ann")]).unwrap();
        assert!(anns.is_empty());
    }

    #[test]
    fn test_list_with_filters() {
        let mut store = Store::open_in_memory().unwrap();
        store.create(Note::new("a", "ann", 10.0, true)).unwrap();
        store.create(Note::new("b", "ann", 60.0, false)).unwrap();
        store.create(Note::new("c", "bob", 80.0, true)).unwrap();

        let anns: Vec<Note> = store.list(&[Filter::eq("owner", "ann")]).unwrap();
        assert_eq!(anns.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);

        let high: Vec<Note> = store.list(&[Filter::new("score", FilterOp::Gte, 50.0)]).unwrap();
        assert_eq!(high.len(), 2);

        let pinned_high: Vec<Note> = store
            .list(&[
                Filter::eq("pinned", true),
                Filter::new("score", FilterOp::Gt, 50.0),
            ])
            .unwrap();
        assert_eq!(pinned_high.len(), 1);
        assert_eq!(pinned_high[0].id, "c");

        let bobs: Vec<Note> = store.list(&[Filter::eq("owner", "bob")]).unwrap();
        assert_eq!(bobs.len(), 1);
    }

    #[test]
    fn test_rebuild_indexes() {
        let mut store = Store::open_in_memory().unwrap();
        store.create(Note::new("a", "ann", 1.0, false)).unwrap();
        store.create(Note::new("b", "bob", 2.0, false)).unwrap();
        assert_eq!(store.rebuild_indexes::<Note>().unwrap(), 2);
        let bobs: Vec<Note> = store.list(&[Filter::eq("owner", "bob")]).unwrap();
        assert_eq!(bobs.len(), 1);
    }
}
