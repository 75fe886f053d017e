//! On-disk store tests

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use stratstore::{DEFAULT_DB_FILE, Filter, IndexValue, Record, Store};
use tempfile::TempDir;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    id: String,
    group: String,
    updated_at: i64,
}

impl Record for Entry {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "entries"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        HashMap::from([("group".to_string(), IndexValue::String(self.group.clone()))])
    }
}

fn entry(id: &str, group: &str) -> Entry {
    Entry {
        id: id.to_string(),
        group: group.to_string(),
        updated_at: stratstore::now_ms(),
    }
}

#[test]
fn test_open_directory_creates_default_file() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("state");
    let store = Store::open(&dir).unwrap();
    assert_eq!(store.path().unwrap(), dir.join(DEFAULT_DB_FILE));
    assert!(dir.join(DEFAULT_DB_FILE).exists());
}

#[test]
fn test_records_survive_reopen() {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("nested").join("runs.db");

    {
        let mut store = Store::open(&db).unwrap();
        store.create(entry("1", "x")).unwrap();
        store.create(entry("2", "y")).unwrap();
    }

    let store = Store::open(&db).unwrap();
    let xs: Vec<Entry> = store.list(&[Filter::eq("group", "x")]).unwrap();
    assert_eq!(xs.len(), 1);
    assert_eq!(xs[0].id, "1");
}

#[test]
fn test_collections_are_isolated() {
    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Other {
        id: String,
    }

    impl Record for Other {
        fn id(&self) -> &str {
            &self.id
        }
        fn updated_at(&self) -> i64 {
            0
        }
        fn collection_name() -> &'static str {
            "others"
        }
        fn indexed_fields(&self) -> HashMap<String, IndexValue> {
            HashMap::new()
        }
    }

    let mut store = Store::open_in_memory().unwrap();
    store.create(entry("same", "x")).unwrap();
    store.create(Other { id: "same".to_string() }).unwrap();

    assert_eq!(store.list::<Entry>(&[]).unwrap().len(), 1);
    assert_eq!(store.list::<Other>(&[]).unwrap().len(), 1);
}
