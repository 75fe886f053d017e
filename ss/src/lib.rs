//! StratStore - generic persistent record store over SQLite
//!
//! Records are plain serde types that implement [`Record`]. Each record is
//! stored as a JSON document keyed by `(collection, id)`, and the fields it
//! reports from [`Record::indexed_fields`] are written to a secondary index
//! table so they can be queried with [`Filter`]s.
//!
//! # Example
//!
//! ```ignore
//! use stratstore::{Filter, FilterOp, IndexValue, Store};
//!
//! let mut store = Store::open("/var/lib/stratd")?;
//! store.upsert(result)?;
//! let failed: Vec<ItemResult> = store.list(&[Filter::eq("passed", IndexValue::Bool(false))])?;
//! ```

mod error;
mod record;
mod store;

pub use error::{Result, StoreError};
pub use record::{Filter, FilterOp, IndexValue, Record};
pub use store::{DEFAULT_DB_FILE, Store};

/// Current wall-clock time as Unix milliseconds
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
