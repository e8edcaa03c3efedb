//! Transactional state of a TIP signer node, backed by a single `redb`
//! table of raw byte keys.
//!
//! The key layout is an external contract shared by every implementation
//! reading the same directory:
//!
//! - `POLY#GROUP`, `POLY#PUBLIC`, `POLY#SHARE`: singletons written by the
//!   DKG,
//! - `ASSIGNEE#K`, `ASSIGNOR#K`, `COUNTER#K`, `GENESIS#K`, `NONCE#K`:
//!   per-identity records,
//! - `WATCHER#W`: per-watcher binding,
//! - `LIMIT#K||be64(MAX-ts)`: rate-limit events, keyed with reversed
//!   timestamps so that key-order scans run newest to oldest.
//!
//! Every mutating operation runs inside one `redb` write transaction.
//! Write transactions are serializable and mutually exclusive, which gives
//! concurrent request handlers a strict serial order per key.

use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableTable, TableDefinition};

mod identity;
mod limit;
mod nonce;
mod poly;

pub use identity::WatchState;

const STATE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("state");

const KEY_POLY_GROUP: &[u8] = b"POLY#GROUP";
const KEY_POLY_PUBLIC: &[u8] = b"POLY#PUBLIC";
const KEY_POLY_SHARE: &[u8] = b"POLY#SHARE";
const PREFIX_ASSIGNEE: &[u8] = b"ASSIGNEE#";
const PREFIX_ASSIGNOR: &[u8] = b"ASSIGNOR#";
const PREFIX_WATCHER: &[u8] = b"WATCHER#";
const PREFIX_LIMIT: &[u8] = b"LIMIT#";
const PREFIX_NONCE: &[u8] = b"NONCE#";
const PREFIX_GENESIS: &[u8] = b"GENESIS#";
const PREFIX_COUNTER: &[u8] = b"COUNTER#";

/// Store failures. The first two are domain rejections surfaced to the
/// keeper; the rest wrap the underlying database.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested assignee is already bound as somebody's assignee or
    /// assignor, which would create a chain.
    #[error("assignee is already bound")]
    AssignorIsAssignee,
    /// The watcher key is pinned to a different assignor.
    #[error("watcher is bound to a different assignor")]
    InvalidWatcher,
    /// An empty assignor or watcher key was passed to a write.
    #[error("empty key")]
    EmptyKey,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Database(#[from] redb::DatabaseError),
    #[error(transparent)]
    Transaction(#[from] redb::TransactionError),
    #[error(transparent)]
    Table(#[from] redb::TableError),
    #[error(transparent)]
    Storage(#[from] redb::StorageError),
    #[error(transparent)]
    Commit(#[from] redb::CommitError),
}

/// Handle to the node state. Cheap to clone and safe to share across
/// request handlers.
#[derive(Clone)]
pub struct Storage {
    db: Arc<Database>,
}

impl Storage {
    /// Opens (or creates) the state database inside `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&dir)?;
        let db = Database::create(dir.as_ref().join("tip.redb"))?;
        let txn = db.begin_write()?;
        txn.open_table(STATE)?;
        txn.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    pub(crate) fn db(&self) -> &Database {
        &self.db
    }

    /// Point lookup outside any write transaction.
    pub(crate) fn read_value(
        &self,
        prefix: &[u8],
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(STATE)?;
        let composed = compose(prefix, key);
        Ok(table
            .get(composed.as_slice())?
            .map(|guard| guard.value().to_vec()))
    }
}

pub(crate) fn compose(prefix: &[u8], key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + key.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(key);
    out
}

/// Bounds covering every key starting with `prefix`.
pub(crate) fn prefix_bounds(prefix: &[u8]) -> (Vec<u8>, Option<Vec<u8>>) {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.last_mut() {
        if *last == 0xff {
            upper.pop();
        } else {
            *last += 1;
            return (prefix.to_vec(), Some(upper));
        }
    }
    (prefix.to_vec(), None)
}

pub(crate) fn range_of<'a>(
    lower: &'a [u8],
    upper: &'a Option<Vec<u8>>,
) -> (Bound<&'a [u8]>, Bound<&'a [u8]>) {
    let upper = match upper {
        Some(bytes) => Bound::Excluded(bytes.as_slice()),
        None => Bound::Unbounded,
    };
    (Bound::Included(lower), upper)
}

pub(crate) fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is after the unix epoch")
        .as_nanos() as u64
}

pub(crate) fn u64_from_be(bytes: &[u8]) -> u64 {
    u64::from_be_bytes(bytes.try_into().expect("8 byte value"))
}

#[cfg(test)]
pub(crate) fn test_storage() -> (Storage, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let storage = Storage::open(dir.path()).expect("open store");
    (storage, dir)
}
