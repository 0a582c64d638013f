#![allow(clippy::result_large_err)]
//! Embedded key-value storage using redb.
//!
//! redb is a stable (1.0+) pure-Rust embedded database with ACID
//! transactions. Write transactions commit with immediate durability, so a
//! successful `commit()` means the data has been fsynced. The proposal log
//! depends on that: an acceptor never acknowledges a round before the
//! corresponding commit returns.
//!
//! # Example
//!
//! ```rust,ignore
//! use timelock::storage::RedbStore;
//!
//! let store = RedbStore::open("/tmp/timelock.redb")?;
//! let tree = store.tree("bounds")?;
//! tree.set(b"timestamp_bound", &1000u64.to_be_bytes())?;
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use redb::{Database, ReadableTable, TableDefinition};

/// Errors that can occur during storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("redb database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("redb transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store not initialized: {0}")]
    NotInitialized(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// A wrapper around a redb `Database` handing out named trees.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open or create a redb database at the given path.
    ///
    /// The parent directory is created if missing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(path)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Open a database backed by a temporary file (for testing).
    pub fn open_temporary() -> Result<Self> {
        let tmpfile = tempfile::NamedTempFile::new()?;
        let db = Database::create(tmpfile.path())?;
        // redb owns the file handle; the OS reclaims the file on exit.
        std::mem::forget(tmpfile);
        Ok(Self { db: Arc::new(db) })
    }

    /// Get or create a named tree (table namespace).
    ///
    /// # Memory
    ///
    /// Uses `Box::leak` to satisfy redb's `&'static str` requirement for
    /// table names. Tree names here are a small fixed set (one per log
    /// namespace plus the bound cell); do not call with unbounded names.
    pub fn tree(&self, name: &str) -> Result<RedbTree> {
        let table_name = Box::leak(name.to_owned().into_boxed_str());
        let table_def = TableDefinition::<&[u8], &[u8]>::new(table_name);
        let write_txn = self.db.begin_write()?;
        let _ = write_txn.open_table(table_def)?;
        write_txn.commit()?;

        Ok(RedbTree {
            db: Arc::clone(&self.db),
            table_name,
        })
    }

    /// Start a batch that may touch several trees of this store.
    pub fn batch(&self) -> StoreBatch {
        StoreBatch {
            db: Arc::clone(&self.db),
            ops: Vec::new(),
        }
    }
}

/// A named tree (table) within a redb database.
///
/// Each operation opens a transaction, performs the operation, and commits.
#[derive(Clone)]
pub struct RedbTree {
    db: Arc<Database>,
    table_name: &'static str,
}

impl RedbTree {
    fn table_def(&self) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
        TableDefinition::new(self.table_name)
    }

    /// Get a value by key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        match read_txn.open_table(self.table_def()) {
            Ok(table) => Ok(table.get(key)?.map(|v| v.value().to_vec())),
            Err(redb::TableError::TableDoesNotExist(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Get a value and deserialize it using bincode.
    pub fn get_bincode<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Set a value by key.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(self.table_def())?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Serialize and set a value using bincode.
    pub fn set_bincode<T: Serialize>(&self, key: &[u8], value: &T) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        self.set(key, &bytes)
    }

    /// Get the entry with the largest key strictly below `bound`.
    ///
    /// Keys are compared lexicographically, so callers storing integers must
    /// encode them big-endian.
    pub fn last_below(&self, bound: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(self.table_def()) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut iter = table.range::<&[u8]>(..bound)?;
        match iter.next_back() {
            Some(Ok((k, v))) => Ok(Some((k.value().to_vec(), v.value().to_vec()))),
            Some(Err(e)) => Err(StorageError::Storage(e)),
            None => Ok(None),
        }
    }

    /// Get the last key-value pair (lexicographically largest key).
    pub fn last(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let read_txn = self.db.begin_read()?;
        match read_txn.open_table(self.table_def()) {
            Ok(table) => {
                let mut iter = table.iter()?;
                match iter.next_back() {
                    Some(Ok((k, v))) => Ok(Some((k.value().to_vec(), v.value().to_vec()))),
                    Some(Err(e)) => Err(StorageError::Storage(e)),
                    None => Ok(None),
                }
            }
            Err(redb::TableError::TableDoesNotExist(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Compare-and-swap operation.
    ///
    /// Atomically sets `key` to `new` if its current value is `expected`.
    /// On mismatch the inner `Err` carries the value actually stored.
    pub fn compare_and_swap(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<std::result::Result<(), Option<Vec<u8>>>> {
        let write_txn = self.db.begin_write()?;
        let result;
        {
            let mut table = write_txn.open_table(self.table_def())?;
            let current = table.get(key)?.map(|v| v.value().to_vec());

            if current.as_deref() == expected {
                match new {
                    Some(val) => {
                        table.insert(key, val)?;
                    }
                    None => {
                        table.remove(key)?;
                    }
                }
                result = Ok(());
            } else {
                result = Err(current);
            }
        }
        write_txn.commit()?;
        Ok(result)
    }
}

/// A pending insert: table name, key, value.
type BatchInsert = (&'static str, Vec<u8>, Vec<u8>);

/// Writes against one or more trees committed in a single transaction.
pub struct StoreBatch {
    db: Arc<Database>,
    ops: Vec<BatchInsert>,
}

impl StoreBatch {
    /// Add an insert into `tree` to the batch.
    pub fn insert(&mut self, tree: &RedbTree, key: &[u8], value: &[u8]) {
        self.ops
            .push((tree.table_name, key.to_vec(), value.to_vec()));
    }

    /// Apply all operations atomically and durably.
    pub fn apply(self) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        for (name, key, value) in &self.ops {
            let mut table = write_txn.open_table(TableDefinition::<&[u8], &[u8]>::new(*name))?;
            table.insert(key.as_slice(), value.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}
