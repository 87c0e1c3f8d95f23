//! Pure-Rust redb storage backend.
//!
//! Each bucket maps to one redb table keyed by `&str` with `&[u8]` values.
//! redb uses a copy-on-write B-tree with serializable transactions: every
//! trait method opens exactly one read or write transaction, so callers see
//! each operation atomically.
//!
//! Values read out of a transaction are copied into owned `Vec<u8>` before
//! the transaction ends; nothing borrowed from the database escapes.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition, TableError, TableHandle};
use tempfile::TempDir;

use crate::{Snapshot, StorageBackend, StorageError};

/// File name used inside the scratch directory of an ephemeral backend.
const EPHEMERAL_FILE: &str = "slate.redb";

fn table(name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(name)
}

/// A storage backend backed by redb (pure Rust, B-tree based).
///
/// Thread-safe via `Arc<Database>`. Blocking redb calls are offloaded to the
/// Tokio blocking thread pool.
///
/// # Examples
///
/// ```no_run
/// # use slate_storage::RedbBackend;
/// let backend = RedbBackend::open("/var/lib/slate/content.redb").unwrap();
/// ```
#[derive(Clone)]
pub struct RedbBackend {
    db: Arc<Database>,
    path: PathBuf,
    // Dropped after `db`: the scratch directory outlives the open database.
    scratch: Option<Arc<TempDir>>,
}

impl std::fmt::Debug for RedbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBackend")
            .field("path", &self.path)
            .field("ephemeral", &self.scratch.is_some())
            .finish_non_exhaustive()
    }
}

impl RedbBackend {
    /// Open or create a redb database at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if redb fails to open or create the
    /// database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let db = Database::create(path).map_err(|e| StorageError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
            scratch: None,
        })
    }

    /// Open an existing redb database without creating one.
    ///
    /// Fails if the file is missing or is not a valid redb database. Used
    /// for seed snapshots, which must already hold data.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the file cannot be opened as a redb
    /// database.
    pub fn open_existing(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let db = Database::open(path).map_err(|e| StorageError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
            scratch: None,
        })
    }

    /// Create a fresh database in a private temporary directory.
    ///
    /// The directory and the database file are removed when the last clone
    /// of the backend is dropped, so every process start begins empty.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the temporary directory or the
    /// database cannot be created.
    pub fn ephemeral() -> Result<Self, StorageError> {
        let scratch = tempfile::Builder::new()
            .prefix("slate-store-")
            .tempdir()
            .map_err(|e| StorageError::Open {
                path: std::env::temp_dir().display().to_string(),
                reason: e.to_string(),
            })?;
        let path = scratch.path().join(EPHEMERAL_FILE);
        let db = Database::create(&path).map_err(|e| StorageError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        tracing::debug!(path = %path.display(), "opened ephemeral redb store");

        Ok(Self {
            db: Arc::new(db),
            path,
            scratch: Some(Arc::new(scratch)),
        })
    }

    /// Return the filesystem path of this database.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a blocking closure against the database on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StorageError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        join(tokio::task::spawn_blocking(move || f(&db))).await
    }
}

async fn join<T>(
    handle: impl Future<Output = Result<Result<T, StorageError>, tokio::task::JoinError>>,
) -> Result<T, StorageError> {
    handle.await.map_err(|e| StorageError::Transaction {
        reason: format!("blocking task panicked: {e}"),
    })?
}

fn txn_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Transaction {
        reason: e.to_string(),
    }
}

fn table_err(bucket: &str, e: &TableError) -> StorageError {
    StorageError::MissingTable {
        name: format!("{bucket}: {e}"),
    }
}

#[async_trait::async_trait]
impl StorageBackend for RedbBackend {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let bucket = bucket.to_owned();
        let key = key.to_owned();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(txn_err)?;
            let table = match txn.open_table(table(&bucket)) {
                Ok(t) => t,
                Err(TableError::TableDoesNotExist(_)) => return Ok(None),
                Err(e) => return Err(table_err(&bucket, &e)),
            };
            let value = table
                .get(key.as_str())
                .map_err(|e| StorageError::Read {
                    bucket: bucket.clone(),
                    key: key.clone(),
                    reason: e.to_string(),
                })?
                .map(|v| v.value().to_vec());
            Ok(value)
        })
        .await
    }

    async fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let bucket = bucket.to_owned();
        let key = key.to_owned();
        let value = value.to_vec();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(txn_err)?;
            {
                let mut t = txn
                    .open_table(table(&bucket))
                    .map_err(|e| table_err(&bucket, &e))?;
                t.insert(key.as_str(), value.as_slice())
                    .map_err(|e| StorageError::Write {
                        bucket: bucket.clone(),
                        key: key.clone(),
                        reason: e.to_string(),
                    })?;
            }
            txn.commit().map_err(txn_err)
        })
        .await
    }

    async fn replace(&self, bucket: &str, key: &str, value: &[u8]) -> Result<bool, StorageError> {
        let bucket = bucket.to_owned();
        let key = key.to_owned();
        let value = value.to_vec();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(txn_err)?;
            let write_err = |e: redb::StorageError| StorageError::Write {
                bucket: bucket.clone(),
                key: key.clone(),
                reason: e.to_string(),
            };
            let replaced = {
                let mut t = txn
                    .open_table(table(&bucket))
                    .map_err(|e| table_err(&bucket, &e))?;
                let present = t.get(key.as_str()).map_err(write_err)?.is_some();
                if present {
                    t.insert(key.as_str(), value.as_slice()).map_err(write_err)?;
                }
                present
            };
            if replaced {
                txn.commit().map_err(txn_err)?;
            } else {
                txn.abort().map_err(txn_err)?;
            }
            Ok(replaced)
        })
        .await
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let bucket = bucket.to_owned();
        let key = key.to_owned();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(txn_err)?;
            {
                let mut t = txn
                    .open_table(table(&bucket))
                    .map_err(|e| table_err(&bucket, &e))?;
                // remove() is idempotent and returns Ok(None) if the key doesn't exist.
                t.remove(key.as_str()).map_err(|e| StorageError::Delete {
                    bucket: bucket.clone(),
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
            }
            txn.commit().map_err(txn_err)
        })
        .await
    }

    async fn scan(&self, bucket: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let bucket = bucket.to_owned();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(txn_err)?;
            let t = match txn.open_table(table(&bucket)) {
                Ok(t) => t,
                Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
                Err(e) => return Err(table_err(&bucket, &e)),
            };
            read_all(&t, &bucket)
        })
        .await
    }

    async fn count(&self, bucket: &str) -> Result<usize, StorageError> {
        let bucket = bucket.to_owned();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(txn_err)?;
            let t = match txn.open_table(table(&bucket)) {
                Ok(t) => t,
                Err(TableError::TableDoesNotExist(_)) => return Ok(0),
                Err(e) => return Err(table_err(&bucket, &e)),
            };
            let list_err = |e: redb::StorageError| StorageError::List {
                bucket: bucket.clone(),
                reason: e.to_string(),
            };
            let mut n = 0usize;
            for item in t.iter().map_err(list_err)? {
                item.map_err(list_err)?;
                n = n.saturating_add(1);
            }
            Ok(n)
        })
        .await
    }

    async fn buckets(&self) -> Result<Vec<String>, StorageError> {
        self.blocking(|db| {
            let txn = db.begin_read().map_err(txn_err)?;
            let names = txn
                .list_tables()
                .map_err(|e| StorageError::List {
                    bucket: "*".to_owned(),
                    reason: e.to_string(),
                })?
                .map(|h| h.name().to_owned())
                .collect();
            Ok(names)
        })
        .await
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        let bucket = bucket.to_owned();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(txn_err)?;
            {
                // Opening a table in a write txn creates it if missing.
                let _t = txn
                    .open_table(table(&bucket))
                    .map_err(|e| table_err(&bucket, &e))?;
            }
            txn.commit().map_err(txn_err)
        })
        .await
    }

    async fn snapshot(&self) -> Result<Snapshot, StorageError> {
        self.blocking(|db| {
            let txn = db.begin_read().map_err(txn_err)?;
            let names: Vec<String> = txn
                .list_tables()
                .map_err(|e| StorageError::List {
                    bucket: "*".to_owned(),
                    reason: e.to_string(),
                })?
                .map(|h| h.name().to_owned())
                .collect();

            let mut snapshot = Snapshot::new();
            for name in names {
                let t = txn
                    .open_table(table(&name))
                    .map_err(|e| table_err(&name, &e))?;
                let pairs = read_all(&t, &name)?;
                snapshot.insert(name, pairs.into_iter().collect());
            }
            Ok(snapshot)
        })
        .await
    }

    async fn restore(&self, snapshot: Snapshot) -> Result<(), StorageError> {
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(txn_err)?;
            for (bucket, pairs) in &snapshot {
                let mut t = txn
                    .open_table(table(bucket))
                    .map_err(|e| table_err(bucket, &e))?;
                for (key, value) in pairs {
                    t.insert(key.as_str(), value.as_slice())
                        .map_err(|e| StorageError::Write {
                            bucket: bucket.clone(),
                            key: key.clone(),
                            reason: e.to_string(),
                        })?;
                }
            }
            // Any error above drops `txn` uncommitted, which rolls it back.
            txn.commit().map_err(txn_err)
        })
        .await
    }
}

/// Copy every pair out of a table while its transaction is still open.
fn read_all<T>(t: &T, bucket: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let list_err = |e: redb::StorageError| StorageError::List {
        bucket: bucket.to_owned(),
        reason: e.to_string(),
    };
    let mut pairs = Vec::new();
    for item in t.iter().map_err(list_err)? {
        let (k, v) = item.map_err(list_err)?;
        pairs.push((k.value().to_owned(), v.value().to_vec()));
    }
    Ok(pairs)
}
