//! Identity store: the SQLite-backed record of images, faces and clusters.
//!
//! Every operation runs under a single mutex guarding the connection, so at
//! most one read or write touches the database at a time. The store also
//! remembers the face order of the last [`IdentityStore::get_all_embeddings`]
//! call, which [`IdentityStore::apply_cluster_labels`] aligns against.

mod schema;
pub mod clusters;
pub mod faces;
pub mod images;

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};

pub use clusters::ClusterSummary;
pub use faces::{BoundingBox, FaceWithImage};
pub use images::Image;
pub use schema::{SCHEMA, SCHEMA_VERSION};

struct StoreInner {
    conn: Connection,
    /// Face ids in the order returned by the last embedding snapshot.
    snapshot: Vec<i64>,
}

pub struct IdentityStore {
    inner: Mutex<StoreInner>,
}

impl IdentityStore {
    /// Open (or create) the database file at `path` and bring the schema up.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory store, used by tests and throwaway runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize(&conn)?;
        Ok(Self {
            inner: Mutex::new(StoreInner {
                conn,
                snapshot: Vec::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // A panic while holding the lock cannot leave a half-applied
        // transaction behind, so the connection is still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn initialize(conn: &Connection) -> Result<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version != 0 && version != SCHEMA_VERSION {
        return Err(Error::SchemaVersion {
            found: version,
            expected: SCHEMA_VERSION,
        });
    }

    conn.execute_batch(SCHEMA)?;
    if version == 0 {
        conn.execute_batch(&format!("PRAGMA user_version = {};", SCHEMA_VERSION))?;
    }
    Ok(())
}
