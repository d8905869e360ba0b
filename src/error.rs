//! Errors raised by the identity store and the clustering engine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("image {0} does not exist")]
    UnknownImage(i64),

    #[error("cluster {0} does not exist")]
    UnknownCluster(i64),

    #[error("embedding dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    /// Cluster labels must line up with the last embedding snapshot.
    #[error("got {found} cluster labels for {expected} faces")]
    LabelCountMismatch { expected: usize, found: usize },

    #[error("cluster {0} cannot be merged into itself")]
    InvalidMerge(i64),

    #[error("an indexing job is already running")]
    Busy,

    #[error("database schema version {found} is not supported (expected {expected})")]
    SchemaVersion { found: i64, expected: i64 },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
