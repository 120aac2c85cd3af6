//! Error types and the crate-wide Result alias.

/// Crate-wide result type. Components attach context at operation
/// boundaries with `anyhow::Context`.
pub type Result<T> = anyhow::Result<T>;

/// Errors raised by the durable store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The database could not be opened or its schema prepared. Fatal at
    /// startup: the process exits non-zero.
    #[error("failed to open database at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("schema migration failed: {0}")]
    Migrate(#[source] sqlx::Error),
}

/// Errors raised while extracting tracking fields from a cluster object.
///
/// Extraction failures never change stored state; the offending callback
/// is logged and dropped.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("object has no uid")]
    MissingUid,

    #[error("object has no name")]
    MissingName,
}
