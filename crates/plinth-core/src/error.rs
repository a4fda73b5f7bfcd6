//! Error types shared across the engine.

use thiserror::Error;

/// Unified error type for collection compilation and runtime operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A record lookup by id (or version selector) matched nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation was rejected by an access rule.
    #[error("access denied")]
    AccessDenied,

    /// Input data failed validation against the collection definition.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The collection definition itself is malformed.
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    /// No collection with this name is registered.
    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    /// The named relation does not exist on the collection.
    #[error("unknown relation {relation} on collection {collection}")]
    UnknownRelation {
        collection: String,
        relation: String,
    },

    /// A lifecycle hook returned an error.
    #[error("hook failed: {0}")]
    Hook(String),

    /// Error surfaced by the storage driver.
    #[error("storage error: {0}")]
    Sql(#[from] plinth_sql::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
