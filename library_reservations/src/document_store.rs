//! Path-addressed JSON document store, the shared mutable state every client
//! writes to. Only single-path operations are atomic; anything spanning
//! several paths is coordinated by the lifecycle service.

pub use in_memory_document_store::InMemoryDocumentStore;
pub use postgres_document_store::{PostgresDocumentStore, PostgresDocumentStoreConfig};

use tokio::sync::broadcast;

use crate::retry::Transient;

mod in_memory_document_store;
mod postgres_document_store;

pub type Document = serde_json::Value;

/// Buffered change notifications per subscriber before it starts lagging
pub(crate) const CHANGE_FEED_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid path {0:?}")]
    InvalidPath(String),

    #[error("Precondition failed for {0}")]
    PreconditionFailed(String),

    #[error("Concurrent writes kept conflicting on {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to deserialize document: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("DatabaseFailure failure {0}")]
    DatabaseFailure(#[from] tokio_postgres::Error),

    #[error("Other error {0}")]
    Other(String),
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        match self {
            StoreError::Conflict(_) | StoreError::Unavailable(_) => true,
            StoreError::DatabaseFailure(err) => {
                err.is_closed()
                    || err.code().is_some_and(|code| {
                        // connection exceptions, serialization failures, deadlocks
                        code.code().starts_with("08")
                            || code.code() == "40001"
                            || code.code() == "40P01"
                    })
            }
            StoreError::InvalidPath(_)
            | StoreError::PreconditionFailed(_)
            | StoreError::DeserializationError(_)
            | StoreError::Other(_) => false,
        }
    }
}

/// Value of the path before and after a committed transaction.
/// `None` means the document does not exist.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionOutcome {
    pub previous: Option<Document>,
    pub current: Option<Document>,
}

/// Computes the next value of a document from its current one. Returning
/// `Ok(None)` deletes the document, returning an error aborts the transaction.
/// May run more than once when writers race.
pub type UpdateFn<'a> =
    dyn Fn(Option<&Document>) -> Result<Option<Document>, StoreError> + Send + Sync + 'a;

#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Document>, StoreError>;

    /// Overwrites the document at `path`
    async fn set(&self, path: &str, value: Document) -> Result<(), StoreError>;

    /// Removing a missing document is not an error
    async fn remove(&self, path: &str) -> Result<(), StoreError>;

    /// Documents stored directly below `parent`, keyed by their last segment
    async fn children(&self, parent: &str) -> Result<Vec<(String, Document)>, StoreError>;

    /// Distinct next segments of every document below `parent`
    async fn child_keys(&self, parent: &str) -> Result<Vec<String>, StoreError>;

    /// Atomic read-modify-write of a single document
    async fn transaction(
        &self,
        path: &str,
        update: &UpdateFn<'_>,
    ) -> Result<TransactionOutcome, StoreError>;

    /// Paths written from now on
    fn changes(&self) -> broadcast::Receiver<String>;
}

/// Builds a path out of segments, rejecting anything that would address a
/// different document than intended.
pub fn join_path(segments: &[&str]) -> Result<String, StoreError> {
    if segments
        .iter()
        .any(|segment| segment.is_empty() || segment.contains('/'))
    {
        return Err(StoreError::InvalidPath(segments.join("/")));
    }
    Ok(segments.join("/"))
}

pub(crate) fn validate_path(path: &str) -> Result<(), StoreError> {
    if path.is_empty() || path.split('/').any(str::is_empty) {
        Err(StoreError::InvalidPath(path.to_string()))
    } else {
        Ok(())
    }
}

pub(crate) fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

pub(crate) fn last_segment(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, key)| key).unwrap_or(path)
}
