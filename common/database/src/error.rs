use std::fmt;

use thiserror::Error;

/// Enumeration of errors for operations on a database or collection.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("collection {0} is closed")]
    Closed(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Why an index could not be created as requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// An index with this name exists with different keys or options.
    DifferentOptions,
    /// The store refused to create a second index under an existing name.
    DuplicateName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexErrorKind {
    Conflict(ConflictReason),
    /// Any other failure. Stores that cannot classify their errors report
    /// everything here and let the reconciler inspect the message.
    Other,
}

/// Error reported by an [`IndexStore`](crate::IndexStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct IndexError {
    pub kind: IndexErrorKind,
    pub message: String,
}

// Messages the document stores we replaced used for the two conflict classes.
const DIFFERENT_OPTIONS_MESSAGE: &str = "already exists with different options";
const DUPLICATE_NAME_MESSAGE: &str = "Trying to create an index with same name";

impl IndexError {
    pub fn conflict(reason: ConflictReason, message: impl Into<String>) -> Self {
        Self {
            kind: IndexErrorKind::Conflict(reason),
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: IndexErrorKind::Other,
            message: message.into(),
        }
    }

    /// The conflict class of this error, if any. Structured kinds win; an
    /// unclassified error is only a conflict if its message matches one of the
    /// known conflict messages.
    pub fn conflict_reason(&self) -> Option<ConflictReason> {
        match self.kind {
            IndexErrorKind::Conflict(reason) => Some(reason),
            IndexErrorKind::Other if self.message.contains(DIFFERENT_OPTIONS_MESSAGE) => {
                Some(ConflictReason::DifferentOptions)
            }
            IndexErrorKind::Other if self.message.contains(DUPLICATE_NAME_MESSAGE) => {
                Some(ConflictReason::DuplicateName)
            }
            IndexErrorKind::Other => None,
        }
    }
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictReason::DifferentOptions => f.write_str("different options"),
            ConflictReason::DuplicateName => f.write_str("duplicate name"),
        }
    }
}

/// Errors returned while reconciling an index. All of them are fatal at
/// construction time.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("failed to ensure index {name}: {error}")]
    Ensure { name: String, error: IndexError },
    #[error("failed to remove old index {name}: {error}")]
    Drop { name: String, error: IndexError },
    #[error("failed to add new index {name}: {error}")]
    Recreate { name: String, error: IndexError },
}

impl ReconcileError {
    pub fn index_name(&self) -> &str {
        match self {
            ReconcileError::Ensure { name, .. }
            | ReconcileError::Drop { name, .. }
            | ReconcileError::Recreate { name, .. } => name,
        }
    }
}
