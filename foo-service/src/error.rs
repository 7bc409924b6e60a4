use common_database::{DatabaseError, ReconcileError};
use health::HealthError;
use thiserror::Error;

/// Errors that abort the dependency assembly. None of them is retried: the
/// process exits and is restarted by its supervisor.
#[derive(Error, Debug)]
pub enum DependencyError {
    #[error("failed to connect to the database: {0}")]
    Database(#[source] DatabaseError),
    #[error("failed to build the {client} client: {error}")]
    Client {
        client: &'static str,
        #[source]
        error: ClientError,
    },
    #[error("failed to reconcile indexes for {dal}: {error}")]
    Indexes {
        dal: &'static str,
        #[source]
        error: ReconcileError,
    },
    #[error("failed to open the collection for {dal}: {error}")]
    Collection {
        dal: &'static str,
        #[source]
        error: DatabaseError,
    },
    #[error("failed to start health checks: {0}")]
    Health(#[from] HealthError),
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid host {host}: {error}")]
    InvalidHost {
        host: String,
        #[source]
        error: url::ParseError,
    },
    #[error("{0} is not an http(s) url")]
    UnsupportedScheme(String),
    #[error("request for bar {0} failed: {1}")]
    RequestFailed(String, String),
}

#[derive(Error, Debug)]
pub enum DalError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("stored document is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("failed to format expiry timestamp: {0}")]
    Timestamp(#[from] time::error::Format),
}
