//! Data-access building blocks shared by the service DALs.
//!
//! A DAL wraps one [`Collection`] in a [`SmartHandle`] so the underlying
//! session is re-validated at most once per refresh window, declares the
//! [`IndexSpec`]s it relies on and reconciles them at construction time, and
//! keeps [`CacheStats`] for its read-through lookups.
//!
//! Two backends implement the storage traits: [`postgres`] (JSONB document
//! collections on a `sqlx` pool) and [`memory`] (in-process, used in tests).

mod cache_stats;
mod error;
pub mod indexes;
pub mod memory;
pub mod postgres;
mod smart_handle;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

pub use cache_stats::{CacheSnapshot, CacheStats};
pub use error::{ConflictReason, DatabaseError, IndexError, IndexErrorKind, ReconcileError};
pub use indexes::{IndexSpec, IndexStore};
pub use smart_handle::SmartHandle;

/// The refresh/close primitive a [`SmartHandle`] drives.
///
/// Implementations must tolerate `refresh` being called concurrently with any
/// other method, including another `refresh`: the handle does not serialize
/// refresh calls, it only rate-limits them.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Re-validate the session, reconnecting if needed. Should be cheap, a ping.
    async fn refresh(&self) -> Result<(), DatabaseError>;

    async fn close(&self);
}

/// A named set of JSON documents with the handful of queries DALs need.
#[async_trait]
pub trait Collection: Connection + IndexStore {
    fn name(&self) -> &str;

    /// Fetch any single document, `None` if the collection is empty.
    async fn find_any(&self) -> Result<Option<Value>, DatabaseError>;

    /// Fetch the first document whose top-level `field` equals `value` as text.
    async fn find_one(&self, field: &str, value: &str) -> Result<Option<Value>, DatabaseError>;

    /// Store a document. Unique index violations are not errors: the document
    /// is already present.
    async fn insert(&self, document: Value) -> Result<(), DatabaseError>;
}

/// A connected backend that hands out collections.
#[async_trait]
pub trait Database: Send + Sync {
    async fn collection(&self, name: &str) -> Result<Arc<dyn Collection>, DatabaseError>;

    /// Round-trip to the backend.
    async fn ping(&self) -> Result<(), DatabaseError>;

    async fn close(&self);
}
