//! Idempotent index reconciliation.
//!
//! Each [`IndexSpec`] goes through [`upsert_index`]: ensure it, and if the
//! store reports a conflicting definition under the same name, drop the old
//! index and ensure the new one exactly once. Anything else is returned as is.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{IndexError, ReconcileError};

/// Desired definition of a named index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Vec<String>,
    pub unique: bool,
    pub expire_after: Option<Duration>,
}

impl IndexSpec {
    pub fn new<S: Into<String>>(name: &str, keys: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.to_owned(),
            keys: keys.into_iter().map(Into::into).collect(),
            unique: false,
            expire_after: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn expire_after(mut self, ttl: Duration) -> Self {
        self.expire_after = Some(ttl);
        self
    }

    /// The timestamp field and lifetime of an expiring index. Only
    /// single-field indexes expire documents.
    pub fn ttl_field(&self) -> Option<(&str, Duration)> {
        match (self.keys.as_slice(), self.expire_after) {
            ([field], Some(ttl)) => Some((field.as_str(), ttl)),
            _ => None,
        }
    }

    /// Canonical text form of the definition. Two specs with the same
    /// fingerprint describe the same index.
    pub fn fingerprint(&self) -> String {
        let mut fingerprint = format!("keys={}", self.keys.join(","));
        if self.unique {
            fingerprint.push_str(";unique");
        }
        if let Some(ttl) = self.expire_after {
            fingerprint.push_str(&format!(";expire_after={}s", ttl.as_secs()));
        }
        fingerprint
    }
}

/// Index management on a collection.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Create the index if absent. Succeeds without changes if an identical
    /// index exists; reports a conflict if a different one holds the name.
    async fn ensure_index(&self, spec: &IndexSpec) -> Result<(), IndexError>;

    async fn drop_index(&self, name: &str) -> Result<(), IndexError>;
}

/// Ensure `spec` exists, replacing a conflicting index of the same name.
pub async fn upsert_index<S>(store: &S, spec: &IndexSpec) -> Result<(), ReconcileError>
where
    S: IndexStore + ?Sized,
{
    let error = match store.ensure_index(spec).await {
        Ok(()) => return Ok(()),
        Err(error) => error,
    };

    let Some(reason) = error.conflict_reason() else {
        return Err(ReconcileError::Ensure {
            name: spec.name.clone(),
            error,
        });
    };

    warn!(
        index = %spec.name,
        %reason,
        "index already exists with a different definition, replacing"
    );

    store
        .drop_index(&spec.name)
        .await
        .map_err(|error| ReconcileError::Drop {
            name: spec.name.clone(),
            error,
        })?;

    store
        .ensure_index(spec)
        .await
        .map_err(|error| ReconcileError::Recreate {
            name: spec.name.clone(),
            error,
        })
}

/// Reconcile `specs` in order, stopping at the first failure.
pub async fn ensure_indexes<S>(store: &S, specs: &[IndexSpec]) -> Result<(), ReconcileError>
where
    S: IndexStore + ?Sized,
{
    for spec in specs {
        debug!(index = %spec.name, "ensuring index");
        upsert_index(store, spec).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConflictReason;
    use crate::memory::MemoryCollection;

    fn unique_field() -> IndexSpec {
        IndexSpec::new("unique-field", ["foo-field"]).unique()
    }

    #[test]
    fn fingerprint_covers_every_option() {
        let spec = IndexSpec::new("expiring", ["a", "b"])
            .unique()
            .expire_after(Duration::from_secs(10));
        assert_eq!(spec.fingerprint(), "keys=a,b;unique;expire_after=10s");
        assert_eq!(IndexSpec::new("plain", ["a"]).fingerprint(), "keys=a");
    }

    #[test]
    fn only_single_field_indexes_expire() {
        let ttl = Duration::from_secs(10);
        assert_eq!(
            IndexSpec::new("expiring", ["created"]).expire_after(ttl).ttl_field(),
            Some(("created", ttl))
        );
        assert_eq!(
            IndexSpec::new("compound", ["created", "id"])
                .expire_after(ttl)
                .ttl_field(),
            None
        );
        assert_eq!(IndexSpec::new("plain", ["created"]).ttl_field(), None);
    }

    #[tokio::test]
    async fn ensuring_twice_is_a_noop() {
        let collection = MemoryCollection::new("foo");

        upsert_index(&collection, &unique_field()).await.unwrap();
        upsert_index(&collection, &unique_field()).await.unwrap();

        assert_eq!(collection.indexes(), vec![unique_field()]);
        assert_eq!(collection.dropped_indexes(), 0);
    }

    #[tokio::test]
    async fn conflicting_definition_is_replaced_once() {
        let collection = MemoryCollection::new("foo");
        upsert_index(&collection, &unique_field()).await.unwrap();

        let replacement = IndexSpec::new("unique-field", ["bar-field"]).unique();
        upsert_index(&collection, &replacement).await.unwrap();

        assert_eq!(collection.indexes(), vec![replacement]);
        assert_eq!(collection.dropped_indexes(), 1);
    }

    #[tokio::test]
    async fn unstructured_conflicts_are_replaced_too() {
        let collection = MemoryCollection::new("foo").with_unstructured_errors();
        upsert_index(&collection, &unique_field()).await.unwrap();

        let replacement = IndexSpec::new("unique-field", ["foo-field"]);
        upsert_index(&collection, &replacement).await.unwrap();

        assert_eq!(collection.indexes(), vec![replacement]);
        assert_eq!(collection.dropped_indexes(), 1);
    }

    #[tokio::test]
    async fn unknown_failures_are_not_retried() {
        let collection = MemoryCollection::new("foo");
        collection.fail_next_ensure(IndexError::other("not authorized"));

        let err = upsert_index(&collection, &unique_field())
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Ensure { .. }));
        assert_eq!(err.index_name(), "unique-field");
        assert_eq!(collection.dropped_indexes(), 0);
        assert!(collection.indexes().is_empty());
    }

    #[tokio::test]
    async fn failed_recreate_is_fatal() {
        let collection = MemoryCollection::new("foo");
        collection.fail_next_ensure(IndexError::conflict(
            ConflictReason::DuplicateName,
            "duplicate",
        ));
        collection.fail_next_ensure(IndexError::other("disk full"));

        let err = upsert_index(&collection, &unique_field())
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Recreate { .. }));
        assert_eq!(collection.dropped_indexes(), 1);
    }

    #[tokio::test]
    async fn failed_drop_is_fatal() {
        let collection = MemoryCollection::new("foo");
        collection.fail_next_ensure(IndexError::conflict(
            ConflictReason::DifferentOptions,
            "conflict",
        ));
        collection.fail_next_drop(IndexError::other("index is in use"));

        let err = upsert_index(&collection, &unique_field())
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Drop { .. }));
    }

    #[tokio::test]
    async fn ensure_indexes_stops_at_first_failure() {
        let collection = MemoryCollection::new("foo");
        collection.fail_next_ensure(IndexError::other("boom"));

        let specs = vec![
            unique_field(),
            IndexSpec::new("expiring-field", ["expires-after"])
                .expire_after(Duration::from_secs(10)),
        ];
        let err = ensure_indexes(&collection, &specs).await.unwrap_err();

        assert_eq!(err.index_name(), "unique-field");
        assert!(collection.indexes().is_empty());
    }
}
