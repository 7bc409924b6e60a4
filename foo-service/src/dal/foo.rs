use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common_database::{CacheStats, Collection, Database, IndexSpec, SmartHandle};
use health::{CheckError, Checkable};
use serde_json::{json, Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

use crate::client::{Bar, FooApi};
use crate::error::{DalError, DependencyError};

pub const FOO_COLLECTION_NAME: &str = "foo";

const FOO_FIELD: &str = "foo-field";
const EXPIRES_FIELD: &str = "expires-after";
const BAR_FIELD: &str = "bar";

/// Indexes the foo collection relies on: lookups by `foo-field`, and expiry
/// of cached bars `expires_after` their insertion.
pub fn indexes(expires_after: Duration) -> Vec<IndexSpec> {
    vec![
        IndexSpec::new("unique-field", [FOO_FIELD]).unique(),
        IndexSpec::new("expiring-field", [EXPIRES_FIELD]).expire_after(expires_after),
    ]
}

/// Read-through cache of bars fetched from the foo API.
pub struct FooDal {
    collection: SmartHandle<dyn Collection>,
    client: Arc<dyn FooApi>,
    stats: CacheStats,
}

impl FooDal {
    pub async fn new(
        database: &dyn Database,
        client: Arc<dyn FooApi>,
        refresh_interval: Duration,
        expires_after: Duration,
    ) -> Result<Self, DependencyError> {
        let collection = database
            .collection(FOO_COLLECTION_NAME)
            .await
            .map_err(|error| DependencyError::Collection { dal: "foo", error })?;

        let collection = SmartHandle::new(collection, refresh_interval);
        collection
            .ensure_indexes(&indexes(expires_after))
            .await
            .map_err(|error| DependencyError::Indexes { dal: "foo", error })?;

        Ok(Self {
            collection,
            client,
            stats: CacheStats::new(),
        })
    }

    pub async fn get_bar(&self, id: u64) -> Result<Bar, DalError> {
        let collection = self.collection.current();
        let key = id.to_string();

        if let Some(mut document) = collection.find_one(FOO_FIELD, &key).await? {
            if let Some(bar) = document.get_mut(BAR_FIELD).map(Value::take) {
                self.stats.record_hit();
                metrics::counter!("foo_dal_cache_total", "result" => "hit").increment(1);
                return Ok(serde_json::from_value(bar)?);
            }
        }

        self.stats.record_miss();
        metrics::counter!("foo_dal_cache_total", "result" => "miss").increment(1);

        let mut bar = self.client.get_bar(id).await?;
        bar.value += 1;

        let mut document = Map::new();
        document.insert(FOO_FIELD.to_owned(), Value::String(key));
        document.insert(
            EXPIRES_FIELD.to_owned(),
            Value::String(OffsetDateTime::now_utc().format(&Rfc3339)?),
        );
        document.insert(BAR_FIELD.to_owned(), serde_json::to_value(&bar)?);
        collection.insert(Value::Object(document)).await?;
        debug!(id, "cached bar");

        Ok(bar)
    }

    pub async fn close(&self) {
        self.collection.close().await
    }
}

#[async_trait]
impl Checkable for FooDal {
    /// Fetch any single document; an empty collection is healthy.
    async fn status(&self) -> Result<Value, CheckError> {
        let details = json!({
            "cache": self.stats.snapshot(),
            "refresh_failures": self.collection.refresh_failures(),
            "refresh_interval_secs": self.collection.refresh_interval().as_secs(),
        });

        match self.collection.current().find_any().await {
            Ok(_) => Ok(json!({"status": "ok", "dal": details})),
            Err(err) => Err(CheckError::new(err.to_string())
                .with_details(json!({"status": err.to_string(), "dal": details}))),
        }
    }
}
