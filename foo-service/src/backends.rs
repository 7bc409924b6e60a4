use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common_database::postgres::{DatabaseTimeouts, PgDatabase, DEFAULT_TIMEOUTS};
use common_database::{Database, DatabaseError};
use health::{CheckError, Checkable, HealthCheck};
use serde_json::{json, Value};
use tracing::info;

use crate::client::FooClient;
use crate::config::{Config, DatabaseConfig};
use crate::error::DependencyError;

/// Opens the database. Split out so assembly can run against other backends.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &DatabaseConfig) -> Result<Arc<dyn Database>, DatabaseError>;
}

pub struct PostgresConnector;

#[async_trait]
impl Connector for PostgresConnector {
    async fn connect(&self, config: &DatabaseConfig) -> Result<Arc<dyn Database>, DatabaseError> {
        let timeouts = DatabaseTimeouts {
            acquire_timeout: config.database_timeout_sec.0,
            ..DEFAULT_TIMEOUTS
        };
        let database =
            PgDatabase::connect(&config.database_url, config.max_pg_connections, timeouts).await?;

        Ok(Arc::new(database))
    }
}

/// Liveness of the raw database connection.
pub struct DatabaseCheck {
    database: Arc<dyn Database>,
}

impl DatabaseCheck {
    pub fn new(database: Arc<dyn Database>) -> Self {
        Self { database }
    }
}

#[async_trait]
impl Checkable for DatabaseCheck {
    async fn status(&self) -> Result<Value, CheckError> {
        match self.database.ping().await {
            Ok(()) => Ok(json!({"status": "ok"})),
            Err(err) => Err(CheckError::new(err.to_string())
                .with_details(json!({"status": "unreachable"}))),
        }
    }
}

/// Connections and clients shared by every DAL.
pub struct Backends {
    pub database: Arc<dyn Database>,
    pub foo_client: Arc<FooClient>,
}

impl Backends {
    /// Connect to the database, then build the API clients. The first failure
    /// is returned and nothing after it is attempted.
    pub async fn connect(
        config: &Config,
        connector: &dyn Connector,
    ) -> Result<Self, DependencyError> {
        let database = connector
            .connect(&config.database)
            .await
            .map_err(DependencyError::Database)?;
        info!("connected to the database");

        let foo_client = FooClient::new(
            config.foo_api_host.as_str(),
            config.service_name.as_str(),
        )
        .map_err(|error| DependencyError::Client {
            client: "foo",
            error,
        })?;

        Ok(Self {
            database,
            foo_client: Arc::new(foo_client),
        })
    }

    /// The database connection is fatal, the foo API only degrades the service.
    pub fn health_checks(&self, interval: Duration) -> Vec<HealthCheck> {
        vec![
            HealthCheck::new(
                "database",
                Arc::new(DatabaseCheck::new(self.database.clone())),
                interval,
            )
            .fatal(),
            HealthCheck::new("foo-client", self.foo_client.clone(), interval),
        ]
    }
}

#[cfg(test)]
mod tests {
    use common_database::memory::MemoryDatabase;

    use super::*;

    #[tokio::test]
    async fn database_check_follows_ping() {
        let database = Arc::new(MemoryDatabase::new());
        let check = DatabaseCheck::new(database.clone());

        assert_eq!(check.status().await.unwrap(), json!({"status": "ok"}));

        database.set_available(false);
        let err = check.status().await.unwrap_err();
        assert_eq!(err.details, Some(json!({"status": "unreachable"})));
    }
}
