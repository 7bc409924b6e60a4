//! JSONB document collections on PostgreSQL.
//!
//! Every collection is a table `(id BIGSERIAL, document JSONB)`. Indexes are
//! expression indexes over top-level document fields, named
//! `<collection>_<index>`; each carries its [`IndexSpec::fingerprint`] as the
//! index comment so an existing index can be compared with the desired one.
//! PostgreSQL has no TTL indexes: `expire_after` is part of the fingerprint and
//! expired documents are filtered out when reading and purged on insert.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Error as SqlxError;
use tracing::{debug, info};

use crate::error::{ConflictReason, DatabaseError, IndexError};
use crate::indexes::{IndexSpec, IndexStore};
use crate::{Collection, Connection, Database};

pub const DEFAULT_TIMEOUTS: DatabaseTimeouts = DatabaseTimeouts {
    statement_timeout: Duration::from_secs(5),
    acquire_timeout: Duration::from_secs(30),
    idle_timeout: Duration::from_secs(300), // Close idle connections after 5 minutes
    max_lifetime: Duration::from_secs(1800), // Force refresh every 30 minutes
};

#[derive(Debug, Clone, Copy)]
pub struct DatabaseTimeouts {
    pub statement_timeout: Duration,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

pub async fn get_pool_with_timeouts(
    url: &str,
    max_connections: u32,
    timeouts: DatabaseTimeouts,
) -> Result<PgPool, SqlxError> {
    let statement_ms = timeouts.statement_timeout.as_millis();

    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(timeouts.acquire_timeout)
        .test_before_acquire(true)
        .idle_timeout(timeouts.idle_timeout)
        .max_lifetime(timeouts.max_lifetime)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                // SET does not accept bind parameters
                sqlx::query(&format!("SET statement_timeout = '{statement_ms}ms'"))
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect(url)
        .await
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_literal(literal: &str) -> String {
    format!("'{}'", literal.replace('\'', "''"))
}

fn field_expression(field: &str) -> String {
    format!("(document->>{})", quote_literal(field))
}

fn create_index_sql(table: &str, index: &str, spec: &IndexSpec) -> String {
    let fields: Vec<String> = spec.keys.iter().map(|key| field_expression(key)).collect();

    format!(
        "CREATE {}INDEX {} ON {} ({})",
        if spec.unique { "UNIQUE " } else { "" },
        quote_ident(index),
        quote_ident(table),
        fields.join(", ")
    )
}

/// Extra WHERE conditions hiding documents older than their TTL. Documents
/// without the field never expire.
fn ttl_clause(ttls: &HashMap<String, (String, Duration)>) -> String {
    let mut fields: Vec<_> = ttls.values().collect();
    fields.sort();

    fields
        .into_iter()
        .map(|(field, ttl)| {
            format!(
                " AND COALESCE({}::timestamptz > now() - interval '{} seconds', true)",
                field_expression(field),
                ttl.as_secs()
            )
        })
        .collect()
}

/// Determines if a sqlx::Error reports a relation (here: an index) that already exists
pub fn is_duplicate_relation_error(error: &SqlxError) -> bool {
    match error {
        SqlxError::Database(db_error) => match db_error.code() {
            // 42P07 = duplicate_table, also raised for indexes
            Some(code) => code.as_ref() == "42P07",
            None => db_error.message().to_lowercase().contains("already exists"),
        },
        _ => false,
    }
}

/// Determines if a sqlx::Error represents a unique constraint violation
pub fn is_unique_violation_error(error: &SqlxError) -> bool {
    match error {
        SqlxError::Database(db_error) => match db_error.code() {
            // 23505 = unique_violation
            Some(code) => code.as_ref() == "23505",
            None => db_error
                .message()
                .to_lowercase()
                .contains("duplicate key value violates unique constraint"),
        },
        _ => false,
    }
}

fn query_error(command: &str) -> impl FnOnce(SqlxError) -> DatabaseError + '_ {
    move |error| DatabaseError::QueryError {
        command: command.to_owned(),
        error,
    }
}

fn index_error(command: &str) -> impl FnOnce(SqlxError) -> IndexError + '_ {
    move |error| IndexError::other(format!("{command} failed with: {error}"))
}

pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub async fn connect(
        url: &str,
        max_connections: u32,
        timeouts: DatabaseTimeouts,
    ) -> Result<Self, DatabaseError> {
        let pool = get_pool_with_timeouts(url, max_connections, timeouts)
            .await
            .map_err(|error| DatabaseError::ConnectionError { error })?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn collection(&self, name: &str) -> Result<Arc<dyn Collection>, DatabaseError> {
        let collection = PgCollection::open(self.pool.clone(), name).await?;
        Ok(Arc::new(collection))
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(query_error("ping"))?;
        Ok(())
    }

    async fn close(&self) {
        info!("closing database pool");
        self.pool.close().await
    }
}

/// A document collection backed by one table.
pub struct PgCollection {
    name: String,
    table: String,
    pool: PgPool,
    /// Index name -> (field, ttl) for every ensured index with `expire_after`.
    ttls: RwLock<HashMap<String, (String, Duration)>>,
}

impl PgCollection {
    /// Create the backing table if needed.
    pub async fn open(pool: PgPool, name: &str) -> Result<Self, DatabaseError> {
        let table = quote_ident(name);
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (id BIGSERIAL PRIMARY KEY, document JSONB NOT NULL)"
        ))
        .execute(&pool)
        .await
        .map_err(query_error("create table"))?;

        Ok(Self {
            name: name.to_owned(),
            table,
            pool,
            ttls: RwLock::default(),
        })
    }

    fn index_name(&self, name: &str) -> String {
        format!("{}_{}", self.name, name)
    }

    fn track_ttl(&self, spec: &IndexSpec) {
        let mut ttls = self.ttls.write().unwrap_or_else(PoisonError::into_inner);
        match spec.ttl_field() {
            Some((field, ttl)) => {
                ttls.insert(spec.name.clone(), (field.to_owned(), ttl));
            }
            None => {
                ttls.remove(&spec.name);
            }
        }
    }

    fn ttl_clause(&self) -> String {
        ttl_clause(&self.ttls.read().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl Connection for PgCollection {
    async fn refresh(&self) -> Result<(), DatabaseError> {
        // The pool tests connections before handing them out and replaces dead ones
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(query_error("refresh"))?;
        Ok(())
    }

    async fn close(&self) {
        // The pool belongs to PgDatabase, which closes it on shutdown
        debug!(collection = %self.name, "collection released");
    }
}

#[async_trait]
impl IndexStore for PgCollection {
    async fn ensure_index(&self, spec: &IndexSpec) -> Result<(), IndexError> {
        let index = self.index_name(&spec.name);
        let fingerprint = spec.fingerprint();

        let existing = sqlx::query_scalar::<_, Option<String>>(
            r#"
SELECT obj_description(c.oid, 'pg_class')
FROM pg_class c
WHERE c.relkind = 'i' AND c.relname = $1 AND pg_table_is_visible(c.oid)
            "#,
        )
        .bind(&index)
        .fetch_optional(&self.pool)
        .await
        .map_err(index_error("index lookup"))?;

        match existing {
            Some(Some(current)) if current == fingerprint => {
                self.track_ttl(spec);
                return Ok(());
            }
            Some(_) => {
                return Err(IndexError::conflict(
                    ConflictReason::DifferentOptions,
                    format!("index {index} already exists with different options"),
                ))
            }
            None => {}
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(index_error("begin transaction"))?;

        sqlx::query(&create_index_sql(&self.name, &index, spec))
            .execute(&mut *tx)
            .await
            .map_err(|error| {
                if is_duplicate_relation_error(&error) {
                    IndexError::conflict(
                        ConflictReason::DuplicateName,
                        format!("index {index} was created concurrently: {error}"),
                    )
                } else {
                    IndexError::other(format!("create index failed with: {error}"))
                }
            })?;

        sqlx::query(&format!(
            "COMMENT ON INDEX {} IS {}",
            quote_ident(&index),
            quote_literal(&fingerprint)
        ))
        .execute(&mut *tx)
        .await
        .map_err(index_error("comment on index"))?;

        tx.commit().await.map_err(index_error("commit"))?;

        self.track_ttl(spec);
        Ok(())
    }

    async fn drop_index(&self, name: &str) -> Result<(), IndexError> {
        let index = self.index_name(name);
        sqlx::query(&format!("DROP INDEX IF EXISTS {}", quote_ident(&index)))
            .execute(&self.pool)
            .await
            .map_err(index_error("drop index"))?;

        self.ttls
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        Ok(())
    }
}

#[async_trait]
impl Collection for PgCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find_any(&self) -> Result<Option<Value>, DatabaseError> {
        let query = format!(
            "SELECT document FROM {} WHERE true{} LIMIT 1",
            self.table,
            self.ttl_clause()
        );

        let document = sqlx::query_scalar::<_, Json<Value>>(&query)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("find_any"))?;

        Ok(document.map(|Json(document)| document))
    }

    async fn find_one(&self, field: &str, value: &str) -> Result<Option<Value>, DatabaseError> {
        let query = format!(
            "SELECT document FROM {} WHERE document->>$1 = $2{} LIMIT 1",
            self.table,
            self.ttl_clause()
        );

        let document = sqlx::query_scalar::<_, Json<Value>>(&query)
            .bind(field)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("find_one"))?;

        Ok(document.map(|Json(document)| document))
    }

    async fn insert(&self, document: Value) -> Result<(), DatabaseError> {
        // Expired rows would otherwise keep holding their unique keys
        let ttl_clause = self.ttl_clause();
        if !ttl_clause.is_empty() {
            sqlx::query(&format!(
                "DELETE FROM {} WHERE NOT (true{})",
                self.table, ttl_clause
            ))
            .execute(&self.pool)
            .await
            .map_err(query_error("purge expired"))?;
        }

        let query = format!("INSERT INTO {} (document) VALUES ($1)", self.table);

        match sqlx::query(&query)
            .bind(Json(document))
            .execute(&self.pool)
            .await
        {
            Ok(_) => Ok(()),
            Err(error) if is_unique_violation_error(&error) => {
                debug!(collection = %self.name, "document already stored");
                Ok(())
            }
            Err(error) => Err(query_error("insert")(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_and_literals_are_quoted() {
        assert_eq!(quote_ident("foo"), "\"foo\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn create_index_statement() {
        let spec = IndexSpec::new("unique-field", ["foo-field"]).unique();
        assert_eq!(
            create_index_sql("foo", "foo_unique-field", &spec),
            r#"CREATE UNIQUE INDEX "foo_unique-field" ON "foo" ((document->>'foo-field'))"#
        );

        let spec = IndexSpec::new("compound", ["a", "b"]);
        assert_eq!(
            create_index_sql("foo", "foo_compound", &spec),
            r#"CREATE INDEX "foo_compound" ON "foo" ((document->>'a'), (document->>'b'))"#
        );
    }

    #[test]
    fn ttl_clause_per_expiring_index() {
        let mut ttls = HashMap::new();
        assert_eq!(ttl_clause(&ttls), "");

        ttls.insert(
            "expiring-field".to_owned(),
            ("expires-after".to_owned(), Duration::from_secs(10)),
        );
        assert_eq!(
            ttl_clause(&ttls),
            " AND COALESCE((document->>'expires-after')::timestamptz > now() - interval '10 seconds', true)"
        );
    }

    #[test]
    fn non_database_errors_are_not_classified() {
        assert!(!is_duplicate_relation_error(&SqlxError::PoolTimedOut));
        assert!(!is_unique_violation_error(&SqlxError::RowNotFound));
    }
}
