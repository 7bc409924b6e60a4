//! In-process implementation of the storage traits.
//!
//! Behaves like a small document store: indexes are kept by name and report
//! conflicts the way the real stores do, unique indexes suppress duplicate
//! inserts, and TTL indexes hide expired documents. Failures can be injected
//! and calls are counted, which is what the tests built on it need.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{ConflictReason, DatabaseError, IndexError};
use crate::indexes::{IndexSpec, IndexStore};
use crate::{Collection, Connection, Database};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn field_text(document: &Value, field: &str) -> Option<String> {
    match document.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

pub struct MemoryCollection {
    name: String,
    indexes: Mutex<Vec<IndexSpec>>,
    documents: Mutex<Vec<Value>>,
    ensure_failures: Mutex<VecDeque<IndexError>>,
    drop_failures: Mutex<VecDeque<IndexError>>,
    unstructured_errors: bool,
    available: AtomicBool,
    closed: AtomicBool,
    refreshes: AtomicUsize,
    drops: AtomicUsize,
}

impl MemoryCollection {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            indexes: Mutex::default(),
            documents: Mutex::default(),
            ensure_failures: Mutex::default(),
            drop_failures: Mutex::default(),
            unstructured_errors: false,
            available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            refreshes: AtomicUsize::new(0),
            drops: AtomicUsize::new(0),
        }
    }

    /// Report index conflicts as plain messages, like stores without error codes do.
    pub fn with_unstructured_errors(mut self) -> Self {
        self.unstructured_errors = true;
        self
    }

    /// Queue an error for the next `ensure_index` call. Queued errors are
    /// returned in order before any real work is done.
    pub fn fail_next_ensure(&self, error: IndexError) {
        lock(&self.ensure_failures).push_back(error);
    }

    pub fn fail_next_drop(&self, error: IndexError) {
        lock(&self.drop_failures).push_back(error);
    }

    /// While unavailable, refreshes and queries fail.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn indexes(&self) -> Vec<IndexSpec> {
        lock(&self.indexes).clone()
    }

    pub fn documents(&self) -> Vec<Value> {
        lock(&self.documents).clone()
    }

    pub fn dropped_indexes(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_usable(&self) -> Result<(), DatabaseError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DatabaseError::Closed(self.name.clone()));
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(DatabaseError::Unavailable(format!(
                "collection {} is unreachable",
                self.name
            )));
        }
        Ok(())
    }

    fn conflict(&self, reason: ConflictReason, message: String) -> IndexError {
        if self.unstructured_errors {
            IndexError::other(message)
        } else {
            IndexError::conflict(reason, message)
        }
    }

    fn is_expired(&self, document: &Value, now: OffsetDateTime) -> bool {
        lock(&self.indexes)
            .iter()
            .filter_map(IndexSpec::ttl_field)
            .any(|(field, ttl)| {
                field_text(document, field)
                    .and_then(|created| OffsetDateTime::parse(&created, &Rfc3339).ok())
                    .is_some_and(|created| created + ttl < now)
            })
    }
}

#[async_trait]
impl Connection for MemoryCollection {
    async fn refresh(&self) -> Result<(), DatabaseError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        self.check_usable()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl IndexStore for MemoryCollection {
    async fn ensure_index(&self, spec: &IndexSpec) -> Result<(), IndexError> {
        if let Some(error) = lock(&self.ensure_failures).pop_front() {
            return Err(error);
        }

        let mut indexes = lock(&self.indexes);
        match indexes.iter().find(|existing| existing.name == spec.name) {
            Some(existing) if existing == spec => Ok(()),
            Some(_) => Err(self.conflict(
                ConflictReason::DifferentOptions,
                format!(
                    "Index with name: {} already exists with different options",
                    spec.name
                ),
            )),
            None => {
                indexes.push(spec.clone());
                Ok(())
            }
        }
    }

    async fn drop_index(&self, name: &str) -> Result<(), IndexError> {
        if let Some(error) = lock(&self.drop_failures).pop_front() {
            return Err(error);
        }

        lock(&self.indexes).retain(|existing| existing.name != name);
        self.drops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Collection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find_any(&self) -> Result<Option<Value>, DatabaseError> {
        self.check_usable()?;
        let now = OffsetDateTime::now_utc();

        Ok(lock(&self.documents)
            .iter()
            .find(|document| !self.is_expired(document, now))
            .cloned())
    }

    async fn find_one(&self, field: &str, value: &str) -> Result<Option<Value>, DatabaseError> {
        self.check_usable()?;
        let now = OffsetDateTime::now_utc();

        Ok(lock(&self.documents)
            .iter()
            .filter(|document| !self.is_expired(document, now))
            .find(|document| field_text(document, field).as_deref() == Some(value))
            .cloned())
    }

    async fn insert(&self, document: Value) -> Result<(), DatabaseError> {
        self.check_usable()?;

        let unique_keys: Vec<Vec<String>> = lock(&self.indexes)
            .iter()
            .filter(|spec| spec.unique)
            .map(|spec| spec.keys.clone())
            .collect();

        let now = OffsetDateTime::now_utc();
        let mut documents = lock(&self.documents);
        documents.retain(|existing| !self.is_expired(existing, now));
        let duplicate = unique_keys.iter().any(|keys| {
            documents.iter().any(|existing| {
                keys.iter()
                    .all(|key| field_text(existing, key) == field_text(&document, key))
            })
        });
        if !duplicate {
            documents.push(document);
        }
        Ok(())
    }
}

pub struct MemoryDatabase {
    collections: Mutex<HashMap<String, Arc<MemoryCollection>>>,
    opened: AtomicUsize,
    available: AtomicBool,
    closed: AtomicBool,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            collections: Mutex::default(),
            opened: AtomicUsize::new(0),
            available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    /// Pre-register a collection, e.g. one with injected failures.
    pub fn with_collection(self, collection: MemoryCollection) -> Self {
        lock(&self.collections).insert(collection.name.clone(), Arc::new(collection));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<MemoryCollection>> {
        lock(&self.collections).get(name).cloned()
    }

    /// Number of `collection` calls served so far.
    pub fn collections_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn collection(&self, name: &str) -> Result<Arc<dyn Collection>, DatabaseError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(DatabaseError::Unavailable("database is unreachable".to_owned()));
        }

        let collection = lock(&self.collections)
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(MemoryCollection::new(name)))
            .clone();
        Ok(collection)
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DatabaseError::Closed("database".to_owned()));
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(DatabaseError::Unavailable("ping failed".to_owned()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
