//! Persistent record stores
//!
//! Engines persist through the [`RecordStore`] trait. Two implementations
//! ship here: [`MemoryStore`] for tests and short-lived tools, and
//! [`JsonFileStore`], one JSON file per record with an in-memory cache.
//! [`ObservableStore`] wraps either and notifies subscribers of mutations.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::{Result, TransferError};

/// A value that can be persisted under a string key
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Storage key
    fn key(&self) -> &str;
}

/// Equality match on one top-level field of a record's JSON form
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    /// Field name
    pub field: String,
    /// Required value
    pub value: Value,
}

impl Filter {
    /// Match records whose `field` equals `value`
    pub fn new(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    /// True if `record` satisfies the filter
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Serialization`] if the record cannot be
    /// converted to JSON.
    pub fn matches<R: Serialize>(&self, record: &R) -> Result<bool> {
        let value = serde_json::to_value(record)?;
        Ok(value.get(&self.field) == Some(&self.value))
    }
}

/// Crash-consistent per-call record persistence
#[async_trait]
pub trait RecordStore<R: Record>: Send + Sync {
    /// Insert a new record
    async fn create(&self, record: R) -> Result<R>;

    /// Fetch a record by key
    async fn get(&self, key: &str) -> Result<Option<R>>;

    /// Replace an existing record
    async fn update(&self, record: R) -> Result<R>;

    /// Delete a record; returns whether it existed
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Records matching `filter`
    async fn find(&self, filter: &Filter) -> Result<Vec<R>>;

    /// Every record, ordered by key
    async fn list(&self) -> Result<Vec<R>>;
}

#[async_trait]
impl<R: Record, S: RecordStore<R> + ?Sized> RecordStore<R> for Arc<S> {
    async fn create(&self, record: R) -> Result<R> {
        (**self).create(record).await
    }

    async fn get(&self, key: &str) -> Result<Option<R>> {
        (**self).get(key).await
    }

    async fn update(&self, record: R) -> Result<R> {
        (**self).update(record).await
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        (**self).remove(key).await
    }

    async fn find(&self, filter: &Filter) -> Result<Vec<R>> {
        (**self).find(filter).await
    }

    async fn list(&self) -> Result<Vec<R>> {
        (**self).list().await
    }
}

fn duplicate(key: &str) -> TransferError {
    TransferError::Validation(Cow::Owned(format!("record {key} already exists")))
}

fn sorted<R: Record>(mut records: Vec<R>) -> Vec<R> {
    records.sort_by(|a, b| a.key().cmp(b.key()));
    records
}

fn filtered<R: Record>(records: impl Iterator<Item = R>, filter: &Filter) -> Result<Vec<R>> {
    let mut matched = Vec::new();
    for record in records {
        if filter.matches(&record)? {
            matched.push(record);
        }
    }
    Ok(sorted(matched))
}

// ============================================================================
// In-memory store
// ============================================================================

/// Concurrent in-memory store
pub struct MemoryStore<R> {
    records: DashMap<String, R>,
}

impl<R> MemoryStore<R> {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Number of stored records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<R> Default for MemoryStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R: Record> RecordStore<R> for MemoryStore<R> {
    async fn create(&self, record: R) -> Result<R> {
        match self.records.entry(record.key().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(duplicate(record.key())),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<R>> {
        Ok(self.records.get(key).map(|entry| entry.value().clone()))
    }

    async fn update(&self, record: R) -> Result<R> {
        match self.records.get_mut(record.key()) {
            Some(mut entry) => {
                *entry = record.clone();
                Ok(record)
            }
            None => Err(TransferError::TransferNotFound(record.key().to_string())),
        }
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.records.remove(key).is_some())
    }

    async fn find(&self, filter: &Filter) -> Result<Vec<R>> {
        let snapshot: Vec<R> = self.records.iter().map(|e| e.value().clone()).collect();
        filtered(snapshot.into_iter(), filter)
    }

    async fn list(&self) -> Result<Vec<R>> {
        Ok(sorted(
            self.records.iter().map(|e| e.value().clone()).collect(),
        ))
    }
}

// ============================================================================
// JSON file store
// ============================================================================

/// One pretty-printed JSON file per record
///
/// Writes go to a temporary file that is renamed into place, so a crash
/// leaves either the old or the new version of a record.
pub struct JsonFileStore<R> {
    dir: PathBuf,
    cache: RwLock<HashMap<String, R>>,
}

impl<R: Record> JsonFileStore<R> {
    /// Open a store rooted at `dir`, creating it and loading existing records
    ///
    /// Files that fail to decode are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Io`] if the directory cannot be created or read.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let mut cache = HashMap::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let json = fs::read_to_string(&path).await?;
            match serde_json::from_str::<R>(&json) {
                Ok(record) => {
                    cache.insert(record.key().to_string(), record);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Skipping unreadable record: {}", e);
                }
            }
        }

        tracing::debug!(dir = %dir.display(), records = cache.len(), "Record store opened");
        Ok(Self {
            dir,
            cache: RwLock::new(cache),
        })
    }

    /// Directory holding the record files
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }

    async fn persist(&self, record: &R) -> Result<()> {
        let path = self.record_path(record.key());
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(record)?;
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl<R: Record> RecordStore<R> for JsonFileStore<R> {
    async fn create(&self, record: R) -> Result<R> {
        let mut cache = self.cache.write().await;
        if cache.contains_key(record.key()) {
            return Err(duplicate(record.key()));
        }
        self.persist(&record).await?;
        cache.insert(record.key().to_string(), record.clone());
        Ok(record)
    }

    async fn get(&self, key: &str) -> Result<Option<R>> {
        Ok(self.cache.read().await.get(key).cloned())
    }

    async fn update(&self, record: R) -> Result<R> {
        let mut cache = self.cache.write().await;
        if !cache.contains_key(record.key()) {
            return Err(TransferError::TransferNotFound(record.key().to_string()));
        }
        self.persist(&record).await?;
        cache.insert(record.key().to_string(), record.clone());
        Ok(record)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let mut cache = self.cache.write().await;
        if cache.remove(key).is_none() {
            return Ok(false);
        }
        match fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    async fn find(&self, filter: &Filter) -> Result<Vec<R>> {
        let cache = self.cache.read().await;
        filtered(cache.values().cloned(), filter)
    }

    async fn list(&self) -> Result<Vec<R>> {
        let cache = self.cache.read().await;
        Ok(sorted(cache.values().cloned().collect()))
    }
}

// ============================================================================
// Observer layer
// ============================================================================

/// Mutation notification
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent<R> {
    /// A record was inserted
    Created(R),
    /// A record was replaced
    Updated(R),
    /// The record with this key was deleted
    Removed(String),
}

type Listener<R> = Arc<dyn Fn(&StoreEvent<R>) + Send + Sync>;
type Listeners<R> = Arc<Mutex<HashMap<u64, Listener<R>>>>;

fn lock_listeners<R>(
    listeners: &Mutex<HashMap<u64, Listener<R>>>,
) -> MutexGuard<'_, HashMap<u64, Listener<R>>> {
    listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Active listener registration; dropping it detaches the listener
#[must_use = "dropping a subscription unsubscribes it"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Detach the listener
    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.detach.is_some())
            .finish()
    }
}

/// Store wrapper that notifies subscribers after each successful mutation
pub struct ObservableStore<R: Record> {
    inner: Arc<dyn RecordStore<R>>,
    listeners: Listeners<R>,
    next_id: AtomicU64,
}

impl<R: Record> ObservableStore<R> {
    /// Wrap `inner`
    pub fn new(inner: Arc<dyn RecordStore<R>>) -> Self {
        Self {
            inner,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a listener for mutations
    pub fn subscribe(&self, listener: impl Fn(&StoreEvent<R>) + Send + Sync + 'static) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock_listeners(&self.listeners).insert(id, Arc::new(listener));

        let listeners = Arc::downgrade(&self.listeners);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(listeners) = listeners.upgrade() {
                    lock_listeners(&listeners).remove(&id);
                }
            })),
        }
    }

    /// Number of attached listeners
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        lock_listeners(&self.listeners).len()
    }

    fn notify(&self, event: &StoreEvent<R>) {
        let listeners: Vec<Listener<R>> = lock_listeners(&self.listeners).values().cloned().collect();
        for listener in listeners {
            listener(event);
        }
    }
}

#[async_trait]
impl<R: Record> RecordStore<R> for ObservableStore<R> {
    async fn create(&self, record: R) -> Result<R> {
        let record = self.inner.create(record).await?;
        self.notify(&StoreEvent::Created(record.clone()));
        Ok(record)
    }

    async fn get(&self, key: &str) -> Result<Option<R>> {
        self.inner.get(key).await
    }

    async fn update(&self, record: R) -> Result<R> {
        let record = self.inner.update(record).await?;
        self.notify(&StoreEvent::Updated(record.clone()));
        Ok(record)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let removed = self.inner.remove(key).await?;
        if removed {
            self.notify(&StoreEvent::Removed(key.to_string()));
        }
        Ok(removed)
    }

    async fn find(&self, filter: &Filter) -> Result<Vec<R>> {
        self.inner.find(filter).await
    }

    async fn list(&self) -> Result<Vec<R>> {
        self.inner.list().await
    }
}
