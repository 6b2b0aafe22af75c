//! Persistence of step records and the sync checkpoint.
//!
//! Hosts provide a [`KeyValueStore`]; [`HistoryStore`] lays the typed records
//! out on top of it as JSON.

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::data::{DailyStepRecord, StepHistory, SyncCheckpoint};
use crate::error::Result;
use crate::utils::history_window;

/// Byte-oriented persistent store supplied by the host.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get the value under `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now < at).unwrap_or(true)
    }
}

/// In-memory [`KeyValueStore`] honoring TTLs.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unexpired entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    /// Check if the store holds no unexpired entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self.entries.lock();
        let now = Instant::now();

        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                debug!("Key {} expired", key);
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

const CHECKPOINT_KEY: &str = "sync/checkpoint";

fn record_key(date: NaiveDate) -> String {
    format!("steps/{}", date.format("%Y-%m-%d"))
}

/// Typed access to persisted step records and the checkpoint.
#[derive(Clone)]
pub struct HistoryStore {
    store: Arc<dyn KeyValueStore>,
}

impl HistoryStore {
    /// Wrap a host store.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Load the record for `date`.
    ///
    /// A record that no longer parses is treated as absent.
    pub async fn load_record(&self, date: NaiveDate) -> Result<Option<DailyStepRecord>> {
        let key = record_key(date);
        let Some(bytes) = self.store.get(&key).await? else {
            return Ok(None);
        };

        match serde_json::from_slice(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("Discarding unreadable record {}: {}", key, e);
                Ok(None)
            }
        }
    }

    /// Persist `record`, replacing any record for the same date.
    pub async fn save_record(&self, record: &DailyStepRecord, ttl: Option<Duration>) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        self.store.set(&record_key(record.date), bytes, ttl).await
    }

    /// Load the persisted records of the 7 days ending `today`.
    pub async fn load_window(&self, today: NaiveDate) -> Result<StepHistory> {
        let mut history = StepHistory::new();
        for date in history_window(today) {
            if let Some(record) = self.load_record(date).await? {
                history.insert(record);
            }
        }
        Ok(history)
    }

    /// Load the checkpoint, or an empty one if none was saved.
    pub async fn load_checkpoint(&self) -> Result<SyncCheckpoint> {
        match self.store.get(CHECKPOINT_KEY).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(SyncCheckpoint::default()),
        }
    }

    /// Persist the checkpoint without expiry.
    pub async fn save_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<()> {
        let bytes = serde_json::to_vec(checkpoint)?;
        self.store.set(CHECKPOINT_KEY, bytes, None).await
    }

    /// Forget the checkpoint.
    pub async fn clear_checkpoint(&self) -> Result<()> {
        self.store.remove(CHECKPOINT_KEY).await
    }
}
