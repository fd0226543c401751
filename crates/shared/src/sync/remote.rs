use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::models::SharedMemoryEntry;

pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SyncError>> + Send + 'a>>;

const NOTIFICATION_CAPACITY: usize = 16;

/// Remote stores keep this many of the most recent arrivals; older records
/// are trimmed on append. Each device only keeps the last 100 shared entries.
pub const REMOTE_RETAINED_RECORDS: usize = 1_000;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("remote memory store unavailable: {0}")]
    Unavailable(String),
    #[error("remote memory store rejected the request: {0}")]
    Rejected(String),
    #[error("remote memory record is invalid: {0}")]
    InvalidRecord(String),
}

/// A shared record as the remote store holds it. `received_at` is stamped by
/// the store on first append and is what sync watermarks compare against, so
/// a record that sat in an offline queue is still delivered after its
/// creation time has been passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRecord {
    pub received_at: DateTime<Utc>,
    pub entry: SharedMemoryEntry,
}

impl RemoteRecord {
    pub fn new(entry: SharedMemoryEntry, received_at: DateTime<Utc>) -> Self {
        Self { received_at, entry }
    }
}

/// Append-only record store shared between both users.
pub trait RemoteMemoryStore: Send + Sync {
    fn append<'a>(&'a self, entry: &'a SharedMemoryEntry) -> RemoteFuture<'a, ()>;

    /// Records received after `since`, oldest first by creation time. `None`
    /// fetches everything. Records received in the same millisecond as
    /// `since` are delivered again; merging is idempotent.
    fn fetch_since(&self, since: Option<DateTime<Utc>>)
    -> RemoteFuture<'_, Vec<SharedMemoryEntry>>;

    /// Each notification carries the full current record set.
    fn subscribe(&self) -> broadcast::Receiver<Vec<RemoteRecord>>;

    fn health_check(&self) -> RemoteFuture<'_, ()>;
}

pub(crate) fn received_since(
    records: impl IntoIterator<Item = RemoteRecord>,
    since: Option<DateTime<Utc>>,
) -> Vec<SharedMemoryEntry> {
    let mut filtered = records
        .into_iter()
        .filter(|record| {
            since.is_none_or(|since| {
                record.received_at.timestamp_millis() >= since.timestamp_millis()
            })
        })
        .map(|record| record.entry)
        .collect::<Vec<_>>();
    filtered.sort_by_key(|entry| entry.timestamp);
    filtered
}

/// Process-local remote store. Useful when no server is configured and as a
/// test double; `set_available(false)` simulates losing connectivity.
pub struct InMemoryRemoteStore {
    records: Mutex<Vec<RemoteRecord>>,
    retained: usize,
    available: AtomicBool,
    notifications: broadcast::Sender<Vec<RemoteRecord>>,
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            records: Mutex::new(Vec::new()),
            retained: REMOTE_RETAINED_RECORDS,
            available: AtomicBool::new(true),
            notifications,
        }
    }
}

impl InMemoryRemoteStore {
    pub fn with_retention(retained: usize) -> Self {
        Self {
            retained,
            ..Self::default()
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Stored entries in arrival order.
    pub fn entries(&self) -> Vec<SharedMemoryEntry> {
        self.records()
            .into_iter()
            .map(|record| record.entry)
            .collect()
    }

    pub fn records(&self) -> Vec<RemoteRecord> {
        self.lock_records().clone()
    }

    fn lock_records(&self) -> MutexGuard<'_, Vec<RemoteRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ensure_available(&self) -> Result<(), SyncError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::Unavailable("offline".to_string()))
        }
    }
}

impl RemoteMemoryStore for InMemoryRemoteStore {
    fn append<'a>(&'a self, entry: &'a SharedMemoryEntry) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_available()?;
            let snapshot = {
                let mut records = self.lock_records();
                if records.iter().any(|existing| existing.entry.id == entry.id) {
                    return Ok(());
                }
                records.push(RemoteRecord::new(entry.clone(), Utc::now()));
                let excess = records.len().saturating_sub(self.retained);
                records.drain(..excess);
                records.clone()
            };
            // No subscribers is fine.
            let _ = self.notifications.send(snapshot);
            Ok(())
        })
    }

    fn fetch_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> RemoteFuture<'_, Vec<SharedMemoryEntry>> {
        Box::pin(async move {
            self.ensure_available()?;
            Ok(received_since(self.records(), since))
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<RemoteRecord>> {
        self.notifications.subscribe()
    }

    fn health_check(&self) -> RemoteFuture<'_, ()> {
        Box::pin(async move { self.ensure_available() })
    }
}
