use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assistant_memory::{MergeReport, SharedMemory};
use crate::local_state::{KEY_PENDING_SYNC, LocalStateStore, StateStoreError};
use crate::models::SharedMemoryEntry;

pub mod redis_store;
pub mod remote;

#[cfg(test)]
mod tests;

pub use redis_store::RedisRemoteStore;
pub use remote::{
    InMemoryRemoteStore, RemoteFuture, RemoteMemoryStore, RemoteRecord, SyncError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTrigger {
    Startup,
    Periodic,
    /// The remote store announced a change and delivered its full record set.
    RemoteNotification(Vec<RemoteRecord>),
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Periodic => "periodic",
            Self::RemoteNotification(_) => "remote_notification",
        }
    }
}

/// Sole writer to the remote memory store. Pushes are queued while offline
/// and replayed in order; every pull path goes through `reconcile`.
pub struct SyncService {
    remote: Arc<dyn RemoteMemoryStore>,
    memory: SharedMemory,
    state: Arc<dyn LocalStateStore>,
    pending: Mutex<VecDeque<SharedMemoryEntry>>,
    online: AtomicBool,
    drain_lock: tokio::sync::Mutex<()>,
    interval: Duration,
}

impl SyncService {
    pub fn new(
        remote: Arc<dyn RemoteMemoryStore>,
        memory: SharedMemory,
        state: Arc<dyn LocalStateStore>,
        interval: Duration,
    ) -> Result<Self, StateStoreError> {
        let pending = state
            .load_json::<VecDeque<SharedMemoryEntry>>(KEY_PENDING_SYNC)?
            .unwrap_or_default();
        if !pending.is_empty() {
            info!(pending = pending.len(), "restored pending sync queue");
        }

        Ok(Self {
            remote,
            memory,
            state,
            pending: Mutex::new(pending),
            online: AtomicBool::new(true),
            drain_lock: tokio::sync::Mutex::new(()),
            interval,
        })
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> Vec<SharedMemoryEntry> {
        self.lock_pending().iter().cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    /// Sends one record. Returns `true` when it reached the remote store now;
    /// otherwise it waits in the pending queue.
    pub async fn push(&self, entry: SharedMemoryEntry) -> bool {
        if !self.is_online() {
            debug!(record_id = %entry.id, "offline, queueing record");
            self.enqueue(entry);
            return false;
        }

        if self.pending_len() > 0 {
            let record_id = entry.id.clone();
            self.enqueue(entry);
            self.drain_pending().await;
            return !self.lock_pending().iter().any(|queued| queued.id == record_id);
        }

        match self.remote.append(&entry).await {
            Ok(()) => true,
            Err(err) => {
                warn!(record_id = %entry.id, error = %err, "push failed, queueing record");
                self.enqueue(entry);
                false
            }
        }
    }

    pub async fn push_all(&self, entries: Vec<SharedMemoryEntry>) {
        for entry in entries {
            self.push(entry).await;
        }
    }

    /// Records a connectivity change. Regaining connectivity drains the
    /// pending queue; the number of delivered records is returned.
    pub async fn set_online(&self, online: bool) -> usize {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if online && !was_online {
            info!("remote memory store reachable again");
            return self.drain_pending().await;
        }
        if !online && was_online {
            warn!("remote memory store unreachable, pushes will be queued");
        }
        0
    }

    /// Replays queued records oldest first, stopping at the first failure.
    pub async fn drain_pending(&self) -> usize {
        let _drain = self.drain_lock.lock().await;
        let mut delivered = 0;

        loop {
            let Some(next) = self.lock_pending().front().cloned() else {
                break;
            };

            if let Err(err) = self.remote.append(&next).await {
                warn!(record_id = %next.id, error = %err, "pending push failed, keeping queue");
                break;
            }

            {
                let mut pending = self.lock_pending();
                if pending.front().is_some_and(|front| front.id == next.id) {
                    pending.pop_front();
                }
            }
            self.persist_pending();
            delivered += 1;
        }

        if delivered > 0 {
            info!(delivered, "drained pending sync queue");
        }
        delivered
    }

    /// Remote records newer than `since`. Failures yield an empty set.
    pub async fn pull(&self, since: Option<DateTime<Utc>>) -> Vec<SharedMemoryEntry> {
        match self.remote.fetch_since(since).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "pull failed");
                Vec::new()
            }
        }
    }

    /// Merges remote records into memory and advances the watermark to the
    /// instant the pull was issued. The watermark is compared against the
    /// remote arrival time of each record. A failed pull leaves it alone.
    pub async fn reconcile(&self, trigger: SyncTrigger) -> MergeReport {
        let trigger_name = trigger.as_str();
        let issued_at = Utc::now();
        let since = self.memory.lock().last_sync();

        let entries = match trigger {
            SyncTrigger::RemoteNotification(records) => remote::received_since(records, since),
            SyncTrigger::Startup | SyncTrigger::Periodic => {
                match self.remote.fetch_since(since).await {
                    Ok(entries) => entries,
                    Err(err) => {
                        warn!(trigger = trigger_name, error = %err, "reconcile pull failed");
                        return MergeReport::default();
                    }
                }
            }
        };

        let report = self.memory.update(|memory| {
            let report = memory.merge_remote(entries);
            memory.set_last_sync(issued_at);
            report
        });

        if report.merged > 0 || report.facts_updated > 0 {
            info!(
                trigger = trigger_name,
                merged = report.merged,
                facts_updated = report.facts_updated,
                "merged remote shared memory"
            );
        } else {
            debug!(trigger = trigger_name, skipped = report.skipped, "shared memory up to date");
        }
        report
    }

    /// Startup reconcile, then periodic health checks and reconciles plus
    /// remote notifications until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut notifications = self.remote.subscribe();
        let mut notifications_open = true;

        self.reconcile(SyncTrigger::Startup).await;

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("sync loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let healthy = match self.remote.health_check().await {
                        Ok(()) => true,
                        Err(err) => {
                            debug!(error = %err, "remote health check failed");
                            false
                        }
                    };
                    self.set_online(healthy).await;
                    if healthy {
                        self.reconcile(SyncTrigger::Periodic).await;
                    }
                }
                notification = notifications.recv(), if notifications_open => {
                    match notification {
                        Ok(records) => {
                            self.reconcile(SyncTrigger::RemoteNotification(records)).await;
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "remote notifications lagged, pulling instead");
                            self.reconcile(SyncTrigger::Periodic).await;
                        }
                        Err(RecvError::Closed) => {
                            warn!("remote notification channel closed");
                            notifications_open = false;
                        }
                    }
                }
            }
        }
    }

    fn enqueue(&self, entry: SharedMemoryEntry) {
        self.lock_pending().push_back(entry);
        self.persist_pending();
    }

    fn persist_pending(&self) {
        let snapshot = self.pending();
        if let Err(err) = self.state.store_json(KEY_PENDING_SYNC, &snapshot) {
            warn!(error = %err, "failed to persist pending sync queue");
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, VecDeque<SharedMemoryEntry>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
