use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::assistant_memory::MemoryStore;
use crate::local_state::InMemoryStateStore;
use crate::models::{SharedEntryKind, UserId};
use crate::users::authorize;

/// Delegates to an in-memory store but refuses appends for selected texts.
#[derive(Default)]
struct PickyRemote {
    inner: InMemoryRemoteStore,
    refused: Mutex<HashSet<String>>,
    fetch_fails: AtomicBool,
}

impl PickyRemote {
    fn refuse(&self, text: &str) {
        self.refused.lock().unwrap().insert(text.to_string());
    }

    fn accept_all(&self) {
        self.refused.lock().unwrap().clear();
    }

    fn texts(&self) -> Vec<String> {
        self.inner
            .entries()
            .into_iter()
            .map(|entry| entry.text)
            .collect()
    }
}

impl RemoteMemoryStore for PickyRemote {
    fn append<'a>(&'a self, entry: &'a SharedMemoryEntry) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            if self.refused.lock().unwrap().contains(&entry.text) {
                return Err(SyncError::Rejected("refused".to_string()));
            }
            self.inner.append(entry).await
        })
    }

    fn fetch_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> RemoteFuture<'_, Vec<SharedMemoryEntry>> {
        Box::pin(async move {
            if self.fetch_fails.load(Ordering::SeqCst) {
                return Err(SyncError::Unavailable("down".to_string()));
            }
            self.inner.fetch_since(since).await
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<RemoteRecord>> {
        self.inner.subscribe()
    }

    fn health_check(&self) -> RemoteFuture<'_, ()> {
        self.inner.health_check()
    }
}

struct Fixture {
    remote: Arc<PickyRemote>,
    memory: SharedMemory,
    state: Arc<dyn LocalStateStore>,
    sync: Arc<SyncService>,
}

fn fixture() -> Fixture {
    let state: Arc<dyn LocalStateStore> = Arc::new(InMemoryStateStore::default());
    let remote = Arc::new(PickyRemote::default());
    let mut store = MemoryStore::load(state.clone()).unwrap();
    store.set_current_user(authorize("abhay"));
    let memory = SharedMemory::new(store);
    let sync = Arc::new(
        SyncService::new(
            remote.clone(),
            memory.clone(),
            state.clone(),
            Duration::from_millis(50),
        )
        .unwrap(),
    );
    Fixture {
        remote,
        memory,
        state,
        sync,
    }
}

fn entry(speaker: &str, text: &str, second: u32) -> SharedMemoryEntry {
    SharedMemoryEntry::new(
        UserId::new(speaker),
        SharedEntryKind::UserMessage,
        text,
        Utc.with_ymd_and_hms(2026, 5, 3, 18, 0, second).unwrap(),
    )
}

fn shared_texts(memory: &SharedMemory) -> Vec<String> {
    memory
        .lock()
        .shared_history()
        .iter()
        .map(|entry| entry.text.clone())
        .collect()
}

#[tokio::test]
async fn offline_pushes_queue_and_drain_in_order_on_reconnect() {
    let fx = fixture();
    fx.sync.set_online(false).await;

    assert!(!fx.sync.push(entry("abhay", "one", 1)).await);
    assert!(!fx.sync.push(entry("abhay", "two", 2)).await);
    assert!(fx.remote.texts().is_empty());
    assert_eq!(fx.sync.pending_len(), 2);

    let delivered = fx.sync.set_online(true).await;

    assert_eq!(delivered, 2);
    assert_eq!(fx.remote.texts(), vec!["one", "two"]);
    assert_eq!(fx.sync.pending_len(), 0);
}

#[tokio::test]
async fn drain_stops_at_the_first_failure() {
    let fx = fixture();
    fx.sync.set_online(false).await;
    fx.sync.push(entry("abhay", "one", 1)).await;
    fx.sync.push(entry("abhay", "two", 2)).await;
    fx.sync.push(entry("abhay", "three", 3)).await;
    fx.remote.refuse("two");

    let delivered = fx.sync.set_online(true).await;

    assert_eq!(delivered, 1);
    assert_eq!(fx.remote.texts(), vec!["one"]);
    assert_eq!(
        fx.sync
            .pending()
            .into_iter()
            .map(|entry| entry.text)
            .collect::<Vec<_>>(),
        vec!["two", "three"]
    );

    fx.remote.accept_all();
    assert_eq!(fx.sync.drain_pending().await, 2);
    assert_eq!(fx.remote.texts(), vec!["one", "two", "three"]);
}

#[tokio::test]
async fn failed_push_is_queued_and_later_pushes_keep_order() {
    let fx = fixture();
    fx.remote.refuse("first");

    assert!(!fx.sync.push(entry("abhay", "first", 1)).await);
    assert!(!fx.sync.push(entry("abhay", "second", 2)).await);
    assert!(fx.remote.texts().is_empty());

    fx.remote.accept_all();
    assert!(fx.sync.push(entry("abhay", "third", 3)).await);
    assert_eq!(fx.remote.texts(), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn pending_queue_survives_restart() {
    let fx = fixture();
    fx.sync.set_online(false).await;
    fx.sync.push(entry("abhay", "queued", 1)).await;

    let restarted = SyncService::new(
        fx.remote.clone(),
        fx.memory.clone(),
        fx.state.clone(),
        Duration::from_secs(30),
    )
    .unwrap();

    assert_eq!(restarted.pending_len(), 1);
    assert_eq!(restarted.drain_pending().await, 1);
    assert_eq!(fx.remote.texts(), vec!["queued"]);
}

#[tokio::test]
async fn reconcile_twice_creates_no_duplicates() {
    let fx = fixture();
    fx.remote.inner.append(&entry("piram", "hi", 1)).await.unwrap();
    fx.remote.inner.append(&entry("piram", "there", 2)).await.unwrap();

    let first = fx.sync.reconcile(SyncTrigger::Startup).await;
    let second = fx.sync.reconcile(SyncTrigger::Periodic).await;
    let replayed = fx
        .memory
        .update(|memory| memory.merge_remote(fx.remote.inner.entries()));

    assert_eq!(first.merged, 2);
    assert_eq!(second.merged, 0);
    assert_eq!(replayed.merged, 0);
    assert_eq!(replayed.skipped, 2);
    assert_eq!(shared_texts(&fx.memory), vec!["hi", "there"]);
}

#[tokio::test]
async fn failed_pull_leaves_the_watermark_untouched() {
    let fx = fixture();
    fx.remote.fetch_fails.store(true, Ordering::SeqCst);

    let report = fx.sync.reconcile(SyncTrigger::Periodic).await;

    assert_eq!(report, MergeReport::default());
    assert!(fx.memory.lock().last_sync().is_none());
    assert!(fx.sync.pull(None).await.is_empty());

    fx.remote.fetch_fails.store(false, Ordering::SeqCst);
    let before = Utc::now();
    fx.sync.reconcile(SyncTrigger::Periodic).await;
    let watermark = fx.memory.lock().last_sync().expect("watermark should advance");
    assert!(watermark >= before);
}

#[tokio::test]
async fn notifications_are_filtered_by_arrival_against_the_watermark() {
    let fx = fixture();
    let watermark = Utc.with_ymd_and_hms(2026, 5, 3, 18, 0, 5).unwrap();
    fx.memory.update(|memory| memory.set_last_sync(watermark));

    let report = fx
        .sync
        .reconcile(SyncTrigger::RemoteNotification(vec![
            RemoteRecord::new(
                entry("piram", "seen already", 4),
                watermark - TimeDelta::seconds(1),
            ),
            // Created before the watermark, but it only reached the store later.
            RemoteRecord::new(
                entry("piram", "late arrival", 3),
                watermark + TimeDelta::seconds(2),
            ),
            RemoteRecord::new(entry("piram", "new", 6), watermark + TimeDelta::seconds(1)),
        ]))
        .await;

    assert_eq!(report.merged, 2);
    assert_eq!(shared_texts(&fx.memory), vec!["late arrival", "new"]);
}

#[tokio::test]
async fn records_drained_after_a_partner_sync_still_reach_the_partner() {
    let writer = fixture();
    let partner_state: Arc<dyn LocalStateStore> = Arc::new(InMemoryStateStore::default());
    let mut partner_store = MemoryStore::load(partner_state.clone()).unwrap();
    partner_store.set_current_user(authorize("piram"));
    let partner_memory = SharedMemory::new(partner_store);
    let partner = SyncService::new(
        writer.remote.clone(),
        partner_memory.clone(),
        partner_state,
        Duration::from_secs(30),
    )
    .unwrap();

    writer.sync.set_online(false).await;
    let queued = writer
        .memory
        .update(|memory| memory.append_user_message("sent while offline"))
        .expect("logged in user should produce a shared entry");
    assert!(!writer.sync.push(queued).await);

    partner.reconcile(SyncTrigger::Periodic).await;
    assert!(shared_texts(&partner_memory).is_empty());
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(writer.sync.set_online(true).await, 1);
    partner.reconcile(SyncTrigger::Periodic).await;

    assert_eq!(shared_texts(&partner_memory), vec!["sent while offline"]);
}

#[tokio::test]
async fn run_merges_startup_and_notified_records_until_cancelled() {
    let fx = fixture();
    fx.remote.inner.append(&entry("piram", "before start", 1)).await.unwrap();

    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let sync = fx.sync.clone();
        let cancel = cancel.clone();
        async move { sync.run(cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let remote_entry = SharedMemoryEntry::new(
        UserId::new("piram"),
        SharedEntryKind::UserMessage,
        "while running",
        Utc::now(),
    );
    fx.remote.inner.append(&remote_entry).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("sync loop should stop after cancellation")
        .expect("sync task should not panic");

    assert_eq!(
        shared_texts(&fx.memory),
        vec!["before start", "while running"]
    );
}

#[tokio::test]
async fn periodic_health_check_restores_connectivity() {
    let fx = fixture();
    fx.sync.set_online(false).await;
    fx.sync.push(entry("abhay", "offline note", 1)).await;

    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let sync = fx.sync.clone();
        let cancel = cancel.clone();
        async move { sync.run(cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();
    task.await.expect("sync task should not panic");

    assert!(fx.sync.is_online());
    assert_eq!(fx.sync.pending_len(), 0);
    assert_eq!(fx.remote.texts(), vec!["offline note"]);
}
