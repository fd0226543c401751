use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::remote::{
    REMOTE_RETAINED_RECORDS, RemoteFuture, RemoteMemoryStore, RemoteRecord, SyncError,
    received_since,
};
use crate::models::SharedMemoryEntry;

const DEFAULT_KEY_PREFIX: &str = "nova:shared_memory:v1";
const RECORDS_SCOPE: &str = "records";
const CHANGES_SCOPE: &str = "changes";
const NOTIFICATION_CAPACITY: usize = 16;

/// Shared memory kept in a Redis sorted set scored by arrival millis, with a
/// pub/sub channel announcing every append. Only the most recent
/// `REMOTE_RETAINED_RECORDS` arrivals are kept.
pub struct RedisRemoteStore {
    connection: ConnectionManager,
    key_prefix: String,
    notifications: broadcast::Sender<Vec<RemoteRecord>>,
    listener: JoinHandle<()>,
}

impl RedisRemoteStore {
    pub async fn connect(redis_url: &str) -> Result<Self, SyncError> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| SyncError::Unavailable(err.to_string()))?;
        let connection = ConnectionManager::new(client.clone())
            .await
            .map_err(|err| SyncError::Unavailable(err.to_string()))?;

        let mut health_connection = connection.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut health_connection)
            .await
            .map_err(|err| SyncError::Unavailable(format!("failed to connect to redis: {err}")))?;

        let key_prefix = DEFAULT_KEY_PREFIX.to_string();
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let listener = tokio::spawn(listen_for_changes(
            client,
            connection.clone(),
            compose_key(&key_prefix, CHANGES_SCOPE),
            compose_key(&key_prefix, RECORDS_SCOPE),
            notifications.clone(),
        ));

        Ok(Self {
            connection,
            key_prefix,
            notifications,
            listener,
        })
    }

    fn records_key(&self) -> String {
        compose_key(&self.key_prefix, RECORDS_SCOPE)
    }

    fn changes_key(&self) -> String {
        compose_key(&self.key_prefix, CHANGES_SCOPE)
    }
}

impl Drop for RedisRemoteStore {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl RemoteMemoryStore for RedisRemoteStore {
    fn append<'a>(&'a self, entry: &'a SharedMemoryEntry) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let member = serde_json::to_string(entry)
                .map_err(|err| SyncError::InvalidRecord(err.to_string()))?;
            let received_at = Utc::now().timestamp_millis();
            let mut connection = self.connection.clone();

            // NX keeps the first arrival when a queued record is replayed.
            let added: i64 = redis::cmd("ZADD")
                .arg(self.records_key())
                .arg("NX")
                .arg(received_at)
                .arg(member)
                .query_async(&mut connection)
                .await
                .map_err(redis_error)?;
            if added == 0 {
                return Ok(());
            }

            let _: i64 = connection
                .zremrangebyrank(self.records_key(), 0, retention_stop())
                .await
                .map_err(redis_error)?;
            let _: i64 = connection
                .publish(self.changes_key(), &entry.id)
                .await
                .map_err(redis_error)?;
            Ok(())
        })
    }

    fn fetch_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> RemoteFuture<'_, Vec<SharedMemoryEntry>> {
        Box::pin(async move {
            let min_score = since
                .map(|since| since.timestamp_millis().to_string())
                .unwrap_or_else(|| "-inf".to_string());
            let records = fetch_records(&self.connection, &self.records_key(), &min_score).await?;
            Ok(received_since(records, since))
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<RemoteRecord>> {
        self.notifications.subscribe()
    }

    fn health_check(&self) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            let mut connection = self.connection.clone();
            redis::cmd("PING")
                .query_async::<String>(&mut connection)
                .await
                .map_err(redis_error)?;
            Ok(())
        })
    }
}

async fn listen_for_changes(
    client: redis::Client,
    connection: ConnectionManager,
    changes_key: String,
    records_key: String,
    notifications: broadcast::Sender<Vec<RemoteRecord>>,
) {
    let mut pubsub = match client.get_async_pubsub().await {
        Ok(pubsub) => pubsub,
        Err(err) => {
            warn!(error = %err, "redis change subscription unavailable");
            return;
        }
    };
    if let Err(err) = pubsub.subscribe(&changes_key).await {
        warn!(error = %err, "failed to subscribe to redis change channel");
        return;
    }

    let mut messages = std::pin::pin!(pubsub.on_message());
    while messages.next().await.is_some() {
        match fetch_records(&connection, &records_key, "-inf").await {
            Ok(records) => {
                debug!(records = records.len(), "remote change notification");
                let _ = notifications.send(records);
            }
            Err(err) => warn!(error = %err, "failed to expand remote change notification"),
        }
    }
}

async fn fetch_records(
    connection: &ConnectionManager,
    records_key: &str,
    min_score: &str,
) -> Result<Vec<RemoteRecord>, SyncError> {
    let mut connection = connection.clone();
    let members: Vec<(String, f64)> = connection
        .zrangebyscore_withscores(records_key, min_score, "+inf")
        .await
        .map_err(redis_error)?;
    Ok(decode_records(members))
}

fn decode_records(members: Vec<(String, f64)>) -> Vec<RemoteRecord> {
    members
        .into_iter()
        .filter_map(|(member, score)| {
            let entry = match serde_json::from_str::<SharedMemoryEntry>(&member) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, "skipping undecodable remote record");
                    return None;
                }
            };
            let Some(received_at) = Utc.timestamp_millis_opt(score as i64).single() else {
                warn!(record_id = %entry.id, score, "skipping remote record with invalid score");
                return None;
            };
            Some(RemoteRecord::new(entry, received_at))
        })
        .collect()
}

/// Rank of the last record to drop so that only the newest retained records
/// survive a trim.
fn retention_stop() -> isize {
    -(REMOTE_RETAINED_RECORDS as isize) - 1
}

fn redis_error(err: redis::RedisError) -> SyncError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
        SyncError::Unavailable(err.to_string())
    } else {
        SyncError::Rejected(err.to_string())
    }
}

fn compose_key(prefix: &str, scope: &str) -> String {
    format!("{prefix}:{scope}")
}
