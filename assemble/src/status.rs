// Shared registry of assembly progress, keyed by task kind, organization and checksum.
// Entries expire after a fixed TTL so that records left behind by a crashed worker
// eventually disappear and the client can upload again.
use crate::metrics_defs::{ASSEMBLE_STATUS_HIT, ASSEMBLE_STATUS_MISS};
use crate::types::{AssembleKey, AssembleStatus, ChunkFileState};
use async_trait::async_trait;
use moka::sync::Cache;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use shared::counter;
use std::time::Duration;

pub const DEFAULT_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_MAX_CAPACITY: u64 = 100_000;

const REDIS_KEY_PREFIX: &str = "assemble-status";

#[derive(thiserror::Error, Debug)]
pub enum StatusStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("invalid status record: {0}")]
    Record(#[from] serde_json::Error),
}

#[async_trait]
pub trait AssembleStatusStore: Send + Sync {
    /// Returns `None` if there is no record for the key.
    async fn get(&self, key: &AssembleKey) -> Result<Option<AssembleStatus>, StatusStoreError>;

    /// Unconditionally overwrites the record. Setting `NotFound` removes it.
    async fn set(
        &self,
        key: &AssembleKey,
        state: ChunkFileState,
        detail: Option<String>,
    ) -> Result<(), StatusStoreError>;

    /// Atomically stores `Created` if there is no record for the key yet.
    /// Returns `None` when this call created the record, otherwise the existing status.
    async fn create_if_absent(
        &self,
        key: &AssembleKey,
    ) -> Result<Option<AssembleStatus>, StatusStoreError>;
}

fn record_lookup(status: Option<AssembleStatus>) -> Option<AssembleStatus> {
    let metric_def = if status.is_some() {
        ASSEMBLE_STATUS_HIT
    } else {
        ASSEMBLE_STATUS_MISS
    };
    counter!(metric_def).increment(1);
    status
}

/// In-process registry. Only valid when the endpoint and all workers run in a
/// single process.
///
/// The capacity bound is enforced by size-based eviction, so a full cache may
/// drop a record before its TTL. A dropped `created` record lets the next
/// request enqueue the assembly again, a dropped `ok` record makes the client
/// re-upload. Both converge because assembly is idempotent.
pub struct CacheStatusStore {
    cache: Cache<AssembleKey, AssembleStatus>,
}

impl CacheStatusStore {
    pub fn new(ttl: Duration, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();

        CacheStatusStore { cache }
    }
}

impl Default for CacheStatusStore {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_CAPACITY)
    }
}

#[async_trait]
impl AssembleStatusStore for CacheStatusStore {
    async fn get(&self, key: &AssembleKey) -> Result<Option<AssembleStatus>, StatusStoreError> {
        Ok(record_lookup(self.cache.get(key)))
    }

    async fn set(
        &self,
        key: &AssembleKey,
        state: ChunkFileState,
        detail: Option<String>,
    ) -> Result<(), StatusStoreError> {
        tracing::debug!(%key, state = state.as_str(), "setting assemble status");

        if state == ChunkFileState::NotFound {
            self.cache.invalidate(key);
        } else {
            self.cache
                .insert(key.clone(), AssembleStatus::new(state, detail));
        }
        Ok(())
    }

    async fn create_if_absent(
        &self,
        key: &AssembleKey,
    ) -> Result<Option<AssembleStatus>, StatusStoreError> {
        let entry = self
            .cache
            .entry(key.clone())
            .or_insert_with(|| AssembleStatus::new(ChunkFileState::Created, None));

        if entry.is_fresh() {
            Ok(None)
        } else {
            Ok(Some(entry.into_value()))
        }
    }
}

/// Registry shared by every endpoint replica and worker through redis.
/// Records are JSON encoded and expire with `EX`.
pub struct RedisStatusStore {
    connection: ConnectionManager,
    ttl_secs: u64,
}

impl RedisStatusStore {
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self, StatusStoreError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_connection_manager().await?;
        tracing::info!("connected to redis status store");

        Ok(RedisStatusStore {
            connection,
            ttl_secs: ttl.as_secs().max(1),
        })
    }
}

fn redis_key(key: &AssembleKey) -> String {
    format!("{REDIS_KEY_PREFIX}:{key}")
}

fn encode_record(status: &AssembleStatus) -> Result<String, StatusStoreError> {
    Ok(serde_json::to_string(status)?)
}

fn decode_record(raw: Option<String>) -> Result<Option<AssembleStatus>, StatusStoreError> {
    raw.map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(StatusStoreError::from)
}

#[async_trait]
impl AssembleStatusStore for RedisStatusStore {
    async fn get(&self, key: &AssembleKey) -> Result<Option<AssembleStatus>, StatusStoreError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(redis_key(key)).await?;
        Ok(record_lookup(decode_record(raw)?))
    }

    async fn set(
        &self,
        key: &AssembleKey,
        state: ChunkFileState,
        detail: Option<String>,
    ) -> Result<(), StatusStoreError> {
        tracing::debug!(%key, state = state.as_str(), "setting assemble status");
        let mut conn = self.connection.clone();

        if state == ChunkFileState::NotFound {
            let _: () = conn.del(redis_key(key)).await?;
            return Ok(());
        }

        let record = encode_record(&AssembleStatus::new(state, detail))?;
        let _: () = conn.set_ex(redis_key(key), record, self.ttl_secs).await?;
        Ok(())
    }

    async fn create_if_absent(
        &self,
        key: &AssembleKey,
    ) -> Result<Option<AssembleStatus>, StatusStoreError> {
        let mut conn = self.connection.clone();
        let record_key = redis_key(key);
        let record = encode_record(&AssembleStatus::new(ChunkFileState::Created, None))?;

        // The existing record can expire between SET NX and GET, so retry.
        loop {
            let created: Option<String> = redis::cmd("SET")
                .arg(&record_key)
                .arg(&record)
                .arg("NX")
                .arg("EX")
                .arg(self.ttl_secs)
                .query_async(&mut conn)
                .await?;
            if created.is_some() {
                return Ok(None);
            }

            let raw: Option<String> = conn.get(&record_key).await?;
            if let Some(existing) = decode_record(raw)? {
                return Ok(Some(existing));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssembleTaskKind, Checksum};
    use std::sync::Arc;

    fn key(c: char) -> AssembleKey {
        AssembleKey::artifact_bundle(1, c.to_string().repeat(40).parse().unwrap())
    }

    async fn check_store(store: &dyn AssembleStatusStore) {
        let key = key('a');
        store.set(&key, ChunkFileState::NotFound, None).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), None);

        store.set(&key, ChunkFileState::Created, None).await.unwrap();
        assert_eq!(
            store.get(&key).await.unwrap(),
            Some(AssembleStatus::new(ChunkFileState::Created, None))
        );

        store
            .set(&key, ChunkFileState::Error, Some("broken".into()))
            .await
            .unwrap();
        assert_eq!(
            store.get(&key).await.unwrap(),
            Some(AssembleStatus::new(
                ChunkFileState::Error,
                Some("broken".into())
            ))
        );

        store.set(&key, ChunkFileState::NotFound, None).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), None);

        assert_eq!(store.create_if_absent(&key).await.unwrap(), None);
        assert_eq!(
            store.create_if_absent(&key).await.unwrap(),
            Some(AssembleStatus::new(ChunkFileState::Created, None))
        );

        store.set(&key, ChunkFileState::Ok, None).await.unwrap();
        assert_eq!(
            store.create_if_absent(&key).await.unwrap(),
            Some(AssembleStatus::new(ChunkFileState::Ok, None))
        );
        store.set(&key, ChunkFileState::NotFound, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_cache_store() {
        check_store(&CacheStatusStore::default()).await;
    }

    #[tokio::test]
    #[ignore = "requires a redis server at REDIS_URL"]
    async fn test_redis_store() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into());
        let store = RedisStatusStore::connect(&url, DEFAULT_TTL).await.unwrap();
        check_store(&store).await;
    }

    #[test]
    fn test_redis_record_format() {
        let key = key('e');
        assert_eq!(
            redis_key(&key),
            format!("assemble-status:1|organization.artifact_bundle|{}", "e".repeat(40))
        );

        let status = AssembleStatus::new(ChunkFileState::Error, Some("broken".into()));
        let raw = encode_record(&status).unwrap();
        assert_eq!(raw, r#"{"state":"error","detail":"broken"}"#);
        assert_eq!(decode_record(Some(raw)).unwrap(), Some(status));
        assert_eq!(decode_record(None).unwrap(), None);
        assert!(decode_record(Some("garbage".into())).is_err());
    }

    #[tokio::test]
    async fn test_keys_are_scoped() {
        let store = CacheStatusStore::default();
        let checksum: Checksum = "a".repeat(40).parse().unwrap();

        let bundle = AssembleKey::new(AssembleTaskKind::ArtifactBundle, 1, checksum.clone());
        let other_org = AssembleKey::new(AssembleTaskKind::ArtifactBundle, 2, checksum.clone());
        let dif = AssembleKey::new(AssembleTaskKind::Dif, 1, checksum);

        store.set(&bundle, ChunkFileState::Ok, None).await.unwrap();
        assert!(store.get(&bundle).await.unwrap().is_some());
        assert_eq!(store.get(&other_org).await.unwrap(), None);
        assert_eq!(store.get(&dif).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_create_if_absent_single_winner() {
        let store = Arc::new(CacheStatusStore::default());
        let key = key('c');

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let store = store.clone();
            let key = key.clone();
            tasks.spawn(async move { store.create_if_absent(&key).await.unwrap().is_none() });
        }

        let mut winners = 0;
        while let Some(won) = tasks.join_next().await {
            if won.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let store = CacheStatusStore::new(Duration::from_millis(50), 10);
        let key = key('d');

        store.set(&key, ChunkFileState::Created, None).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.get(&key).await.unwrap(), None);
        assert_eq!(store.create_if_absent(&key).await.unwrap(), None);
    }
}
