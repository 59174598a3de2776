use crate::bundles::{ArtifactBundle, BundleStore, BundleStoreError};
use crate::chunks::{ChunkStore, ChunkStoreError};
use crate::metrics_defs::{ASSEMBLE_BUNDLE_SIZE, ASSEMBLE_TASK_DURATION, ASSEMBLE_TASK_RESULT};
use crate::status::AssembleStatusStore;
use crate::task::AssembleArtifactsTask;
use crate::types::{AssembleKey, Checksum, ChunkFileState};
use shared::{counter, histogram};
use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;

#[derive(thiserror::Error, Debug)]
pub enum AssembleError {
    #[error("Not all chunks available for assembling")]
    MissingChunk(Checksum),

    #[error("Chunk {0} does not match its checksum")]
    CorruptChunk(Checksum),

    #[error("File exceeds maximum size")]
    TooLarge,

    #[error("Reported checksum mismatch")]
    ChecksumMismatch,

    #[error("Failed to read chunks: {0}")]
    ChunkStore(#[from] ChunkStoreError),

    #[error("Failed to stage artifact bundle: {0}")]
    Staging(#[from] io::Error),

    #[error("Failed to store artifact bundle: {0}")]
    BundleStore(#[from] BundleStoreError),
}

/// Fetches the chunks of an upload, verifies them and commits the result as an
/// artifact bundle. Progress is reported through the status registry.
pub struct Assembler {
    statuses: Arc<dyn AssembleStatusStore>,
    chunks: Arc<dyn ChunkStore>,
    bundles: Arc<dyn BundleStore>,
    max_assemble_size: u64,
}

impl Assembler {
    pub fn new(
        statuses: Arc<dyn AssembleStatusStore>,
        chunks: Arc<dyn ChunkStore>,
        bundles: Arc<dyn BundleStore>,
        max_assemble_size: u64,
    ) -> Self {
        Assembler {
            statuses,
            chunks,
            bundles,
            max_assemble_size,
        }
    }

    pub fn statuses(&self) -> &Arc<dyn AssembleStatusStore> {
        &self.statuses
    }

    async fn record(&self, key: &AssembleKey, state: ChunkFileState, detail: Option<String>) {
        if let Err(e) = self.statuses.set(key, state, detail).await {
            tracing::error!(%key, state = state.as_str(), "Failed to record assemble status: {e}");
        }
    }

    /// Runs the task to completion and records exactly one terminal state.
    /// Running the same task again converges to the same result.
    pub async fn assemble_artifacts(&self, task: &AssembleArtifactsTask) -> ChunkFileState {
        let key = task.key();
        self.record(&key, ChunkFileState::Assembling, None).await;

        let start = Instant::now();
        let result = self.try_assemble(task).await;
        histogram!(ASSEMBLE_TASK_DURATION).record(start.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                tracing::info!(
                    organization_id = task.org_id,
                    version = %task.version,
                    checksum = %task.checksum,
                    "assembled artifact bundle"
                );
                counter!(ASSEMBLE_TASK_RESULT, "result" => "ok").increment(1);
                self.record(&key, ChunkFileState::Ok, None).await;
                ChunkFileState::Ok
            }
            Err(e) => {
                tracing::warn!(
                    organization_id = task.org_id,
                    version = %task.version,
                    checksum = %task.checksum,
                    "failed to assemble artifact bundle: {e:?}"
                );
                counter!(ASSEMBLE_TASK_RESULT, "result" => "error").increment(1);
                self.record(&key, ChunkFileState::Error, Some(e.to_string()))
                    .await;
                ChunkFileState::Error
            }
        }
    }

    async fn try_assemble(&self, task: &AssembleArtifactsTask) -> Result<(), AssembleError> {
        let mut bundle = ArtifactBundle {
            organization_id: task.org_id,
            checksum: task.checksum.clone(),
            releases: BTreeSet::from([task.version.clone()]),
            project_ids: task.project_ids.iter().copied().collect(),
            size: 0,
            is_release_bundle_migration: task.is_release_bundle_migration,
        };

        // The bundle is content addressed, so an earlier run already produced identical data.
        if let Some(existing) = self.bundles.get(task.org_id, &task.checksum).await? {
            tracing::debug!(checksum = %task.checksum, size = existing.size, "bundle already assembled");
            self.bundles.put_metadata(&bundle).await?;
            return Ok(());
        }

        for chunk in &task.chunks {
            if !self.chunks.contains(chunk).await? {
                return Err(AssembleError::MissingChunk(chunk.clone()));
            }
        }

        // Chunks are streamed to disk so that only one chunk is held in memory.
        let staged = tempfile::NamedTempFile::new()?;
        let mut file = tokio::fs::File::from_std(staged.as_file().try_clone()?);
        let mut hasher = Checksum::hasher();
        let mut size: u64 = 0;

        for chunk in &task.chunks {
            let bytes = self
                .chunks
                .get(chunk)
                .await?
                .ok_or_else(|| AssembleError::MissingChunk(chunk.clone()))?;

            if Checksum::compute(&bytes) != *chunk {
                return Err(AssembleError::CorruptChunk(chunk.clone()));
            }

            size += bytes.len() as u64;
            if size > self.max_assemble_size {
                return Err(AssembleError::TooLarge);
            }

            hasher.update(&bytes);
            file.write_all(&bytes).await?;
        }
        file.flush().await?;

        if hasher.finish() != task.checksum {
            return Err(AssembleError::ChecksumMismatch);
        }

        bundle.size = size;
        histogram!(ASSEMBLE_BUNDLE_SIZE).record(size as f64);

        self.bundles.put(&bundle, staged.path()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundles::MemoryBundleStore;
    use crate::chunks::MemoryChunkStore;
    use crate::status::CacheStatusStore;
    use crate::types::AssembleStatus;
    use bytes::Bytes;

    struct Fixture {
        statuses: Arc<CacheStatusStore>,
        chunks: Arc<MemoryChunkStore>,
        bundles: Arc<MemoryBundleStore>,
        assembler: Assembler,
    }

    fn fixture(max_assemble_size: u64) -> Fixture {
        let statuses = Arc::new(CacheStatusStore::default());
        let chunks = Arc::new(MemoryChunkStore::new());
        let bundles = Arc::new(MemoryBundleStore::new());
        let assembler = Assembler::new(
            statuses.clone(),
            chunks.clone(),
            bundles.clone(),
            max_assemble_size,
        );

        Fixture {
            statuses,
            chunks,
            bundles,
            assembler,
        }
    }

    async fn upload(chunks: &MemoryChunkStore, parts: &[&'static [u8]]) -> Vec<Checksum> {
        let mut checksums = Vec::new();
        for part in parts {
            checksums.push(chunks.put(Bytes::from_static(part)).await.unwrap());
        }
        checksums
    }

    fn task(checksum: Checksum, chunks: Vec<Checksum>) -> AssembleArtifactsTask {
        AssembleArtifactsTask {
            org_id: 1,
            version: "1.0.0".into(),
            checksum,
            chunks,
            project_ids: vec![10, 11],
            is_release_bundle_migration: true,
        }
    }

    #[tokio::test]
    async fn test_assemble_success() {
        let f = fixture(1024);
        let chunks = upload(&f.chunks, &[b"hello ", b"world"]).await;
        let checksum = Checksum::compute(b"hello world");
        let task = task(checksum.clone(), chunks);

        assert_eq!(f.assembler.assemble_artifacts(&task).await, ChunkFileState::Ok);
        assert_eq!(
            f.statuses.get(&task.key()).await.unwrap(),
            Some(AssembleStatus::new(ChunkFileState::Ok, None))
        );

        let bundle = f.bundles.get(1, &checksum).await.unwrap().unwrap();
        assert_eq!(bundle.size, 11);
        assert_eq!(bundle.releases, BTreeSet::from(["1.0.0".to_string()]));
        assert_eq!(bundle.project_ids, BTreeSet::from([10, 11]));
        assert!(bundle.is_release_bundle_migration);
        assert_eq!(
            f.bundles.data(1, &checksum),
            Some(Bytes::from_static(b"hello world"))
        );
    }

    #[tokio::test]
    async fn test_assemble_missing_chunk() {
        let f = fixture(1024);
        let mut chunks = upload(&f.chunks, &[b"hello "]).await;
        chunks.push(Checksum::compute(b"world"));
        let task = task(Checksum::compute(b"hello world"), chunks);

        assert_eq!(
            f.assembler.assemble_artifacts(&task).await,
            ChunkFileState::Error
        );
        assert_eq!(
            f.statuses.get(&task.key()).await.unwrap(),
            Some(AssembleStatus::new(
                ChunkFileState::Error,
                Some("Not all chunks available for assembling".into())
            ))
        );
        assert_eq!(f.bundles.get(1, &task.checksum).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_assemble_corrupt_chunk() {
        let f = fixture(1024);
        let claimed = Checksum::compute(b"hello world");
        f.chunks
            .insert_raw(claimed.clone(), Bytes::from_static(b"tampered"));
        let task = task(claimed.clone(), vec![claimed.clone()]);

        assert_eq!(
            f.assembler.assemble_artifacts(&task).await,
            ChunkFileState::Error
        );
        let status = f.statuses.get(&task.key()).await.unwrap().unwrap();
        assert_eq!(
            status.detail,
            Some(format!("Chunk {claimed} does not match its checksum"))
        );
    }

    #[tokio::test]
    async fn test_assemble_checksum_mismatch() {
        let f = fixture(1024);
        let chunks = upload(&f.chunks, &[b"hello ", b"world"]).await;
        let task = task(Checksum::compute(b"something else"), chunks);

        assert_eq!(
            f.assembler.assemble_artifacts(&task).await,
            ChunkFileState::Error
        );
        assert_eq!(
            f.statuses.get(&task.key()).await.unwrap().unwrap().detail,
            Some("Reported checksum mismatch".into())
        );
    }

    #[tokio::test]
    async fn test_assemble_too_large() {
        let f = fixture(8);
        let chunks = upload(&f.chunks, &[b"hello ", b"world"]).await;
        let task = task(Checksum::compute(b"hello world"), chunks);

        assert_eq!(
            f.assembler.assemble_artifacts(&task).await,
            ChunkFileState::Error
        );
        assert_eq!(
            f.statuses.get(&task.key()).await.unwrap().unwrap().detail,
            Some("File exceeds maximum size".into())
        );
    }

    #[tokio::test]
    async fn test_assemble_is_idempotent() {
        let f = fixture(1024);
        let chunks = upload(&f.chunks, &[b"hello ", b"world"]).await;
        let checksum = Checksum::compute(b"hello world");
        let first = task(checksum.clone(), chunks.clone());
        assert_eq!(f.assembler.assemble_artifacts(&first).await, ChunkFileState::Ok);

        // A second run for another release reuses the bundle, even without the chunks.
        let mut second = task(checksum.clone(), vec![Checksum::compute(b"gone")]);
        second.version = "2.0.0".into();
        second.project_ids = vec![12];
        assert_eq!(f.assembler.assemble_artifacts(&second).await, ChunkFileState::Ok);

        let bundle = f.bundles.get(1, &checksum).await.unwrap().unwrap();
        assert_eq!(
            bundle.releases,
            BTreeSet::from(["1.0.0".to_string(), "2.0.0".to_string()])
        );
        assert_eq!(bundle.project_ids, BTreeSet::from([10, 11, 12]));
        assert_eq!(bundle.size, 11);
    }
}
