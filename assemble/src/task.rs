use crate::assembler::Assembler;
use crate::metrics_defs::{ASSEMBLE_TASK_ENQUEUED, ASSEMBLE_TASK_IN_FLIGHT};
use crate::status::AssembleStatusStore;
use crate::types::{AssembleKey, Checksum, ChunkFileState, OrganizationId, ProjectId};
use serde::{Deserialize, Serialize};
use shared::{counter, gauge};
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;

/// Payload handed from the assemble endpoint to the worker pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssembleArtifactsTask {
    pub org_id: OrganizationId,
    pub version: String,
    pub checksum: Checksum,
    pub chunks: Vec<Checksum>,
    /// Every project of the release at enqueue time.
    pub project_ids: Vec<ProjectId>,
    pub is_release_bundle_migration: bool,
}

impl AssembleArtifactsTask {
    pub fn key(&self) -> AssembleKey {
        AssembleKey::artifact_bundle(self.org_id, self.checksum.clone())
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum EnqueueError {
    #[error("the assemble task queue is full")]
    Full,

    #[error("the assemble task queue is closed")]
    Closed,
}

/// Sending side of the bounded task queue.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<AssembleArtifactsTask>,
}

/// A reserved queue slot. Sending through it cannot fail or wait.
pub struct TaskPermit<'a> {
    permit: mpsc::Permit<'a, AssembleArtifactsTask>,
}

impl TaskPermit<'_> {
    pub fn send(self, task: AssembleArtifactsTask) {
        self.permit.send(task);
        counter!(ASSEMBLE_TASK_ENQUEUED).increment(1);
    }
}

impl TaskQueue {
    pub fn channel(size: usize) -> (TaskQueue, mpsc::Receiver<AssembleArtifactsTask>) {
        let (tx, rx) = mpsc::channel(size);
        (TaskQueue { tx }, rx)
    }

    /// Reserves a slot without waiting for workers to free capacity.
    pub fn try_reserve(&self) -> Result<TaskPermit<'_>, EnqueueError> {
        match self.tx.try_reserve() {
            Ok(permit) => Ok(TaskPermit { permit }),
            Err(mpsc::error::TrySendError::Full(())) => Err(EnqueueError::Full),
            Err(mpsc::error::TrySendError::Closed(())) => Err(EnqueueError::Closed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumes the queue until every sender is dropped, running at most `concurrency`
/// assemblies at a time. In-flight assemblies are awaited before returning.
pub async fn run_workers(
    assembler: Arc<Assembler>,
    mut rx: mpsc::Receiver<AssembleArtifactsTask>,
    concurrency: usize,
) {
    let permits = Arc::new(Semaphore::new(concurrency));
    let mut join_set = JoinSet::new();

    while let Some(task) = rx.recv().await {
        // The semaphore is never closed
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };

        let assembler = assembler.clone();
        join_set.spawn(async move {
            let _permit = permit;
            run_task(assembler, task).await;
        });

        while let Some(result) = join_set.try_join_next() {
            if let Err(e) = result {
                tracing::error!("Assemble worker failed: {e}");
            }
        }
    }

    tracing::info!("assemble task queue closed, waiting for running tasks");
    while let Some(result) = join_set.join_next().await {
        if let Err(e) = result {
            tracing::error!("Assemble worker failed: {e}");
        }
    }
}

/// Runs a single task. A panicking assembly is recorded as an error so clients
/// stop polling instead of waiting for the status to expire.
async fn run_task(assembler: Arc<Assembler>, task: AssembleArtifactsTask) {
    let key = task.key();
    gauge!(ASSEMBLE_TASK_IN_FLIGHT).increment(1.0);

    let inner = assembler.clone();
    let result = tokio::spawn(async move { inner.assemble_artifacts(&task).await }).await;

    gauge!(ASSEMBLE_TASK_IN_FLIGHT).decrement(1.0);

    if let Err(e) = result {
        tracing::error!(%key, "Assemble task panicked: {e}");
        let detail = Some("Internal error while assembling".into());
        if let Err(e) = assembler
            .statuses()
            .set(&key, ChunkFileState::Error, detail)
            .await
        {
            tracing::error!(%key, "Failed to record assemble failure: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundles::{BundleStore, MemoryBundleStore};
    use crate::chunks::{ChunkStore, MemoryChunkStore};
    use crate::status::{AssembleStatusStore, CacheStatusStore};
    use bytes::Bytes;
    use std::time::Duration;

    fn empty_task() -> AssembleArtifactsTask {
        AssembleArtifactsTask {
            org_id: 1,
            version: "1.0.0".into(),
            checksum: Checksum::compute(b""),
            chunks: vec![],
            project_ids: vec![],
            is_release_bundle_migration: true,
        }
    }

    #[test]
    fn test_reserve_full_and_closed() {
        let (queue, mut rx) = TaskQueue::channel(1);
        assert!(!queue.is_closed());

        let permit = queue.try_reserve().unwrap();
        // An outstanding permit occupies the only slot
        assert_eq!(queue.try_reserve().err(), Some(EnqueueError::Full));
        drop(permit);

        queue.try_reserve().unwrap().send(empty_task());
        assert_eq!(queue.try_reserve().err(), Some(EnqueueError::Full));
        assert_eq!(rx.try_recv().unwrap(), empty_task());

        drop(rx);
        assert!(queue.is_closed());
        assert_eq!(queue.try_reserve().err(), Some(EnqueueError::Closed));
    }

    #[test]
    fn test_task_payload() {
        let task = AssembleArtifactsTask {
            org_id: 1,
            version: "1.0.0".into(),
            checksum: "a".repeat(40).parse().unwrap(),
            chunks: vec!["b".repeat(40).parse().unwrap()],
            project_ids: vec![10],
            is_release_bundle_migration: true,
        };

        assert_eq!(
            serde_json::to_value(&task).unwrap(),
            serde_json::json!({
                "org_id": 1,
                "version": "1.0.0",
                "checksum": "a".repeat(40),
                "chunks": ["b".repeat(40)],
                "project_ids": [10],
                "is_release_bundle_migration": true,
            })
        );
    }

    #[tokio::test]
    async fn test_workers_process_queue() {
        let statuses = Arc::new(CacheStatusStore::default());
        let chunks = Arc::new(MemoryChunkStore::new());
        let bundles = Arc::new(MemoryBundleStore::new());
        let assembler = Arc::new(Assembler::new(
            statuses.clone(),
            chunks.clone(),
            bundles.clone(),
            1024,
        ));

        let (queue, rx) = TaskQueue::channel(8);
        let workers = tokio::spawn(run_workers(assembler, rx, 2));

        let mut tasks = Vec::new();
        for i in 0..5u8 {
            let data = Bytes::from(vec![i; 16]);
            let chunk = chunks.put(data.clone()).await.unwrap();
            let task = AssembleArtifactsTask {
                org_id: 1,
                version: "1.0.0".into(),
                checksum: Checksum::compute(&data),
                chunks: vec![chunk],
                project_ids: vec![10],
                is_release_bundle_migration: true,
            };
            queue.try_reserve().unwrap().send(task.clone());
            tasks.push(task);
        }

        // Closing the queue lets the workers drain and exit
        drop(queue);
        tokio::time::timeout(Duration::from_secs(5), workers)
            .await
            .unwrap()
            .unwrap();

        for task in tasks {
            assert_eq!(
                statuses.get(&task.key()).await.unwrap().map(|s| s.state),
                Some(ChunkFileState::Ok)
            );
            assert!(bundles.get(1, &task.checksum).await.unwrap().is_some());
        }
    }
}
