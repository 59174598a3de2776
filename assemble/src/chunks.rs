// Content-addressed storage for uploaded chunks. Every chunk is stored under
// the SHA-1 checksum of its contents.
use crate::types::Checksum;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(thiserror::Error, Debug)]
pub enum ChunkStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn get(&self, checksum: &Checksum) -> Result<Option<Bytes>, ChunkStoreError>;

    async fn contains(&self, checksum: &Checksum) -> Result<bool, ChunkStoreError>;

    /// Stores the chunk and returns the checksum it is addressed by.
    async fn put(&self, data: Bytes) -> Result<Checksum, ChunkStoreError>;
}

#[derive(Default)]
pub struct MemoryChunkStore {
    chunks: RwLock<HashMap<Checksum, Bytes>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores data under an arbitrary checksum, bypassing content addressing.
    #[cfg(test)]
    pub fn insert_raw(&self, checksum: Checksum, data: Bytes) {
        self.chunks.write().insert(checksum, data);
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn get(&self, checksum: &Checksum) -> Result<Option<Bytes>, ChunkStoreError> {
        Ok(self.chunks.read().get(checksum).cloned())
    }

    async fn contains(&self, checksum: &Checksum) -> Result<bool, ChunkStoreError> {
        Ok(self.chunks.read().contains_key(checksum))
    }

    async fn put(&self, data: Bytes) -> Result<Checksum, ChunkStoreError> {
        let checksum = Checksum::compute(&data);
        self.chunks.write().insert(checksum.clone(), data);
        Ok(checksum)
    }
}

/// Stores chunks as `<base_dir>/<first two hex chars>/<remaining hex chars>`.
pub struct FilesystemChunkStore {
    base_dir: PathBuf,
}

impl FilesystemChunkStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        FilesystemChunkStore {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    fn path(&self, checksum: &Checksum) -> PathBuf {
        let (prefix, rest) = checksum.as_str().split_at(2);
        self.base_dir.join(prefix).join(rest)
    }
}

#[async_trait]
impl ChunkStore for FilesystemChunkStore {
    async fn get(&self, checksum: &Checksum) -> Result<Option<Bytes>, ChunkStoreError> {
        match tokio::fs::read(self.path(checksum)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn contains(&self, checksum: &Checksum) -> Result<bool, ChunkStoreError> {
        Ok(tokio::fs::try_exists(self.path(checksum)).await?)
    }

    async fn put(&self, data: Bytes) -> Result<Checksum, ChunkStoreError> {
        let checksum = Checksum::compute(&data);
        let path = self.path(&checksum);

        if tokio::fs::try_exists(&path).await? {
            return Ok(checksum);
        }

        write_atomic(&path, &data).await?;
        Ok(checksum)
    }
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

async fn temp_sibling(path: &Path) -> io::Result<PathBuf> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(format!(".{}-{seq}.tmp", std::process::id()));
    Ok(PathBuf::from(tmp_name))
}

async fn rename_into_place(tmp_path: &Path, path: &Path) -> io::Result<()> {
    if let Err(e) = tokio::fs::rename(tmp_path, path).await {
        let _ = tokio::fs::remove_file(tmp_path).await;
        return Err(e);
    }
    Ok(())
}

/// Writes through a temporary sibling file so readers never observe partial content.
pub(crate) async fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp_path = temp_sibling(path).await?;
    tokio::fs::write(&tmp_path, data).await?;
    rename_into_place(&tmp_path, path).await
}

/// Like `write_atomic`, with the content copied from another file.
pub(crate) async fn copy_atomic(source: &Path, path: &Path) -> io::Result<()> {
    let tmp_path = temp_sibling(path).await?;
    tokio::fs::copy(source, &tmp_path).await?;
    rename_into_place(&tmp_path, path).await
}
