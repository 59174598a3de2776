// Storage for assembled artifact bundles. A bundle is identified by the organization
// and its checksum; the metadata records which releases and projects it belongs to.
use crate::chunks::{copy_atomic, write_atomic};
use crate::types::{Checksum, OrganizationId, ProjectId};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum BundleStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid bundle metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactBundle {
    pub organization_id: OrganizationId,
    pub checksum: Checksum,
    pub releases: BTreeSet<String>,
    pub project_ids: BTreeSet<ProjectId>,
    pub size: u64,
    pub is_release_bundle_migration: bool,
}

impl ArtifactBundle {
    /// Adds the release and project associations of `other` to this bundle.
    pub fn merge_associations(&mut self, other: &ArtifactBundle) {
        self.releases.extend(other.releases.iter().cloned());
        self.project_ids.extend(other.project_ids.iter().copied());
        self.is_release_bundle_migration |= other.is_release_bundle_migration;
    }
}

#[async_trait]
pub trait BundleStore: Send + Sync {
    /// Returns the metadata of a committed bundle.
    async fn get(
        &self,
        organization_id: OrganizationId,
        checksum: &Checksum,
    ) -> Result<Option<ArtifactBundle>, BundleStoreError>;

    /// Stores the bundle contents read from `contents`. Associations of an
    /// existing bundle with the same checksum are kept and merged with the new ones.
    async fn put(&self, bundle: &ArtifactBundle, contents: &Path) -> Result<(), BundleStoreError>;

    /// Merges the associations of `bundle` into the stored metadata.
    async fn put_metadata(&self, bundle: &ArtifactBundle) -> Result<(), BundleStoreError>;
}

#[derive(Default)]
pub struct MemoryBundleStore {
    bundles: RwLock<HashMap<(OrganizationId, Checksum), (ArtifactBundle, Bytes)>>,
}

impl MemoryBundleStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn data(&self, organization_id: OrganizationId, checksum: &Checksum) -> Option<Bytes> {
        self.bundles
            .read()
            .get(&(organization_id, checksum.clone()))
            .map(|(_, data)| data.clone())
    }
}

#[async_trait]
impl BundleStore for MemoryBundleStore {
    async fn get(
        &self,
        organization_id: OrganizationId,
        checksum: &Checksum,
    ) -> Result<Option<ArtifactBundle>, BundleStoreError> {
        Ok(self
            .bundles
            .read()
            .get(&(organization_id, checksum.clone()))
            .map(|(bundle, _)| bundle.clone()))
    }

    async fn put(&self, bundle: &ArtifactBundle, contents: &Path) -> Result<(), BundleStoreError> {
        let data = Bytes::from(tokio::fs::read(contents).await?);

        let mut guard = self.bundles.write();
        let key = (bundle.organization_id, bundle.checksum.clone());

        let mut stored = bundle.clone();
        if let Some((existing, _)) = guard.get(&key) {
            stored.merge_associations(existing);
        }
        guard.insert(key, (stored, data));
        Ok(())
    }

    async fn put_metadata(&self, bundle: &ArtifactBundle) -> Result<(), BundleStoreError> {
        let mut guard = self.bundles.write();
        if let Some((existing, _)) = guard.get_mut(&(bundle.organization_id, bundle.checksum.clone()))
        {
            existing.merge_associations(bundle);
        }
        Ok(())
    }
}

/// Stores bundles as `<base_dir>/<organization_id>/<checksum>.bundle` with a
/// `<checksum>.json` metadata file next to it.
pub struct FilesystemBundleStore {
    base_dir: PathBuf,
    // Serializes metadata read-modify-write cycles.
    metadata_lock: tokio::sync::Mutex<()>,
}

impl FilesystemBundleStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        FilesystemBundleStore {
            base_dir: base_dir.as_ref().to_path_buf(),
            metadata_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn data_path(&self, organization_id: OrganizationId, checksum: &Checksum) -> PathBuf {
        self.base_dir
            .join(organization_id.to_string())
            .join(format!("{checksum}.bundle"))
    }

    fn metadata_path(&self, organization_id: OrganizationId, checksum: &Checksum) -> PathBuf {
        self.base_dir
            .join(organization_id.to_string())
            .join(format!("{checksum}.json"))
    }

    async fn read_metadata(
        &self,
        organization_id: OrganizationId,
        checksum: &Checksum,
    ) -> Result<Option<ArtifactBundle>, BundleStoreError> {
        match tokio::fs::read(self.metadata_path(organization_id, checksum)).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn merge_metadata(&self, bundle: &ArtifactBundle) -> Result<(), BundleStoreError> {
        let mut merged = bundle.clone();
        if let Some(existing) = self
            .read_metadata(bundle.organization_id, &bundle.checksum)
            .await?
        {
            merged.merge_associations(&existing);
        }

        let raw = serde_json::to_vec_pretty(&merged)?;
        write_atomic(
            &self.metadata_path(bundle.organization_id, &bundle.checksum),
            &raw,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BundleStore for FilesystemBundleStore {
    /// Metadata is written after the contents, so its presence implies a complete bundle.
    async fn get(
        &self,
        organization_id: OrganizationId,
        checksum: &Checksum,
    ) -> Result<Option<ArtifactBundle>, BundleStoreError> {
        self.read_metadata(organization_id, checksum).await
    }

    async fn put(&self, bundle: &ArtifactBundle, contents: &Path) -> Result<(), BundleStoreError> {
        copy_atomic(
            contents,
            &self.data_path(bundle.organization_id, &bundle.checksum),
        )
        .await?;

        let _guard = self.metadata_lock.lock().await;
        self.merge_metadata(bundle).await
    }

    async fn put_metadata(&self, bundle: &ArtifactBundle) -> Result<(), BundleStoreError> {
        let _guard = self.metadata_lock.lock().await;
        if self
            .read_metadata(bundle.organization_id, &bundle.checksum)
            .await?
            .is_none()
        {
            return Ok(());
        }
        self.merge_metadata(bundle).await
    }
}
