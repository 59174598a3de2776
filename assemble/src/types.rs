use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;

pub type OrganizationId = u64;
pub type ProjectId = u64;

const CHECKSUM_LEN: usize = 40;

#[derive(thiserror::Error, Debug, PartialEq)]
#[error("'{0}' does not match '^[0-9a-f]{{40}}$'")]
pub struct ChecksumError(pub String);

/// Lowercase hex SHA-1 digest identifying a chunk or an assembled file.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum(String);

impl Checksum {
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Self::hasher();
        hasher.update(data);
        hasher.finish()
    }

    /// Create an incremental hasher.
    pub fn hasher() -> ChecksumHasher {
        ChecksumHasher(Sha1::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Checksum {
    type Err = ChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s.len() == CHECKSUM_LEN
            && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));

        if !valid {
            return Err(ChecksumError(s.to_string()));
        }
        Ok(Checksum(s.to_string()))
    }
}

impl TryFrom<String> for Checksum {
    type Error = ChecksumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Checksum> for String {
    fn from(checksum: Checksum) -> Self {
        checksum.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub struct ChecksumHasher(Sha1);

impl ChecksumHasher {
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finish(self) -> Checksum {
        Checksum(format!("{:x}", self.0.finalize()))
    }
}

/// Kind of assembly a registry entry belongs to. Keys of different kinds never collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AssembleTaskKind {
    /// Debug information files. Not assembled by this service, the kind only
    /// reserves its key namespace in a registry shared with other uploaders.
    Dif,
    ArtifactBundle,
}

impl AssembleTaskKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            AssembleTaskKind::Dif => "project.dsym",
            AssembleTaskKind::ArtifactBundle => "organization.artifact_bundle",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AssembleKey {
    pub task_kind: AssembleTaskKind,
    pub organization_id: OrganizationId,
    pub checksum: Checksum,
}

impl AssembleKey {
    pub fn new(
        task_kind: AssembleTaskKind,
        organization_id: OrganizationId,
        checksum: Checksum,
    ) -> Self {
        AssembleKey {
            task_kind,
            organization_id,
            checksum,
        }
    }

    pub fn artifact_bundle(organization_id: OrganizationId, checksum: Checksum) -> Self {
        Self::new(AssembleTaskKind::ArtifactBundle, organization_id, checksum)
    }
}

impl fmt::Display for AssembleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}",
            self.organization_id,
            self.task_kind.as_str(),
            self.checksum
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkFileState {
    NotFound,
    Created,
    Assembling,
    Ok,
    Error,
}

impl ChunkFileState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ChunkFileState::NotFound => "not_found",
            ChunkFileState::Created => "created",
            ChunkFileState::Assembling => "assembling",
            ChunkFileState::Ok => "ok",
            ChunkFileState::Error => "error",
        }
    }

    /// Only the assembler writes terminal states.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, ChunkFileState::Ok | ChunkFileState::Error)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssembleStatus {
    pub state: ChunkFileState,
    pub detail: Option<String>,
}

impl AssembleStatus {
    pub fn new(state: ChunkFileState, detail: Option<String>) -> Self {
        AssembleStatus { state, detail }
    }
}
