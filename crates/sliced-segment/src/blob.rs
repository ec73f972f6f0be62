//! Path-addressed blob storage for segment bytes.
//!
//! A segment file starts with a fixed [`HEADER_LEN`]-byte header
//! (timestamp, topic id, log id, start index as little-endian u64s)
//! followed by the appended record bodies. Hashes recorded in segment
//! stats cover the bodies only.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use sliced_state::{ErrorClass, Hash, HashAlgorithm, PathKind, SegmentHeader, SegmentPath};

pub const HEADER_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("{path} is too short to hold a segment header")]
    Truncated { path: String },

    #[error("unsupported segment path {0}")]
    Unsupported(String),
}

impl BlobError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BlobError::Io { .. } => ErrorClass::Transient,
            BlobError::HashMismatch { .. }
            | BlobError::Truncated { .. }
            | BlobError::Unsupported(_) => ErrorClass::Fatal,
        }
    }
}

pub type BlobResult<T> = Result<T, BlobError>;

/// Storage for segment files.
///
/// `create` and `delete` must be idempotent: the provisioner retries
/// them until they succeed.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    async fn create(&self, path: &SegmentPath, header: &SegmentHeader) -> BlobResult<()>;

    async fn append(&self, path: &SegmentPath, body: &[u8]) -> BlobResult<()>;

    async fn read(&self, path: &SegmentPath) -> BlobResult<Vec<u8>>;

    async fn delete(&self, path: &SegmentPath) -> BlobResult<()>;

    /// Check the record bodies of `path` against `hash`.
    async fn verify(&self, path: &SegmentPath, hash: &Hash) -> BlobResult<()> {
        let data = self.read(path).await?;
        let body = data.get(HEADER_LEN..).ok_or_else(|| BlobError::Truncated {
            path: path.to_string(),
        })?;
        let actual = digest(hash.algorithm, body);
        if actual != hash.value {
            return Err(BlobError::HashMismatch {
                path: path.to_string(),
                expected: hash.value.clone(),
                actual,
            });
        }
        Ok(())
    }
}

/// Hex digest of `bytes`.
pub fn digest(algorithm: HashAlgorithm, bytes: &[u8]) -> String {
    match algorithm {
        HashAlgorithm::Crc32c => hex::encode(crc32c::crc32c(bytes).to_be_bytes()),
        HashAlgorithm::Sha256 => hex::encode(Sha256::digest(bytes)),
    }
}

pub fn encode_header(header: &SegmentHeader) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    let fields = [
        header.timestamp,
        header.topic_id,
        header.log_id,
        header.start_index,
    ];
    for (chunk, value) in buf.chunks_exact_mut(8).zip(fields) {
        chunk.copy_from_slice(&value.to_le_bytes());
    }
    buf
}

/// Segment files under `{root}/{volume}/{drive}/{name}`.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a segment path, refusing anything that escapes the root.
    pub fn resolve(&self, path: &SegmentPath) -> BlobResult<PathBuf> {
        if path.kind != PathKind::Local {
            return Err(BlobError::Unsupported(path.to_string()));
        }
        let relative = Path::new(&path.volume_id)
            .join(&path.drive)
            .join(&path.name);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || path.name.is_empty() {
            return Err(BlobError::Unsupported(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

fn io_err(path: &SegmentPath) -> impl FnOnce(std::io::Error) -> BlobError + '_ {
    move |source| BlobError::Io {
        path: path.to_string(),
        source,
    }
}

#[async_trait::async_trait]
impl BlobStore for LocalBlobStore {
    async fn create(&self, path: &SegmentPath, header: &SegmentHeader) -> BlobResult<()> {
        let file = self.resolve(path)?;
        if tokio::fs::try_exists(&file).await.map_err(io_err(path))? {
            debug!(%path, "segment file already exists");
            return Ok(());
        }
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err(path))?;
        }
        // Write under a temporary name so a crash never leaves a
        // half-written header at the final path.
        let tmp = file.with_extension("tmp");
        tokio::fs::write(&tmp, encode_header(header))
            .await
            .map_err(io_err(path))?;
        tokio::fs::rename(&tmp, &file).await.map_err(io_err(path))?;
        debug!(%path, "segment file created");
        Ok(())
    }

    async fn append(&self, path: &SegmentPath, body: &[u8]) -> BlobResult<()> {
        let file = self.resolve(path)?;
        let mut f = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&file)
            .await
            .map_err(io_err(path))?;
        f.write_all(body).await.map_err(io_err(path))?;
        f.flush().await.map_err(io_err(path))?;
        Ok(())
    }

    async fn read(&self, path: &SegmentPath) -> BlobResult<Vec<u8>> {
        let file = self.resolve(path)?;
        tokio::fs::read(&file).await.map_err(io_err(path))
    }

    async fn delete(&self, path: &SegmentPath) -> BlobResult<()> {
        let file = self.resolve(path)?;
        match tokio::fs::remove_file(&file).await {
            Ok(()) => {
                debug!(%path, "segment file deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(path)(e)),
        }
    }
}
