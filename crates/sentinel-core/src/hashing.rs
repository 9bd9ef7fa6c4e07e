//! Streaming file hashing (SHA-256 and MD5), synchronous and asynchronous.
//!
//! Both forms read in 64 KiB chunks and must produce bit-identical digests
//! for the same file; the async form exists only so the scan pipeline can
//! hash without blocking a tokio worker thread.

use md5::Md5;
use sha2::{Digest, Sha256};
use std::io::{self, Read};
use std::path::Path;
use thiserror::Error;
use tokio::io::AsyncReadExt;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("hashing of {path} was cancelled")]
    Cancelled { path: String },
}

/// Which digests to compute. Avoids paying for MD5 when only SHA-256 is
/// needed (the common case) and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Sha256,
    Md5,
    Both,
}

#[derive(Debug, Clone, Default)]
pub struct FileDigest {
    pub sha256: Option<String>,
    pub md5: Option<String>,
    pub size: u64,
}

struct Digesters {
    sha256: Option<Sha256>,
    md5: Option<Md5>,
}

impl Digesters {
    fn new(kind: HashKind) -> Self {
        Self {
            sha256: matches!(kind, HashKind::Sha256 | HashKind::Both).then(Sha256::new),
            md5: matches!(kind, HashKind::Md5 | HashKind::Both).then(Md5::new),
        }
    }

    fn update(&mut self, chunk: &[u8]) {
        if let Some(h) = self.sha256.as_mut() {
            h.update(chunk);
        }
        if let Some(h) = self.md5.as_mut() {
            h.update(chunk);
        }
    }

    fn finish(self, size: u64) -> FileDigest {
        FileDigest {
            sha256: self.sha256.map(|h| hex::encode(h.finalize())),
            md5: self.md5.map(|h| hex::encode(h.finalize())),
            size,
        }
    }
}

/// A cooperative cancellation check, polled once per chunk. Long scans of
/// very large files stay responsive to shutdown without a background task.
pub trait CancelToken {
    fn is_cancelled(&self) -> bool;
}

impl CancelToken for () {
    fn is_cancelled(&self) -> bool {
        false
    }
}

impl CancelToken for std::sync::atomic::AtomicBool {
    fn is_cancelled(&self) -> bool {
        self.load(std::sync::atomic::Ordering::Relaxed)
    }
}

pub fn hash_file_sync(path: &Path, kind: HashKind) -> Result<FileDigest, HashError> {
    hash_file_sync_cancellable(path, kind, &())
}

pub fn hash_file_sync_cancellable(
    path: &Path,
    kind: HashKind,
    cancel: &dyn CancelToken,
) -> Result<FileDigest, HashError> {
    let mut file = std::fs::File::open(path).map_err(|source| HashError::Open {
        path: path.display().to_string(),
        source,
    })?;
    let mut digesters = Digesters::new(kind);
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(HashError::Cancelled {
                path: path.display().to_string(),
            });
        }
        let n = file.read(&mut buffer).map_err(|source| HashError::Read {
            path: path.display().to_string(),
            source,
        })?;
        if n == 0 {
            break;
        }
        digesters.update(&buffer[..n]);
        total += n as u64;
    }
    Ok(digesters.finish(total))
}

pub async fn hash_file_async(path: &Path, kind: HashKind) -> Result<FileDigest, HashError> {
    let mut file =
        tokio::fs::File::open(path)
            .await
            .map_err(|source| HashError::Open {
                path: path.display().to_string(),
                source,
            })?;
    let mut digesters = Digesters::new(kind);
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = file
            .read(&mut buffer)
            .await
            .map_err(|source| HashError::Read {
                path: path.display().to_string(),
                source,
            })?;
        if n == 0 {
            break;
        }
        digesters.update(&buffer[..n]);
        total += n as u64;
    }
    Ok(digesters.finish(total))
}

pub fn hash_bytes(data: &[u8], kind: HashKind) -> FileDigest {
    let mut digesters = Digesters::new(kind);
    digesters.update(data);
    digesters.finish(data.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn sync_and_async_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&vec![0xABu8; 200_000]).unwrap();
        drop(f);

        let sync_digest = hash_file_sync(&path, HashKind::Both).unwrap();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let async_digest = rt.block_on(hash_file_async(&path, HashKind::Both)).unwrap();

        assert_eq!(sync_digest.sha256, async_digest.sha256);
        assert_eq!(sync_digest.md5, async_digest.md5);
        assert_eq!(sync_digest.size, 200_000);
    }

    #[test]
    fn known_vector() {
        let digest = hash_bytes(b"abc", HashKind::Sha256);
        assert_eq!(
            digest.sha256.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn cancellation_is_observed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, vec![0u8; CHUNK_SIZE * 4]).unwrap();

        let cancelled = std::sync::atomic::AtomicBool::new(true);
        let result = hash_file_sync_cancellable(&path, HashKind::Sha256, &cancelled);
        assert!(matches!(result, Err(HashError::Cancelled { .. })));
    }
}
