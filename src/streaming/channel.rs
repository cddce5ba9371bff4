//! Channel types and tunables for the block pipeline.
//!
//! Reader -> hash workers -> reorder -> stage, with bounded channels
//! everywhere for backpressure.

use crate::device::ByteRange;
use crate::hash::{Digest, HashAlgorithm};
use bytes::Bytes;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Default block size (128KB)
pub const DEFAULT_BLOCK_SIZE: u32 = 128 * 1024;

/// Smallest block size a header may announce
pub const MIN_BLOCK_SIZE: u32 = 512;

/// Largest block size a header may announce (64MB) - caps per-frame allocation
pub const MAX_BLOCK_SIZE: u32 = 64 * 1024 * 1024;

/// Upper bound on the default worker count
pub const MAX_DEFAULT_WORKERS: usize = 8;

/// In-flight blocks per worker (dispatched but not yet emitted in order)
pub const WINDOW_PER_WORKER: usize = 4;

/// Channel size for reorder stage -> consuming stage
pub const HASHED_CHANNEL_SIZE: usize = 16;

/// Channel size for frame parser -> device writer in the applier
pub const WRITER_CHANNEL_SIZE: usize = 16;

/// Buffer size for stdin/stdout wrappers
pub const STREAM_BUFFER_SIZE: usize = 256 * 1024;

/// Default worker count: available parallelism, capped.
pub fn default_workers() -> usize {
    num_cpus::get().clamp(1, MAX_DEFAULT_WORKERS)
}

// =============================================================================
// HashedBlock: reorder stage -> stage
// =============================================================================

/// A block together with its digest, released in index order.
#[derive(Debug, Clone)]
pub struct HashedBlock {
    pub index: u64,
    pub data: Bytes,
    pub digest: Digest,
}

/// Receiving end of the ordered hasher output.
pub type HashedReceiver = mpsc::Receiver<crate::error::Result<HashedBlock>>;

/// Sending end of the ordered hasher output (used from the reorder thread).
pub type HashedSender = mpsc::Sender<crate::error::Result<HashedBlock>>;

pub fn hashed_channel() -> (HashedSender, HashedReceiver) {
    mpsc::channel(HASHED_CHANNEL_SIZE)
}

// =============================================================================
// Stage configuration
// =============================================================================

/// Worker pool configuration, shared by the checksum and retrieve stages.
#[derive(Debug, Clone, Copy)]
pub struct HasherConfig {
    pub algorithm: HashAlgorithm,
    /// Number of hash worker threads
    pub workers: usize,
    /// Maximum blocks dispatched but not yet emitted
    pub window: usize,
}

impl HasherConfig {
    pub fn new(algorithm: HashAlgorithm, workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            algorithm,
            workers,
            window: workers * WINDOW_PER_WORKER,
        }
    }
}

impl Default for HasherConfig {
    fn default() -> Self {
        Self::new(HashAlgorithm::default(), default_workers())
    }
}

/// Checksum stage configuration
#[derive(Debug, Clone)]
pub struct ChecksumConfig {
    /// Destination device to hash; `-` reads it from stdin
    pub path: PathBuf,
    pub block_size: u32,
    /// Part of the device to hash
    pub range: ByteRange,
    pub hasher: HasherConfig,
    pub progress: bool,
}

impl ChecksumConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_size: DEFAULT_BLOCK_SIZE,
            range: ByteRange::default(),
            hasher: HasherConfig::default(),
            progress: false,
        }
    }

    pub fn reads_stdin(&self) -> bool {
        self.path.as_os_str() == "-"
    }
}

/// Retrieve (differ) stage configuration
#[derive(Debug, Clone)]
pub struct RetrieveConfig {
    /// Source device
    pub path: PathBuf,
    /// Block size pinned by the operator; `None` adopts the header's
    pub block_size: Option<u32>,
    /// Algorithm pinned by the operator; `None` adopts the header's
    pub algorithm: Option<HashAlgorithm>,
    pub workers: usize,
    pub progress: bool,
}

impl RetrieveConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_size: None,
            algorithm: None,
            workers: default_workers(),
            progress: false,
        }
    }
}

/// Save (applier) stage configuration
#[derive(Debug, Clone)]
pub struct SaveConfig {
    /// Destination device, updated in place
    pub path: PathBuf,
    pub progress: bool,
}

impl SaveConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            progress: false,
        }
    }
}

// =============================================================================
// Sync statistics
// =============================================================================

/// Statistics for one stage run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncStats {
    /// Blocks hashed (checksum, retrieve) or received (save)
    pub blocks_total: u64,

    /// Blocks whose digest differed or that had no counterpart
    pub blocks_changed: u64,

    /// Payload bytes sent (retrieve) or written (save)
    pub bytes_transferred: u64,

    /// Length the destination was truncated to, if any
    pub truncated_to: Option<u64>,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hasher_config_window_scales_with_workers() {
        let cfg = HasherConfig::new(HashAlgorithm::Blake3, 8);
        assert_eq!(cfg.workers, 8);
        assert_eq!(cfg.window, 8 * WINDOW_PER_WORKER);

        let cfg = HasherConfig::new(HashAlgorithm::Blake3, 0);
        assert_eq!(cfg.workers, 1);
        assert!(cfg.window >= 1);
    }

    #[test]
    fn test_default_workers_capped() {
        let n = default_workers();
        assert!(n >= 1);
        assert!(n <= MAX_DEFAULT_WORKERS);
    }

    #[test]
    fn test_checksum_config_stdin() {
        assert!(ChecksumConfig::new("-").reads_stdin());
        assert!(!ChecksumConfig::new("./-").reads_stdin());
        assert_eq!(ChecksumConfig::new("/dev/sdb").range, ByteRange::default());
    }

    #[test]
    fn test_retrieve_config_adopts_by_default() {
        let cfg = RetrieveConfig::new("/dev/src");
        assert!(cfg.block_size.is_none());
        assert!(cfg.algorithm.is_none());
    }

    #[tokio::test]
    async fn test_hashed_channel() {
        let (tx, mut rx) = hashed_channel();
        let data = Bytes::from_static(b"abc");
        tx.send(Ok(HashedBlock {
            index: 7,
            digest: HashAlgorithm::Blake3.digest(&data),
            data,
        }))
        .await
        .unwrap();
        drop(tx);

        let received = rx.recv().await.unwrap().unwrap();
        assert_eq!(received.index, 7);
        assert!(rx.recv().await.is_none());
    }
}
