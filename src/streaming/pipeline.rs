//! Local sync pipeline.
//!
//! Runs checksum, retrieve and save in one process, wired together with
//! in-memory pipes instead of stdin/stdout:
//!
//! ```text
//! ChecksumProducer(dst) --duplex--> Differ(src) --duplex--> Applier(dst)
//! ```
//!
//! The stages are exactly the ones the CLI runs across hosts, so this is also
//! what the end-to-end tests exercise.

use crate::device::ByteRange;
use crate::error::{BlocksyncError, Result};
use crate::hash::HashAlgorithm;
use crate::streaming::applier::Applier;
use crate::streaming::channel::{
    default_workers, ChecksumConfig, HasherConfig, RetrieveConfig, SaveConfig, SyncStats,
    DEFAULT_BLOCK_SIZE, STREAM_BUFFER_SIZE,
};
use crate::streaming::checksum::ChecksumProducer;
use crate::streaming::differ::Differ;
use std::path::PathBuf;
use tokio::task::JoinHandle;

/// Per-stage statistics of one local run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PipelineStats {
    pub checksum: SyncStats,
    pub retrieve: SyncStats,
    pub save: SyncStats,
}

/// Orchestrator for a local, in-process sync
#[derive(Debug, Clone)]
pub struct LocalSync {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub block_size: u32,
    /// Part of the devices to sync
    pub range: ByteRange,
    pub algorithm: HashAlgorithm,
    pub workers: usize,
    pub progress: bool,
}

impl LocalSync {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            block_size: DEFAULT_BLOCK_SIZE,
            range: ByteRange::default(),
            algorithm: HashAlgorithm::default(),
            workers: default_workers(),
            progress: false,
        }
    }

    /// Sync `source` onto `destination`.
    pub async fn run(&self) -> Result<PipelineStats> {
        let (mut checksum_out, mut checksum_in) = tokio::io::duplex(STREAM_BUFFER_SIZE);
        let (mut diff_out, mut diff_in) = tokio::io::duplex(STREAM_BUFFER_SIZE);

        let checksum = ChecksumProducer::new(ChecksumConfig {
            path: self.destination.clone(),
            block_size: self.block_size,
            range: self.range,
            hasher: HasherConfig::new(self.algorithm, self.workers),
            progress: self.progress,
        });
        let differ = Differ::new(RetrieveConfig {
            path: self.source.clone(),
            block_size: Some(self.block_size),
            algorithm: Some(self.algorithm),
            workers: self.workers,
            progress: false,
        });
        let applier = Applier::new(SaveConfig {
            path: self.destination.clone(),
            progress: self.progress,
        });

        // Each stage owns its pipe ends; finishing a stage drops its writer,
        // which is how the next stage sees end of stream.
        let checksum_task = tokio::spawn(async move { checksum.run(&mut checksum_out).await });
        let differ_task =
            tokio::spawn(async move { differ.run(&mut checksum_in, &mut diff_out).await });
        let applier_task = tokio::spawn(async move { applier.run(&mut diff_in).await });

        let checksum = join_stage("checksum", checksum_task).await;
        let retrieve = join_stage("retrieve", differ_task).await;
        let save = join_stage("save", applier_task).await;

        match (checksum, retrieve, save) {
            (Ok(checksum), Ok(retrieve), Ok(save)) => {
                tracing::info!(
                    "sync: {} -> {}: {} of {} blocks changed, {} bytes written",
                    self.source.display(),
                    self.destination.display(),
                    retrieve.blocks_changed,
                    retrieve.blocks_total,
                    save.bytes_transferred
                );
                Ok(PipelineStats {
                    checksum,
                    retrieve,
                    save,
                })
            }
            (checksum, retrieve, save) => Err(root_cause(vec![
                checksum.err(),
                retrieve.err(),
                save.err(),
            ])),
        }
    }
}

async fn join_stage(name: &str, handle: JoinHandle<Result<SyncStats>>) -> Result<SyncStats> {
    let result = handle
        .await
        .map_err(|e| BlocksyncError::Worker(format!("{} stage task failed: {}", name, e)))?;
    if let Err(e) = &result {
        tracing::debug!("{} stage failed: {}", name, e);
    }
    result
}

/// One failing stage makes its neighbours fail too: downstream sees a cut
/// stream, upstream a closed pipe. Report the first error that is not such a
/// knock-on effect, scanning in pipeline order.
fn root_cause(errors: Vec<Option<BlocksyncError>>) -> BlocksyncError {
    let mut errors: Vec<BlocksyncError> = errors.into_iter().flatten().collect();
    let knock_on = |e: &BlocksyncError| {
        matches!(
            e,
            BlocksyncError::BrokenPipe | BlocksyncError::UnexpectedEof(_)
        )
    };
    match errors.iter().position(|e| !knock_on(e)) {
        Some(i) => errors.swap_remove(i),
        None if !errors.is_empty() => errors.swap_remove(0),
        None => BlocksyncError::Worker("pipeline failed without an error".to_string()),
    }
}
