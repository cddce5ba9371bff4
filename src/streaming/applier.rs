//! Applier stage (runs on the destination host).
//!
//! Parses the diff stream on the runtime and hands positioned writes to a
//! single blocking thread that owns the destination device.
//!
//! ```text
//! stdin ---> parse/validate ---> [WriteOp channel] ---> writer thread ---> device
//! ```

use crate::device::{self, DeviceWriter};
use crate::error::{BlocksyncError, Result};
use crate::progress::Progress;
use crate::streaming::channel::{SaveConfig, SyncStats, WRITER_CHANNEL_SIZE};
use crate::streaming::protocol::{read_diff_frame, read_header, DiffFrame, StreamHeader, StreamKind};
use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

/// Work item for the device writer thread
#[derive(Debug)]
enum WriteOp {
    Block { offset: u64, payload: Bytes },
    Truncate(u64),
}

/// Applier state
pub struct Applier {
    config: SaveConfig,
}

impl Applier {
    pub fn new(config: SaveConfig) -> Self {
        Self { config }
    }

    /// Read the diff stream from `reader` and apply it to the device.
    pub async fn run<R>(self, reader: &mut R) -> Result<SyncStats>
    where
        R: AsyncRead + Unpin,
    {
        let header = read_header(reader, StreamKind::Diff).await?;
        let device = DeviceWriter::open(&self.config.path)?;

        tracing::debug!(
            "Applying diff to {}: block size {}, span {}..{}, {}",
            self.config.path.display(),
            header.block_size,
            header.start_offset,
            end_offset(&header)?,
            header.algorithm
        );

        let (tx, rx) = mpsc::channel::<WriteOp>(WRITER_CHANNEL_SIZE);
        let writer = tokio::task::spawn_blocking(move || write_loop(device, rx));

        let progress = Progress::new(self.config.progress, "save", None);
        let parsed = parse_stream(reader, &header, &tx, &progress).await;
        drop(tx);

        let written = writer
            .await
            .map_err(|e| BlocksyncError::Worker(format!("device writer task failed: {}", e)))?;

        // A failing writer closes its channel, which surfaces in the parser as
        // a send error. Report the writer's error, it is the real cause.
        let truncated = written?;
        let mut stats = parsed?;
        stats.truncated_to = truncated;
        progress.finish();

        tracing::info!(
            "save: {} blocks, {} bytes written to {}",
            stats.blocks_changed,
            stats.bytes_transferred,
            self.config.path.display()
        );
        Ok(stats)
    }
}

/// `read_header` only lets diff headers through with a known end.
fn end_offset(header: &StreamHeader) -> Result<u64> {
    header
        .end_offset
        .ok_or_else(|| BlocksyncError::protocol("diff stream header does not announce its end"))
}

async fn parse_stream<R>(
    reader: &mut R,
    header: &StreamHeader,
    tx: &mpsc::Sender<WriteOp>,
    progress: &Progress,
) -> Result<SyncStats>
where
    R: AsyncRead + Unpin,
{
    let end = end_offset(header)?;
    let span = end - header.start_offset;
    let block_count = device::block_count(span, header.block_size);
    let mut stats = SyncStats::new();
    let mut last_index: Option<u64> = None;
    let mut truncate: Option<u64> = None;

    while let Some(frame) = read_diff_frame(reader, header.block_size).await? {
        if truncate.is_some() {
            return Err(BlocksyncError::protocol(
                "frame after truncate; truncate must be the last frame",
            ));
        }

        match frame {
            DiffFrame::Data(record) => {
                if let Some(prev) = last_index {
                    if record.index <= prev {
                        return Err(BlocksyncError::protocol(format!(
                            "block {} follows block {}; indices must strictly increase",
                            record.index, prev
                        )));
                    }
                }
                if record.index >= block_count {
                    return Err(BlocksyncError::protocol(format!(
                        "block {} beyond source span end {} ({} blocks)",
                        record.index, end, block_count
                    )));
                }
                let expected = device::block_len(span, header.block_size, record.index);
                if record.payload.len() != expected {
                    return Err(BlocksyncError::protocol(format!(
                        "block {} has {} bytes, expected {}",
                        record.index,
                        record.payload.len(),
                        expected
                    )));
                }
                let offset = header.offset_of(record.index).ok_or_else(|| {
                    BlocksyncError::protocol(format!("block {} offset overflows", record.index))
                })?;

                last_index = Some(record.index);
                let len = record.payload.len() as u64;
                send(
                    tx,
                    WriteOp::Block {
                        offset,
                        payload: record.payload,
                    },
                )
                .await?;

                stats.blocks_total += 1;
                stats.blocks_changed += 1;
                stats.bytes_transferred += len;
                progress.advance(len);
            }
            DiffFrame::Truncate(t) => {
                if let Some(limit) = header.limit {
                    return Err(BlocksyncError::protocol(format!(
                        "truncate in a diff stream limited to offset {}",
                        limit
                    )));
                }
                if t.length != end {
                    return Err(BlocksyncError::protocol(format!(
                        "truncate to {} disagrees with source length {}",
                        t.length, end
                    )));
                }
                truncate = Some(t.length);
            }
        }
    }

    // Only act on a truncate once the stream ended cleanly after it
    if let Some(length) = truncate {
        send(tx, WriteOp::Truncate(length)).await?;
    }
    Ok(stats)
}

async fn send(tx: &mpsc::Sender<WriteOp>, op: WriteOp) -> Result<()> {
    tx.send(op)
        .await
        .map_err(|_| BlocksyncError::Worker("device writer stopped".to_string()))
}

/// Device writer loop. Returns the length the device was truncated to, if any.
fn write_loop(mut device: DeviceWriter, mut rx: mpsc::Receiver<WriteOp>) -> Result<Option<u64>> {
    let mut truncated = None;
    while let Some(op) = rx.blocking_recv() {
        match op {
            WriteOp::Block { offset, payload } => device.write_block(offset, &payload)?,
            WriteOp::Truncate(length) => {
                if device.truncate(length)? {
                    tracing::debug!("Truncated {} to {}", device.path().display(), length);
                    truncated = Some(length);
                } else {
                    tracing::warn!(
                        "{} is not a regular file; leaving its length, not truncating to {}",
                        device.path().display(),
                        length
                    );
                }
            }
        }
    }
    device.sync()?;
    Ok(truncated)
}
