//! Differ stage (runs on the source host).
//!
//! Consumes the destination's checksum stream in lockstep with our own
//! hashes of the source device and forwards only the blocks that differ.
//! The source is read over the same span the checksum header describes.
//!
//! Length mismatches, when the span runs to the end of the device:
//! - source longer: blocks past the destination's end have no digest to
//!   compare against and are always sent.
//! - source shorter: leftover digests are drained and a `Truncate` frame
//!   carrying the source length closes the stream.
//!
//! A span with an operator limit never truncates.

use crate::device::{self, ByteRange, DeviceReader};
use crate::error::{BlocksyncError, Result};
use crate::hash::{Digest, HashAlgorithm};
use crate::progress::Progress;
use crate::streaming::channel::{HasherConfig, RetrieveConfig, SyncStats};
use crate::streaming::hasher::OrderedHasher;
use crate::streaming::protocol::{
    negotiate, read_checksum_frame, read_header, write_diff_record, write_frame, ChecksumFrame,
    DiffRecord, StreamHeader, StreamKind, Truncate,
};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Differ state
pub struct Differ {
    config: RetrieveConfig,
}

impl Differ {
    pub fn new(config: RetrieveConfig) -> Self {
        Self { config }
    }

    /// Read the checksum stream from `reader`, write the diff stream to
    /// `writer`.
    pub async fn run<R, W>(self, reader: &mut R, writer: &mut W) -> Result<SyncStats>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        // 1. Handshake
        let dest = read_header(reader, StreamKind::Checksum).await?;
        let (block_size, algorithm) =
            negotiate(&dest, self.config.block_size, self.config.algorithm)?;

        let range = ByteRange {
            start: dest.start_offset,
            end: dest.limit,
        };
        let device = DeviceReader::open_range(&self.config.path, block_size, range)?;
        let source_end = device.end_offset().unwrap_or(dest.start_offset);
        let source_blocks = device.block_count().unwrap_or(0);

        tracing::debug!(
            "Negotiated block size {}, {}; span from {}, destination ends at {}, source at {}",
            block_size,
            algorithm,
            dest.start_offset,
            dest.end_offset
                .map_or_else(|| "EOF".to_string(), |end| end.to_string()),
            source_end
        );

        let header = StreamHeader::diff(algorithm, block_size, source_end).with_span(
            dest.start_offset,
            Some(source_end),
            dest.limit,
        );
        write_frame(writer, &header.encode()).await?;

        // 2. Compare block by block
        let progress = Progress::new(self.config.progress, "retrieve", device.span_len());
        let mut hasher =
            OrderedHasher::spawn(HasherConfig::new(algorithm, self.config.workers), device)?;
        let mut digests = DestDigests::new(&dest, algorithm);
        let mut stats = SyncStats::new();

        while let Some(hashed) = hasher.next_or_flush(writer).await? {
            let changed = match digests.digest_for(reader, hashed.index).await? {
                Some(digest) => digest != hashed.digest,
                None => true,
            };

            stats.blocks_total += 1;
            progress.advance(hashed.data.len() as u64);

            if changed {
                let record = DiffRecord {
                    index: hashed.index,
                    payload: hashed.data,
                };
                write_diff_record(writer, &record).await?;
                stats.blocks_changed += 1;
                stats.bytes_transferred += record.payload.len() as u64;
            }
        }
        drop(hasher);

        if stats.blocks_total != source_blocks {
            return Err(BlocksyncError::device_io(
                &self.config.path,
                header.offset_of(stats.blocks_total).unwrap_or(source_end),
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("read {} blocks, source has {}", stats.blocks_total, source_blocks),
                ),
            ));
        }

        // 3. Destination longer than source: drain its remaining digests so the
        // checksum side finishes cleanly.
        let dest_end = digests.finish(reader).await?;

        if dest.limit.is_none() && source_end < dest_end {
            write_frame(writer, &Truncate { length: source_end }.encode()).await?;
            stats.truncated_to = Some(source_end);
        }

        writer.flush().await.map_err(BlocksyncError::stream)?;
        progress.finish();

        tracing::info!(
            "retrieve: {} of {} blocks changed, {} bytes sent{}",
            stats.blocks_changed,
            stats.blocks_total,
            stats.bytes_transferred,
            match stats.truncated_to {
                Some(len) => format!(", truncate to {}", len),
                None => String::new(),
            }
        );
        Ok(stats)
    }
}

/// Destination digests, consumed in lockstep with the source blocks.
struct DestDigests {
    algorithm: HashAlgorithm,
    block_size: u32,
    start: u64,
    limit: Option<u64>,
    /// From the header, or from the closing `End` frame of a piped destination
    end: Option<u64>,
    /// Index of the next record expected
    next: u64,
}

impl DestDigests {
    fn new(header: &StreamHeader, algorithm: HashAlgorithm) -> Self {
        Self {
            algorithm,
            block_size: header.block_size,
            start: header.start_offset,
            limit: header.limit,
            end: header.end_offset,
            next: 0,
        }
    }

    fn blocks(&self) -> Option<u64> {
        self.end
            .map(|end| device::block_count(end - self.start, self.block_size))
    }

    fn exhausted(&self) -> bool {
        self.blocks().is_some_and(|blocks| self.next >= blocks)
    }

    /// Digest of destination block `index`, `None` once the destination has
    /// ended. Must be called with consecutive indices.
    async fn digest_for<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
        index: u64,
    ) -> Result<Option<Digest>> {
        if self.exhausted() {
            return Ok(None);
        }
        match read_checksum_frame(reader, self.algorithm).await? {
            None => Err(BlocksyncError::UnexpectedEof(format!(
                "checksum stream ended at block {}{}",
                index,
                self.blocks()
                    .map_or_else(String::new, |blocks| format!(" of {}", blocks))
            ))),
            Some(ChecksumFrame::Hash(record)) if record.index != index => {
                Err(BlocksyncError::protocol(format!(
                    "checksum record out of order: expected block {}, got {}",
                    index, record.index
                )))
            }
            Some(ChecksumFrame::Hash(record)) => {
                self.next = index + 1;
                Ok(Some(record.digest))
            }
            Some(ChecksumFrame::End(span)) => {
                self.set_end(span.offset)?;
                Ok(None)
            }
        }
    }

    fn set_end(&mut self, offset: u64) -> Result<()> {
        if self.end.is_some() {
            return Err(BlocksyncError::protocol(
                "end frame in a checksum stream whose header announced its end",
            ));
        }
        if offset < self.start || self.limit.is_some_and(|limit| offset > limit) {
            return Err(BlocksyncError::protocol(format!(
                "end frame offset {} outside the span starting at {}",
                offset, self.start
            )));
        }
        let blocks = device::block_count(offset - self.start, self.block_size);
        if blocks != self.next {
            return Err(BlocksyncError::protocol(format!(
                "end frame at offset {} implies {} blocks, stream carried {}",
                offset, blocks, self.next
            )));
        }
        self.end = Some(offset);
        Ok(())
    }

    /// Consume the digests the source did not need, then require EOF.
    /// Returns where the destination span ends.
    async fn finish<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<u64> {
        while !self.exhausted() {
            self.digest_for(reader, self.next).await?;
        }
        if let Some(extra) = read_checksum_frame(reader, self.algorithm).await? {
            return Err(BlocksyncError::protocol(format!(
                "checksum stream continues past its {} blocks: {:?}",
                self.next, extra
            )));
        }
        Ok(self.end.unwrap_or(self.start))
    }
}
