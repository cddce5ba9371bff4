//! Checksum stage (runs on the destination host).
//!
//! Hashes the destination device block by block and streams the digests
//! out, header first, so the differ can start comparing long before we
//! reach the end of the device.
//!
//! When the destination arrives on stdin its length is unknown until EOF;
//! the header says so and an `End` frame closes the stream instead.

use crate::device::DeviceReader;
use crate::error::{BlocksyncError, Result};
use crate::progress::Progress;
use crate::streaming::channel::{ChecksumConfig, SyncStats, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::streaming::hasher::OrderedHasher;
use crate::streaming::protocol::{write_frame, ChecksumRecord, SpanEnd, StreamHeader};
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub(crate) fn validate_block_size(block_size: u32) -> Result<()> {
    if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        return Err(BlocksyncError::InvalidArgument(format!(
            "block size {} outside supported range {}..={}",
            block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
        )));
    }
    Ok(())
}

/// Checksum producer state
pub struct ChecksumProducer {
    config: ChecksumConfig,
}

impl ChecksumProducer {
    pub fn new(config: ChecksumConfig) -> Self {
        Self { config }
    }

    /// Hash the configured device and write the checksum stream to `writer`.
    pub async fn run<W>(self, writer: &mut W) -> Result<SyncStats>
    where
        W: AsyncWrite + Unpin,
    {
        validate_block_size(self.config.block_size)?;
        let device = if self.config.reads_stdin() {
            DeviceReader::stdin(self.config.block_size, self.config.range)?
        } else {
            DeviceReader::open_range(&self.config.path, self.config.block_size, self.config.range)?
        };
        self.run_device(device, writer).await
    }

    /// Hash an already opened device. Its block size wins over the
    /// configured one.
    pub async fn run_device<W>(self, device: DeviceReader, writer: &mut W) -> Result<SyncStats>
    where
        W: AsyncWrite + Unpin,
    {
        let block_size = device.block_size();
        let algorithm = self.config.hasher.algorithm;
        validate_block_size(block_size)?;

        let name = device.path().to_path_buf();
        let header = StreamHeader::checksum(algorithm, block_size, 0).with_span(
            device.start(),
            device.end_offset(),
            device.limit(),
        );
        write_frame(writer, &header.encode()).await?;

        tracing::debug!(
            "Checksumming {}: span {}..{}, block size {}, {}",
            name.display(),
            header.start_offset,
            header
                .end_offset
                .map_or_else(|| "EOF".to_string(), |end| end.to_string()),
            block_size,
            algorithm
        );

        let progress = Progress::new(self.config.progress, "checksum", device.span_len());
        let mut hasher = OrderedHasher::spawn(self.config.hasher, device)?;
        let mut stats = SyncStats::new();
        let mut hashed_bytes = 0u64;

        while let Some(hashed) = hasher.next_or_flush(writer).await? {
            let record = ChecksumRecord {
                index: hashed.index,
                digest: hashed.digest,
            };
            write_frame(writer, &record.encode()).await?;

            stats.blocks_total += 1;
            hashed_bytes += hashed.data.len() as u64;
            progress.advance(hashed.data.len() as u64);
        }
        drop(hasher);

        let end = header.start_offset + hashed_bytes;
        match header.block_count() {
            Some(expected) if stats.blocks_total != expected => {
                return Err(BlocksyncError::device_io(
                    &name,
                    end,
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("read {} blocks, device has {}", stats.blocks_total, expected),
                    ),
                ));
            }
            Some(_) => {}
            None => write_frame(writer, &SpanEnd { offset: end }.encode()).await?,
        }

        writer.flush().await.map_err(BlocksyncError::stream)?;
        progress.finish();

        tracing::info!(
            "checksum: {} blocks ({} bytes) from {}",
            stats.blocks_total,
            hashed_bytes,
            name.display()
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ByteRange;
    use crate::hash::HashAlgorithm;
    use crate::streaming::channel::HasherConfig;
    use crate::streaming::protocol::{read_checksum_frame, read_header, ChecksumFrame, StreamKind};
    use std::fs;
    use tempfile::TempDir;

    fn config(path: &std::path::Path, block_size: u32, workers: usize) -> ChecksumConfig {
        ChecksumConfig {
            path: path.to_path_buf(),
            block_size,
            range: ByteRange::default(),
            hasher: HasherConfig::new(HashAlgorithm::Blake3, workers),
            progress: false,
        }
    }

    #[tokio::test]
    async fn test_checksum_small_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("dst.img");
        fs::write(&path, b"Hello World!").unwrap();

        let mut out = Vec::new();
        let stats = ChecksumProducer::new(config(&path, 4096, 2))
            .run(&mut out)
            .await
            .unwrap();
        assert_eq!(stats.blocks_total, 1);

        let mut expected = StreamHeader::checksum(HashAlgorithm::Blake3, 4096, 12)
            .encode()
            .to_vec();
        expected.extend_from_slice(
            &ChecksumRecord {
                index: 0,
                digest: HashAlgorithm::Blake3.digest(b"Hello World!"),
            }
            .encode(),
        );
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn test_checksum_partial_final_block() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("dst.img");
        let content: Vec<u8> = (0..5000u32).map(|i| (i * 7 % 256) as u8).collect();
        fs::write(&path, &content).unwrap();

        let mut out = Vec::new();
        ChecksumProducer::new(config(&path, 2048, 4))
            .run(&mut out)
            .await
            .unwrap();

        let mut reader = &out[..];
        let header = read_header(&mut reader, StreamKind::Checksum).await.unwrap();
        assert_eq!(header.block_count(), Some(3));

        for index in 0..3u64 {
            let frame = read_checksum_frame(&mut reader, header.algorithm)
                .await
                .unwrap();
            let Some(ChecksumFrame::Hash(record)) = frame else {
                panic!("expected hash frame, got {:?}", frame);
            };
            assert_eq!(record.index, index);
            let start = index as usize * 2048;
            let end = (start + 2048).min(content.len());
            assert_eq!(record.digest, HashAlgorithm::Blake3.digest(&content[start..end]));
        }
        assert!(read_checksum_frame(&mut reader, header.algorithm)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_checksum_byte_range() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("dst.img");
        let content: Vec<u8> = (0..20_000u32).map(|i| (i * 13 % 256) as u8).collect();
        fs::write(&path, &content).unwrap();

        let mut cfg = config(&path, 4096, 2);
        cfg.range = ByteRange::new(5000, Some(12_000)).unwrap();
        let mut out = Vec::new();
        let stats = ChecksumProducer::new(cfg).run(&mut out).await.unwrap();
        assert_eq!(stats.blocks_total, 2);

        let mut reader = &out[..];
        let header = read_header(&mut reader, StreamKind::Checksum).await.unwrap();
        assert_eq!(header.start_offset, 5000);
        assert_eq!(header.end_offset, Some(12_000));
        assert_eq!(header.limit, Some(12_000));

        let frame = read_checksum_frame(&mut reader, header.algorithm)
            .await
            .unwrap();
        let Some(ChecksumFrame::Hash(first)) = frame else {
            panic!("expected hash frame, got {:?}", frame);
        };
        assert_eq!(first.digest, HashAlgorithm::Blake3.digest(&content[5000..9096]));
    }

    #[tokio::test]
    async fn test_checksum_stream_input_ends_with_end_frame() {
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 97) as u8).collect();
        let device = DeviceReader::from_stream(
            std::path::Path::new("-"),
            std::io::Cursor::new(content.clone()),
            4096,
            ByteRange::default(),
        )
        .unwrap();

        let mut out = Vec::new();
        let stats = ChecksumProducer::new(config(std::path::Path::new("-"), 4096, 3))
            .run_device(device, &mut out)
            .await
            .unwrap();
        assert_eq!(stats.blocks_total, 3);

        let mut reader = &out[..];
        let header = read_header(&mut reader, StreamKind::Checksum).await.unwrap();
        assert_eq!(header.end_offset, None);

        let mut frames = Vec::new();
        while let Some(frame) = read_checksum_frame(&mut reader, header.algorithm)
            .await
            .unwrap()
        {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 4);
        assert_eq!(
            frames[2],
            ChecksumFrame::Hash(ChecksumRecord {
                index: 2,
                digest: HashAlgorithm::Blake3.digest(&content[8192..]),
            })
        );
        assert_eq!(frames[3], ChecksumFrame::End(SpanEnd { offset: 10_000 }));
    }

    #[tokio::test]
    async fn test_checksum_rejects_bad_block_size() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("dst.img");
        fs::write(&path, b"x").unwrap();

        let mut out = Vec::new();
        let err = ChecksumProducer::new(config(&path, 100, 1))
            .run(&mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, BlocksyncError::InvalidArgument(_)));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_checksum_missing_device() {
        let tmp = TempDir::new().unwrap();
        let mut out = Vec::new();
        let err = ChecksumProducer::new(config(&tmp.path().join("nope"), 4096, 1))
            .run(&mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, BlocksyncError::DeviceOpen { .. }));
    }

    #[tokio::test]
    async fn test_device_shrinking_mid_run_is_io_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("dst.img");
        fs::write(&path, vec![7u8; 64 * 1024]).unwrap();

        let device = DeviceReader::open(&path, 4096).unwrap();
        fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(10_000)
            .unwrap();

        let err = ChecksumProducer::new(config(&path, 4096, 2))
            .run_device(device, &mut Vec::<u8>::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BlocksyncError::DeviceIo { .. }), "{:?}", err);
        assert_eq!(err.exit_code(), crate::error::exit_code::IO);
    }
}
