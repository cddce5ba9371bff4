//! Wire format for the checksum and diff streams.
//!
//! Both streams are plain byte streams so they survive any pipe or
//! remote-shell tunnel. No out-of-band signalling: a fixed-size header, then
//! tagged frames, then EOF.

use crate::device;
use crate::error::{BlocksyncError, Result};
use crate::hash::{Digest, HashAlgorithm, MAX_DIGEST_LEN};
use crate::streaming::channel::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Stream magic
pub const MAGIC: [u8; 4] = *b"BSYN";

/// Wire format version. Producer and consumer are always the same build, so
/// there is no negotiation across versions: anything else is rejected.
pub const PROTOCOL_VERSION: u16 = 1;

/// Wire format: all multi-byte integers are big-endian
/// Header: magic[4] | version:u16 | kind:u8 | algorithm:u8 | block_size:u32 | flags:u8
///         | start:u64 | end:u64 | limit:u64
pub const HEADER_SIZE: usize = 4 + 2 + 1 + 1 + 4 + 1 + 8 + 8 + 8;

/// `end` is not known yet; a closing `'E'` frame carries it
pub const FLAG_END_TRAILER: u8 = 0x01;

/// `limit` is set: the span stops at an operator-chosen offset, not at the
/// end of the device
pub const FLAG_LIMIT: u8 = 0x02;

// =============================================================================
// Stream and frame types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamKind {
    /// Destination digests, produced by `checksum`
    Checksum = 1,
    /// Changed blocks, produced by `retrieve`
    Diff = 2,
}

impl StreamKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Checksum),
            2 => Some(Self::Diff),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameTag {
    /// index:u64 | digest
    Hash = b'H',
    /// offset:u64
    End = b'E',
    /// index:u64 | len:u32 | payload
    Data = b'D',
    /// length:u64
    Truncate = b'T',
}

impl FrameTag {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            b'H' => Some(Self::Hash),
            b'E' => Some(Self::End),
            b'D' => Some(Self::Data),
            b'T' => Some(Self::Truncate),
            _ => None,
        }
    }
}

// =============================================================================
// Stream header
// =============================================================================

/// Describes the span of the device a stream covers. Block `i` starts at
/// `start_offset + i * block_size` and no block reaches past `end_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub kind: StreamKind,
    pub algorithm: HashAlgorithm,
    pub block_size: u32,
    /// Device offset of block 0
    pub start_offset: u64,
    /// Device offset where the span stops. `None` when the producer reads a
    /// pipe and only learns it at EOF; the stream then closes with an `End`
    /// frame.
    pub end_offset: Option<u64>,
    /// Upper bound the operator put on the span. `None` runs to the end of
    /// the device, which is what makes extending and truncating meaningful.
    pub limit: Option<u64>,
}

impl StreamHeader {
    /// Header for a whole device of `end_offset` bytes.
    pub fn checksum(algorithm: HashAlgorithm, block_size: u32, end_offset: u64) -> Self {
        Self {
            kind: StreamKind::Checksum,
            algorithm,
            block_size,
            start_offset: 0,
            end_offset: Some(end_offset),
            limit: None,
        }
    }

    pub fn diff(algorithm: HashAlgorithm, block_size: u32, end_offset: u64) -> Self {
        Self {
            kind: StreamKind::Diff,
            ..Self::checksum(algorithm, block_size, end_offset)
        }
    }

    /// Restrict the header to part of a device.
    pub fn with_span(mut self, start: u64, end: Option<u64>, limit: Option<u64>) -> Self {
        self.start_offset = start;
        self.end_offset = end;
        self.limit = limit;
        self
    }

    /// Bytes covered, once the end is known.
    pub fn span_len(&self) -> Option<u64> {
        self.end_offset
            .map(|end| end.saturating_sub(self.start_offset))
    }

    pub fn block_count(&self) -> Option<u64> {
        self.span_len()
            .map(|len| device::block_count(len, self.block_size))
    }

    pub fn block_len(&self, index: u64) -> Option<usize> {
        self.span_len()
            .map(|len| device::block_len(len, self.block_size, index))
    }

    /// Device offset of block `index`, `None` on overflow.
    pub fn offset_of(&self, index: u64) -> Option<u64> {
        index
            .checked_mul(self.block_size as u64)
            .and_then(|rel| rel.checked_add(self.start_offset))
    }

    pub fn encode(&self) -> Bytes {
        let mut flags = 0u8;
        if self.end_offset.is_none() {
            flags |= FLAG_END_TRAILER;
        }
        if self.limit.is_some() {
            flags |= FLAG_LIMIT;
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_slice(&MAGIC);
        buf.put_u16(PROTOCOL_VERSION);
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.algorithm.id());
        buf.put_u32(self.block_size);
        buf.put_u8(flags);
        buf.put_u64(self.start_offset);
        buf.put_u64(self.end_offset.unwrap_or(0));
        buf.put_u64(self.limit.unwrap_or(0));
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self> {
        if payload.remaining() < HEADER_SIZE {
            return Err(BlocksyncError::protocol("stream header too short"));
        }
        let mut magic = [0u8; 4];
        payload.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(BlocksyncError::protocol(format!(
                "bad stream magic {:02x?}, not a blocksync stream",
                magic
            )));
        }
        let version = payload.get_u16();
        if version != PROTOCOL_VERSION {
            return Err(BlocksyncError::mismatch(format!(
                "stream protocol version {} (this build speaks {})",
                version, PROTOCOL_VERSION
            )));
        }
        let kind_id = payload.get_u8();
        let kind = StreamKind::from_u8(kind_id)
            .ok_or_else(|| BlocksyncError::protocol(format!("unknown stream kind {}", kind_id)))?;
        let algo_id = payload.get_u8();
        let algorithm = HashAlgorithm::from_u8(algo_id).ok_or_else(|| {
            BlocksyncError::mismatch(format!("unsupported hash algorithm id {}", algo_id))
        })?;
        let block_size = payload.get_u32();
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
            return Err(BlocksyncError::mismatch(format!(
                "block size {} outside supported range {}..={}",
                block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }
        let flags = payload.get_u8();
        if flags & !(FLAG_END_TRAILER | FLAG_LIMIT) != 0 {
            return Err(BlocksyncError::protocol(format!(
                "unknown header flags 0x{:02x}",
                flags
            )));
        }
        let start_offset = payload.get_u64();
        let end = payload.get_u64();
        let limit = payload.get_u64();
        let end_offset = (flags & FLAG_END_TRAILER == 0).then_some(end);
        let limit = (flags & FLAG_LIMIT != 0).then_some(limit);

        if let Some(limit) = limit {
            if limit < start_offset {
                return Err(BlocksyncError::protocol(format!(
                    "span limit {} precedes its start {}",
                    limit, start_offset
                )));
            }
        }
        if let Some(end) = end_offset {
            if end < start_offset || limit.is_some_and(|limit| end > limit) {
                return Err(BlocksyncError::protocol(format!(
                    "span end {} outside {}..={}",
                    end,
                    start_offset,
                    limit.map_or_else(String::new, |l| l.to_string())
                )));
            }
        }

        Ok(Self {
            kind,
            algorithm,
            block_size,
            start_offset,
            end_offset,
            limit,
        })
    }
}

// =============================================================================
// HASH frame ('H')
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumRecord {
    pub index: u64,
    pub digest: Digest,
}

impl ChecksumRecord {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + 8 + self.digest.len());
        buf.put_u8(FrameTag::Hash as u8);
        buf.put_u64(self.index);
        buf.put_slice(self.digest.as_bytes());
        buf.freeze()
    }
}

// =============================================================================
// END frame ('E')
// =============================================================================

/// Closes a checksum stream whose header could not announce its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanEnd {
    pub offset: u64,
}

impl SpanEnd {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + 8);
        buf.put_u8(FrameTag::End as u8);
        buf.put_u64(self.offset);
        buf.freeze()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumFrame {
    Hash(ChecksumRecord),
    End(SpanEnd),
}

// =============================================================================
// DATA frame ('D')
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffRecord {
    pub index: u64,
    pub payload: Bytes,
}

impl DiffRecord {
    pub const HEADER_LEN: usize = 1 + 8 + 4;

    /// Encode only the frame header; the payload is written separately to
    /// avoid copying whole blocks.
    pub fn encode_header(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEADER_LEN);
        buf.put_u8(FrameTag::Data as u8);
        buf.put_u64(self.index);
        buf.put_u32(self.payload.len() as u32);
        buf.freeze()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEADER_LEN + self.payload.len());
        buf.put_slice(&self.encode_header());
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

// =============================================================================
// TRUNCATE frame ('T')
// =============================================================================

/// Control frame telling the applier to shrink the destination to `length`.
/// Sent at most once, after every data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncate {
    pub length: u64,
}

impl Truncate {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + 8);
        buf.put_u8(FrameTag::Truncate as u8);
        buf.put_u64(self.length);
        buf.freeze()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffFrame {
    Data(DiffRecord),
    Truncate(Truncate),
}

// =============================================================================
// Handshake
// =============================================================================

/// Validate an incoming checksum header against the parameters the operator
/// pinned locally. Unpinned parameters are adopted from the header; pinned
/// ones must match exactly.
pub fn negotiate(
    header: &StreamHeader,
    block_size: Option<u32>,
    algorithm: Option<HashAlgorithm>,
) -> Result<(u32, HashAlgorithm)> {
    if header.kind != StreamKind::Checksum {
        return Err(BlocksyncError::mismatch(format!(
            "expected a checksum stream, got {:?}",
            header.kind
        )));
    }
    if let Some(local) = block_size {
        if local != header.block_size {
            return Err(BlocksyncError::mismatch(format!(
                "block size {} requested but checksum stream uses {}",
                local, header.block_size
            )));
        }
    }
    if let Some(local) = algorithm {
        if local != header.algorithm {
            return Err(BlocksyncError::mismatch(format!(
                "hash algorithm {} requested but checksum stream uses {}",
                local, header.algorithm
            )));
        }
    }
    Ok((header.block_size, header.algorithm))
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Map an I/O error hit in the middle of a frame.
fn frame_error(err: io::Error, what: impl FnOnce() -> String) -> BlocksyncError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        BlocksyncError::UnexpectedEof(what())
    } else {
        BlocksyncError::stream(err)
    }
}

/// Read and validate the stream header.
pub async fn read_header<R: AsyncRead + Unpin>(
    r: &mut R,
    expected: StreamKind,
) -> Result<StreamHeader> {
    let mut buf = [0u8; HEADER_SIZE];
    r.read_exact(&mut buf)
        .await
        .map_err(|e| frame_error(e, || "input closed before the stream header".to_string()))?;
    let header = StreamHeader::decode(&buf)?;
    if header.kind != expected {
        return Err(BlocksyncError::mismatch(format!(
            "expected a {:?} stream, got a {:?} stream",
            expected, header.kind
        )));
    }
    // The differ always reads a seekable source, so it knows where it stops
    if header.kind == StreamKind::Diff && header.end_offset.is_none() {
        return Err(BlocksyncError::protocol(
            "diff stream header does not announce its end",
        ));
    }
    Ok(header)
}

/// Read a frame tag. `None` on EOF at a frame boundary.
async fn read_tag<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<FrameTag>> {
    let tag = match r.read_u8().await {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(BlocksyncError::stream(e)),
    };
    FrameTag::from_u8(tag)
        .map(Some)
        .ok_or_else(|| BlocksyncError::protocol(format!("unknown frame tag 0x{:02x}", tag)))
}

/// Read the next checksum stream frame. `None` on clean end of stream.
pub async fn read_checksum_frame<R: AsyncRead + Unpin>(
    r: &mut R,
    algorithm: HashAlgorithm,
) -> Result<Option<ChecksumFrame>> {
    match read_tag(r).await? {
        None => Ok(None),
        Some(FrameTag::Hash) => {
            let index = r
                .read_u64()
                .await
                .map_err(|e| frame_error(e, || "truncated hash frame".to_string()))?;
            let mut raw = [0u8; MAX_DIGEST_LEN];
            let raw = &mut raw[..algorithm.digest_len()];
            r.read_exact(raw).await.map_err(|e| {
                frame_error(e, || format!("truncated digest for block {}", index))
            })?;
            let digest = Digest::from_slice(raw)
                .ok_or_else(|| BlocksyncError::protocol("digest too wide"))?;
            Ok(Some(ChecksumFrame::Hash(ChecksumRecord { index, digest })))
        }
        Some(FrameTag::End) => {
            let offset = r
                .read_u64()
                .await
                .map_err(|e| frame_error(e, || "truncated end frame".to_string()))?;
            Ok(Some(ChecksumFrame::End(SpanEnd { offset })))
        }
        Some(tag) => Err(BlocksyncError::protocol(format!(
            "unexpected {:?} frame in checksum stream",
            tag
        ))),
    }
}

/// Read the next diff frame. `None` on clean end of stream.
pub async fn read_diff_frame<R: AsyncRead + Unpin>(
    r: &mut R,
    block_size: u32,
) -> Result<Option<DiffFrame>> {
    match read_tag(r).await? {
        None => Ok(None),
        Some(FrameTag::Data) => {
            let index = r
                .read_u64()
                .await
                .map_err(|e| frame_error(e, || "truncated data frame".to_string()))?;
            let len = r.read_u32().await.map_err(|e| {
                frame_error(e, || format!("truncated data frame for block {}", index))
            })?;

            // Validate length before allocation
            if len == 0 || len > block_size {
                return Err(BlocksyncError::protocol(format!(
                    "data frame for block {} has length {} (block size {})",
                    index, len, block_size
                )));
            }

            let mut payload = BytesMut::zeroed(len as usize);
            r.read_exact(&mut payload).await.map_err(|e| {
                frame_error(e, || format!("truncated payload for block {}", index))
            })?;
            Ok(Some(DiffFrame::Data(DiffRecord {
                index,
                payload: payload.freeze(),
            })))
        }
        Some(FrameTag::Truncate) => {
            let length = r
                .read_u64()
                .await
                .map_err(|e| frame_error(e, || "truncated truncate frame".to_string()))?;
            Ok(Some(DiffFrame::Truncate(Truncate { length })))
        }
        Some(tag) => Err(BlocksyncError::protocol(format!(
            "unexpected {:?} frame in diff stream",
            tag
        ))),
    }
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &[u8]) -> Result<()> {
    w.write_all(frame).await.map_err(BlocksyncError::stream)
}

/// Write a data frame without copying the payload into a staging buffer.
pub async fn write_diff_record<W: AsyncWrite + Unpin>(
    w: &mut W,
    record: &DiffRecord,
) -> Result<()> {
    write_frame(w, &record.encode_header()).await?;
    write_frame(w, &record.payload).await
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = StreamHeader::checksum(HashAlgorithm::Blake3, 4096, 12_345);
        let encoded = header.encode();
        assert_eq!(encoded.len(), HEADER_SIZE);
        assert_eq!(&encoded[..4], b"BSYN");
        assert_eq!(&encoded[4..6], &[0, 1]);
        assert_eq!(encoded[6], StreamKind::Checksum as u8);
        assert_eq!(encoded[7], HashAlgorithm::Blake3.id());
        assert_eq!(&encoded[8..12], &4096u32.to_be_bytes());
        assert_eq!(encoded[12], 0);
        assert_eq!(&encoded[13..21], &0u64.to_be_bytes());
        assert_eq!(&encoded[21..29], &12_345u64.to_be_bytes());
        assert_eq!(&encoded[29..37], &0u64.to_be_bytes());

        let decoded = StreamHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.block_count(), Some(4));
        assert_eq!(decoded.block_len(3), Some(12_345 - 3 * 4096));
    }

    #[test]
    fn test_header_span() {
        let header = StreamHeader::checksum(HashAlgorithm::Xxh3, 1024, 0).with_span(
            10_000,
            Some(13_000),
            Some(13_000),
        );
        let encoded = header.encode();
        assert_eq!(encoded[12], FLAG_LIMIT);

        let decoded = StreamHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.span_len(), Some(3000));
        assert_eq!(decoded.block_count(), Some(3));
        assert_eq!(decoded.block_len(2), Some(3000 - 2048));
        assert_eq!(decoded.offset_of(0), Some(10_000));
        assert_eq!(decoded.offset_of(2), Some(12_048));
        assert_eq!(decoded.offset_of(u64::MAX), None);
    }

    #[test]
    fn test_header_with_end_trailer() {
        let header =
            StreamHeader::checksum(HashAlgorithm::Blake3, 512, 0).with_span(512, None, None);
        let encoded = header.encode();
        assert_eq!(encoded[12], FLAG_END_TRAILER);

        let decoded = StreamHeader::decode(&encoded).unwrap();
        assert_eq!(decoded.end_offset, None);
        assert_eq!(decoded.block_count(), None);
        assert_eq!(decoded.block_len(0), None);
    }

    #[test]
    fn test_header_rejects_inconsistent_span() {
        let mut encoded = StreamHeader::checksum(HashAlgorithm::Blake3, 512, 100)
            .encode()
            .to_vec();
        encoded[12] = 0x80;
        assert!(matches!(
            StreamHeader::decode(&encoded),
            Err(BlocksyncError::Protocol(_))
        ));

        // end before start
        let encoded = StreamHeader::checksum(HashAlgorithm::Blake3, 512, 0)
            .with_span(4096, Some(1024), None)
            .encode();
        assert!(matches!(
            StreamHeader::decode(&encoded),
            Err(BlocksyncError::Protocol(_))
        ));

        // end past the limit
        let encoded = StreamHeader::checksum(HashAlgorithm::Blake3, 512, 0)
            .with_span(0, Some(8192), Some(4096))
            .encode();
        assert!(matches!(
            StreamHeader::decode(&encoded),
            Err(BlocksyncError::Protocol(_))
        ));
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut encoded = StreamHeader::diff(HashAlgorithm::Xxh3, 4096, 0).encode().to_vec();
        encoded[0] = b'X';
        assert!(matches!(
            StreamHeader::decode(&encoded),
            Err(BlocksyncError::Protocol(_))
        ));
    }

    #[test]
    fn test_header_rejects_unsupported_parameters() {
        let mut encoded = StreamHeader::diff(HashAlgorithm::Xxh3, 4096, 0).encode().to_vec();
        encoded[7] = 0x7F;
        assert!(matches!(
            StreamHeader::decode(&encoded),
            Err(BlocksyncError::ConfigMismatch(_))
        ));

        let encoded = StreamHeader::diff(HashAlgorithm::Xxh3, 16, 0).encode();
        assert!(matches!(
            StreamHeader::decode(&encoded),
            Err(BlocksyncError::ConfigMismatch(_))
        ));

        let mut encoded = StreamHeader::diff(HashAlgorithm::Xxh3, 4096, 0).encode().to_vec();
        encoded[5] = 9;
        assert!(matches!(
            StreamHeader::decode(&encoded),
            Err(BlocksyncError::ConfigMismatch(_))
        ));
    }

    #[test]
    fn test_checksum_record_layout() {
        let digest = HashAlgorithm::Sha256.digest(b"block");
        let record = ChecksumRecord { index: 5, digest };
        let encoded = record.encode();
        assert_eq!(encoded.len(), 1 + 8 + 32);
        assert_eq!(encoded[0], b'H');
        assert_eq!(&encoded[1..9], &5u64.to_be_bytes());
        assert_eq!(&encoded[9..], digest.as_bytes());
    }

    #[test]
    fn test_diff_record_layout() {
        let record = DiffRecord {
            index: 10,
            payload: Bytes::from_static(&[1, 2, 3]),
        };
        let encoded = record.encode();
        assert_eq!(encoded[0], b'D');
        assert_eq!(&encoded[1..9], &10u64.to_be_bytes());
        assert_eq!(&encoded[9..13], &3u32.to_be_bytes());
        assert_eq!(&encoded[13..], &[1, 2, 3]);
        assert_eq!(&encoded[..DiffRecord::HEADER_LEN], &record.encode_header()[..]);
    }

    #[test]
    fn test_negotiate_adopts_header() {
        let header = StreamHeader::checksum(HashAlgorithm::Xxh3, 65536, 1 << 20);
        assert_eq!(
            negotiate(&header, None, None).unwrap(),
            (65536, HashAlgorithm::Xxh3)
        );
        assert_eq!(
            negotiate(&header, Some(65536), Some(HashAlgorithm::Xxh3)).unwrap(),
            (65536, HashAlgorithm::Xxh3)
        );
    }

    #[test]
    fn test_negotiate_rejects_pinned_mismatch() {
        let header = StreamHeader::checksum(HashAlgorithm::Xxh3, 65536, 1 << 20);
        assert!(matches!(
            negotiate(&header, Some(4096), None),
            Err(BlocksyncError::ConfigMismatch(_))
        ));
        assert!(matches!(
            negotiate(&header, None, Some(HashAlgorithm::Blake3)),
            Err(BlocksyncError::ConfigMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_read_checksum_stream() {
        let header = StreamHeader::checksum(HashAlgorithm::Blake3, 512, 1000);
        let r0 = ChecksumRecord {
            index: 0,
            digest: HashAlgorithm::Blake3.digest(b"a"),
        };
        let r1 = ChecksumRecord {
            index: 1,
            digest: HashAlgorithm::Blake3.digest(b"b"),
        };
        let end = SpanEnd { offset: 1000 };
        let mut wire = Vec::new();
        wire.extend_from_slice(&header.encode());
        wire.extend_from_slice(&r0.encode());
        wire.extend_from_slice(&r1.encode());
        wire.extend_from_slice(&end.encode());

        let mut reader = &wire[..];
        let got = read_header(&mut reader, StreamKind::Checksum).await.unwrap();
        assert_eq!(got, header);
        let algo = got.algorithm;
        assert_eq!(
            read_checksum_frame(&mut reader, algo).await.unwrap(),
            Some(ChecksumFrame::Hash(r0))
        );
        assert_eq!(
            read_checksum_frame(&mut reader, algo).await.unwrap(),
            Some(ChecksumFrame::Hash(r1))
        );
        assert_eq!(
            read_checksum_frame(&mut reader, algo).await.unwrap(),
            Some(ChecksumFrame::End(end))
        );
        assert_eq!(read_checksum_frame(&mut reader, algo).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_diff_header_must_announce_end() {
        let wire = StreamHeader::diff(HashAlgorithm::Blake3, 512, 0)
            .with_span(0, None, None)
            .encode();
        let mut reader = &wire[..];
        assert!(matches!(
            read_header(&mut reader, StreamKind::Diff).await,
            Err(BlocksyncError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_end_frame_rejected_in_diff_stream() {
        let wire = SpanEnd { offset: 4096 }.encode();
        let mut reader = &wire[..];
        assert!(matches!(
            read_diff_frame(&mut reader, 1024).await,
            Err(BlocksyncError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_read_header_wrong_kind() {
        let wire = StreamHeader::diff(HashAlgorithm::Blake3, 512, 0).encode();
        let mut reader = &wire[..];
        assert!(matches!(
            read_header(&mut reader, StreamKind::Checksum).await,
            Err(BlocksyncError::ConfigMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_read_header_empty_input() {
        let mut reader: &[u8] = &[];
        assert!(matches!(
            read_header(&mut reader, StreamKind::Diff).await,
            Err(BlocksyncError::UnexpectedEof(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_unexpected_eof() {
        let record = DiffRecord {
            index: 2,
            payload: Bytes::from(vec![7u8; 600]),
        };
        let encoded = record.encode();
        let mut reader = &encoded[..encoded.len() - 100];
        assert!(matches!(
            read_diff_frame(&mut reader, 1024).await,
            Err(BlocksyncError::UnexpectedEof(_))
        ));
    }

    #[tokio::test]
    async fn test_read_diff_frames() {
        let data = DiffRecord {
            index: 3,
            payload: Bytes::from(vec![9u8; 100]),
        };
        let trunc = Truncate { length: 1700 };
        let mut wire = Vec::new();
        wire.extend_from_slice(&data.encode());
        wire.extend_from_slice(&trunc.encode());

        let mut reader = &wire[..];
        assert_eq!(
            read_diff_frame(&mut reader, 512).await.unwrap(),
            Some(DiffFrame::Data(data))
        );
        assert_eq!(
            read_diff_frame(&mut reader, 512).await.unwrap(),
            Some(DiffFrame::Truncate(trunc))
        );
        assert_eq!(read_diff_frame(&mut reader, 512).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let record = DiffRecord {
            index: 0,
            payload: Bytes::from(vec![0u8; 2048]),
        };
        let encoded = record.encode();
        let mut reader = &encoded[..];
        assert!(matches!(
            read_diff_frame(&mut reader, 1024).await,
            Err(BlocksyncError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_tag_rejected() {
        let wire = [b'Z', 0, 0];
        let mut reader = &wire[..];
        assert!(matches!(
            read_diff_frame(&mut reader, 1024).await,
            Err(BlocksyncError::Protocol(_))
        ));
        let mut reader = &wire[..];
        assert!(matches!(
            read_checksum_frame(&mut reader, HashAlgorithm::Blake3).await,
            Err(BlocksyncError::Protocol(_))
        ));
    }
}
