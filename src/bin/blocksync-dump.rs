//! Render a checksum or diff stream as text, one line per record.
//!
//! Handy for finding which blocks keep differing between runs:
//!
//! ```bash
//! blocksync checksum /dev/md0 | blocksync-dump -
//! blocksync checksum disk.img > disk.sums && blocksync-dump disk.sums
//! ```

use anyhow::{bail, Context, Result};
use blocksync::streaming::{
    read_checksum_frame, read_diff_frame, ChecksumFrame, ChecksumRecord, DiffFrame, StreamHeader,
    StreamKind, HEADER_SIZE, STREAM_BUFFER_SIZE,
};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

/// Dump a blocksync checksum or diff stream as human-readable text
#[derive(Parser, Debug)]
#[command(name = "blocksync-dump")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Stream file, or `-` for stdin
    input: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let stdout = std::io::stdout();
    let mut out = std::io::BufWriter::new(stdout.lock());

    if cli.input == PathBuf::from("-") {
        let mut reader = BufReader::with_capacity(STREAM_BUFFER_SIZE, tokio::io::stdin());
        dump(&mut reader, &mut out).await?;
    } else {
        let file = tokio::fs::File::open(&cli.input)
            .await
            .with_context(|| format!("Failed to open {}", cli.input.display()))?;
        let mut reader = BufReader::with_capacity(STREAM_BUFFER_SIZE, file);
        dump(&mut reader, &mut out).await?;
    }

    out.flush()?;
    Ok(())
}

async fn dump<R, W>(reader: &mut R, out: &mut W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: Write,
{
    let mut raw = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut raw)
        .await
        .context("Stream ended before its header")?;
    let header = StreamHeader::decode(&raw)?;

    write!(
        out,
        "kind={:?} algorithm={} block_size={} start={} end={} blocks={}",
        header.kind,
        header.algorithm,
        header.block_size,
        header.start_offset,
        unknown_or(header.end_offset),
        unknown_or(header.block_count())
    )?;
    match header.limit {
        Some(limit) => writeln!(out, " limit={}", limit)?,
        None => writeln!(out)?,
    }

    match header.kind {
        StreamKind::Checksum => dump_checksums(reader, out, &header).await,
        StreamKind::Diff => dump_diff(reader, out, &header).await,
    }
}

fn unknown_or(value: Option<u64>) -> String {
    value.map_or_else(|| "?".to_string(), |v| v.to_string())
}

fn write_block<W>(out: &mut W, header: &StreamHeader, record: &ChecksumRecord) -> Result<()>
where
    W: Write,
{
    // A piped destination only reveals its last block's length at the End frame.
    let len = header
        .block_len(record.index)
        .unwrap_or(header.block_size as usize);
    writeln!(
        out,
        "block={:010} offset={:014} len={} hash={}",
        record.index,
        header.offset_of(record.index).unwrap_or(u64::MAX),
        len,
        record.digest.to_hex()
    )?;
    Ok(())
}

async fn dump_checksums<R, W>(reader: &mut R, out: &mut W, header: &StreamHeader) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: Write,
{
    let mut header = *header;
    let announced = header.end_offset.is_some();
    let mut pending: Option<ChecksumRecord> = None;
    let mut expected = 0u64;
    let mut ended = false;

    while let Some(frame) = read_checksum_frame(reader, header.algorithm).await? {
        if ended {
            bail!("frame after end of span");
        }
        match frame {
            ChecksumFrame::Hash(record) => {
                if record.index != expected {
                    bail!("expected block {}, got block {}", expected, record.index);
                }
                expected += 1;
                if let Some(prev) = pending.replace(record) {
                    write_block(out, &header, &prev)?;
                }
            }
            ChecksumFrame::End(end) => {
                if announced {
                    bail!("end frame in a stream whose header announced its end");
                }
                if end.offset < header.start_offset {
                    bail!("span ends at {} before it starts", end.offset);
                }
                header.end_offset = Some(end.offset);
                if let Some(last) = pending.take() {
                    write_block(out, &header, &last)?;
                }
                writeln!(out, "end offset={}", end.offset)?;
                ended = true;
            }
        }
    }
    if let Some(last) = pending {
        write_block(out, &header, &last)?;
    }

    let Some(blocks) = header.block_count() else {
        bail!("stream ended without an end frame after {} blocks", expected);
    };
    if expected != blocks {
        bail!("stream ended after {} of {} blocks", expected, blocks);
    }
    writeln!(out, "done records={}", expected)?;
    Ok(())
}

async fn dump_diff<R, W>(reader: &mut R, out: &mut W, header: &StreamHeader) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: Write,
{
    let mut last: Option<u64> = None;
    let mut records = 0u64;
    let mut bytes = 0u64;
    let mut truncated = false;

    while let Some(frame) = read_diff_frame(reader, header.block_size).await? {
        if truncated {
            bail!("frame after truncate");
        }
        match frame {
            DiffFrame::Data(record) => {
                writeln!(
                    out,
                    "block={:010} offset={:014} len={}",
                    record.index,
                    header.offset_of(record.index).unwrap_or(u64::MAX),
                    record.payload.len()
                )?;
                if let Some(prev) = last {
                    if record.index <= prev {
                        bail!("block {} follows block {}", record.index, prev);
                    }
                }
                last = Some(record.index);
                records += 1;
                bytes += record.payload.len() as u64;
            }
            DiffFrame::Truncate(t) => {
                writeln!(out, "truncate length={}", t.length)?;
                truncated = true;
            }
        }
    }

    writeln!(out, "done records={} bytes={}", records, bytes)?;
    Ok(())
}
