//! Block device access.
//!
//! A device is anything with a fixed byte length that can be read
//! sequentially or written at an offset: a disk, an LV snapshot, or a
//! regular file standing in for one. Producers read it through
//! [`DeviceReader`], the applier writes it through [`DeviceWriter`]. Each
//! handle is owned by exactly one thread.

use crate::error::{BlocksyncError, Result};
use bytes::{Bytes, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Raw bytes of one block, tagged with its position.
#[derive(Debug, Clone)]
pub struct Block {
    pub index: u64,
    pub data: Bytes,
}

/// Number of blocks covering `length` bytes.
pub fn block_count(length: u64, block_size: u32) -> u64 {
    length.div_ceil(block_size as u64)
}

/// Length of block `index` on a device of `length` bytes. Zero past the end.
pub fn block_len(length: u64, block_size: u32, index: u64) -> usize {
    let start = index.saturating_mul(block_size as u64);
    if start >= length {
        return 0;
    }
    (length - start).min(block_size as u64) as usize
}

/// Part of a device to work on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte
    pub start: u64,
    /// One past the last byte; `None` runs to the end of the device
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>) -> Result<Self> {
        if let Some(end) = end {
            if end <= start {
                return Err(BlocksyncError::InvalidArgument(format!(
                    "end offset {} must lie after start offset {}",
                    end, start
                )));
            }
        }
        Ok(Self { start, end })
    }
}

/// Determine the length of an open device. Block devices report a zero
/// metadata length, so seek to the end instead.
fn device_length(file: &mut File) -> io::Result<u64> {
    let len = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(0))?;
    Ok(len)
}

/// Fill `buf` unless the input runs dry first. Returns the bytes read.
fn read_full<R: Read + ?Sized>(input: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Sequential block reader over a byte range of a device, or of a pipe when
/// the destination is fed through stdin.
///
/// Block indices count from the start of the range. A seekable device has its
/// end fixed at open time and is never read past it; a pipe is read until EOF
/// or the range limit, whichever comes first.
pub struct DeviceReader {
    path: PathBuf,
    input: Box<dyn Read + Send>,
    block_size: u32,
    start: u64,
    limit: Option<u64>,
    /// End of the span, `None` for a pipe
    end: Option<u64>,
    /// Bytes of the span consumed so far
    position: u64,
    next_index: u64,
    done: bool,
}

impl DeviceReader {
    /// Open the whole device.
    pub fn open(path: &Path, block_size: u32) -> Result<Self> {
        Self::open_range(path, block_size, ByteRange::default())
    }

    pub fn open_range(path: &Path, block_size: u32, range: ByteRange) -> Result<Self> {
        let mut file = File::open(path).map_err(|source| BlocksyncError::DeviceOpen {
            path: path.to_path_buf(),
            source,
        })?;
        let length = device_length(&mut file)
            .map_err(|e| BlocksyncError::device_io(path, 0, e))?;
        if range.start > length {
            return Err(BlocksyncError::InvalidArgument(format!(
                "start offset {} is past the end of {} ({} bytes)",
                range.start,
                path.display(),
                length
            )));
        }
        file.seek(SeekFrom::Start(range.start))
            .map_err(|e| BlocksyncError::device_io(path, range.start, e))?;
        let end = range.end.map_or(length, |end| end.min(length));

        tracing::debug!(
            "Opened {} for reading: {} bytes, span {}..{}, {} blocks of {}",
            path.display(),
            length,
            range.start,
            end,
            block_count(end - range.start, block_size),
            block_size
        );

        Ok(Self {
            path: path.to_path_buf(),
            input: Box::new(file),
            block_size,
            start: range.start,
            limit: range.end,
            end: Some(end),
            position: 0,
            next_index: 0,
            done: false,
        })
    }

    /// Read from a pipe of unknown length. The bytes before `range.start`
    /// are consumed and discarded here.
    pub fn from_stream<R>(
        name: &Path,
        mut input: R,
        block_size: u32,
        range: ByteRange,
    ) -> Result<Self>
    where
        R: Read + Send + 'static,
    {
        let skipped = io::copy(&mut (&mut input).take(range.start), &mut io::sink())
            .map_err(|e| BlocksyncError::device_io(name, 0, e))?;
        if skipped < range.start {
            return Err(BlocksyncError::InvalidArgument(format!(
                "start offset {} is past the end of {} ({} bytes)",
                range.start,
                name.display(),
                skipped
            )));
        }
        tracing::debug!(
            "Reading {} as a stream from offset {}, block size {}",
            name.display(),
            range.start,
            block_size
        );

        Ok(Self {
            path: name.to_path_buf(),
            input: Box::new(input),
            block_size,
            start: range.start,
            limit: range.end,
            end: None,
            position: 0,
            next_index: 0,
            done: false,
        })
    }

    /// The process's stdin, named `-`.
    pub fn stdin(block_size: u32, range: ByteRange) -> Result<Self> {
        Self::from_stream(Path::new("-"), io::stdin(), block_size, range)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Device offset of block 0
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Device offset where the span stops, if known before reading
    pub fn end_offset(&self) -> Option<u64> {
        self.end
    }

    pub fn span_len(&self) -> Option<u64> {
        self.end.map(|end| end - self.start)
    }

    pub fn block_count(&self) -> Option<u64> {
        self.span_len().map(|len| block_count(len, self.block_size))
    }

    fn read_block(&mut self) -> Option<Result<Block>> {
        let offset = self.start + self.position;
        let want = match self.end.or(self.limit) {
            Some(end) => end.saturating_sub(offset).min(self.block_size as u64),
            None => self.block_size as u64,
        };
        if want == 0 {
            return None;
        }

        let mut buf = BytesMut::zeroed(want as usize);
        let got = match read_full(&mut self.input, &mut buf) {
            Ok(n) => n,
            Err(e) => return Some(Err(BlocksyncError::device_io(&self.path, offset, e))),
        };
        if (got as u64) < want {
            if self.end.is_some() {
                return Some(Err(BlocksyncError::device_io(
                    &self.path,
                    offset + got as u64,
                    io::Error::new(io::ErrorKind::UnexpectedEof, "device shrank while reading"),
                )));
            }
            // Pipe hit EOF: this is the last block, if any
            self.done = true;
            if got == 0 {
                return None;
            }
            buf.truncate(got);
        }

        let index = self.next_index;
        self.next_index += 1;
        self.position += got as u64;
        Some(Ok(Block {
            index,
            data: buf.freeze(),
        }))
    }
}

impl Iterator for DeviceReader {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let block = self.read_block();
        match &block {
            None | Some(Err(_)) => self.done = true,
            Some(Ok(_)) => {}
        }
        block
    }
}

/// Positioned block writer for the destination device.
pub struct DeviceWriter {
    path: PathBuf,
    file: File,
    is_regular: bool,
}

impl DeviceWriter {
    /// Open an existing device for in-place updates. The device is never
    /// created or truncated on open.
    pub fn open(path: &Path) -> Result<Self> {
        let open_err = |source| BlocksyncError::DeviceOpen {
            path: path.to_path_buf(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(open_err)?;
        let is_regular = file.metadata().map_err(open_err)?.is_file();

        Ok(Self {
            path: path.to_path_buf(),
            file,
            is_regular,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `data` at `offset` with a single write call. A short write means
    /// the device is failing underneath us and is reported, not retried.
    pub fn write_block(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| BlocksyncError::device_io(&self.path, offset, e))?;
        let written = loop {
            match self.file.write(data) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(BlocksyncError::device_io(&self.path, offset, e)),
            }
        };
        if written != data.len() {
            return Err(BlocksyncError::ShortWrite {
                path: self.path.clone(),
                offset,
                written,
                expected: data.len(),
            });
        }
        Ok(())
    }

    /// Shrink the device to `length`. Only regular files can change length;
    /// returns `false` when the device is fixed-size and was left alone.
    pub fn truncate(&mut self, length: u64) -> Result<bool> {
        if !self.is_regular {
            return Ok(false);
        }
        self.file
            .set_len(length)
            .map_err(|e| BlocksyncError::device_io(&self.path, length, e))?;
        Ok(true)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| BlocksyncError::device_io(&self.path, 0, e))
    }
}
