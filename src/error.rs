//! Error types for blocksync.
//!
//! Every failure a stage can hit falls into one of a few classes, and each
//! class maps to its own process exit code so a shell pipeline can tell a
//! negotiation problem from a dying disk.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BlocksyncError>;

/// Exit codes, one per failure class.
pub mod exit_code {
    pub const SUCCESS: u8 = 0;
    pub const FAILURE: u8 = 1;
    pub const USAGE: u8 = 2;
    pub const DEVICE_OPEN: u8 = 3;
    pub const MISMATCH: u8 = 4;
    pub const IO: u8 = 5;
    pub const PROTOCOL: u8 = 6;
    pub const BROKEN_PIPE: u8 = 7;
    pub const INVALID_ARGUMENT: u8 = 8;
    pub const INTERRUPTED: u8 = 130;
    pub const TERMINATED: u8 = 143;
}

#[derive(Error, Debug)]
pub enum BlocksyncError {
    #[error("Failed to open device {path}: {source}")]
    DeviceOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error on {path} at offset {offset}: {source}")]
    DeviceIo {
        path: PathBuf,
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("Short write on {path} at offset {offset}: wrote {written} of {expected} bytes")]
    ShortWrite {
        path: PathBuf,
        offset: u64,
        written: usize,
        expected: usize,
    },

    #[error("Configuration mismatch: {0}")]
    ConfigMismatch(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Stream ended unexpectedly: {0}")]
    UnexpectedEof(String),

    #[error("Output stream closed by downstream consumer")]
    BrokenPipe,

    #[error("Stream I/O error: {0}")]
    Stream(#[source] io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Hash worker failed: {0}")]
    Worker(String),

    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}

impl BlocksyncError {
    /// Classify an error raised by the stdin/stdout stream.
    pub fn stream(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe => BlocksyncError::BrokenPipe,
            io::ErrorKind::UnexpectedEof => BlocksyncError::UnexpectedEof(err.to_string()),
            _ => BlocksyncError::Stream(err),
        }
    }

    pub fn device_io(path: impl Into<PathBuf>, offset: u64, source: io::Error) -> Self {
        BlocksyncError::DeviceIo {
            path: path.into(),
            offset,
            source,
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        BlocksyncError::Protocol(msg.into())
    }

    pub fn mismatch(msg: impl Into<String>) -> Self {
        BlocksyncError::ConfigMismatch(msg.into())
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            BlocksyncError::DeviceOpen { .. } => exit_code::DEVICE_OPEN,
            BlocksyncError::DeviceIo { .. } | BlocksyncError::ShortWrite { .. } => exit_code::IO,
            BlocksyncError::ConfigMismatch(_) => exit_code::MISMATCH,
            BlocksyncError::Protocol(_) | BlocksyncError::UnexpectedEof(_) => exit_code::PROTOCOL,
            BlocksyncError::BrokenPipe => exit_code::BROKEN_PIPE,
            BlocksyncError::Stream(_) => exit_code::IO,
            BlocksyncError::InvalidArgument(_) => exit_code::INVALID_ARGUMENT,
            BlocksyncError::Worker(_) | BlocksyncError::Logging(_) => exit_code::FAILURE,
        }
    }
}
