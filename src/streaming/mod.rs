//! Streaming block sync.
//!
//! Three single-pass stages connected by byte streams:
//!
//! ```text
//!  [dest host]              [src host]               [dest host]
//! +------------------+    +------------------+    +------------------+
//! | ChecksumProducer | -> |      Differ      | -> |     Applier      |
//! | (hash dst blocks)|    | (hash src, diff) |    | (write changes)  |
//! +------------------+    +------------------+    +------------------+
//!     checksum stream          diff stream
//! ```
//!
//! Both producers hash through an [`OrderedHasher`]: one reader thread, a
//! pool of hash workers and a reorder thread, so digests come out in block
//! order however the workers finish.
//!
//! The wire format lives in [`protocol`]. Streams end at EOF and there is no
//! back channel, so a stage only learns that its peer died when its own read
//! or write fails. The one trailer is the `End` frame of a checksum stream
//! whose destination was read from a pipe.

pub mod applier;
pub mod channel;
pub mod checksum;
pub mod differ;
pub mod hasher;
pub mod pipeline;
pub mod protocol;

pub use channel::{
    default_workers, ChecksumConfig, HashedBlock, HasherConfig, RetrieveConfig, SaveConfig,
    SyncStats, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, STREAM_BUFFER_SIZE,
};

pub use applier::Applier;
pub use checksum::ChecksumProducer;
pub use differ::Differ;
pub use hasher::OrderedHasher;
pub use pipeline::{LocalSync, PipelineStats};

pub use protocol::{
    negotiate, read_checksum_frame, read_diff_frame, read_header, ChecksumFrame, ChecksumRecord,
    DiffFrame, DiffRecord, SpanEnd, StreamHeader, StreamKind, Truncate, HEADER_SIZE,
    PROTOCOL_VERSION,
};
