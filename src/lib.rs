//! blocksync: one-way block device sync over pipes.
//!
//! The destination is hashed in fixed-size blocks, the source is hashed the
//! same way and compared against that checksum stream, and only the blocks
//! that differ travel back to be written in place. See [`streaming`] for the
//! pipeline and wire format.

pub mod cli;
pub mod device;
pub mod error;
pub mod hash;
pub mod logging;
pub mod progress;
pub mod streaming;

pub use error::{BlocksyncError, Result};
pub use hash::{Digest, HashAlgorithm};
