//! Command-line interface definitions.

use crate::device::ByteRange;
use crate::hash::HashAlgorithm;
use crate::streaming::channel::{
    default_workers, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE,
};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

/// Fast one-way block device sync over pipes.
///
/// Typical use, with the destination on a remote host:
///
///   ssh dst-host blocksync checksum /dev/vg/disk \
///     | blocksync retrieve /dev/vg/disk-snap \
///     | ssh dst-host blocksync save /dev/vg/disk
#[derive(Parser, Debug)]
#[command(name = "blocksync")]
#[command(version, about, long_about, verbatim_doc_comment)]
pub struct Cli {
    /// Increase verbosity (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short = 'q', long = "quiet", global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Hash the destination device and write the checksum stream to stdout
    Checksum {
        /// Destination device or image file, or `-` to read it from stdin
        path: PathBuf,

        /// Block size in bytes; accepts K and M suffixes
        #[arg(
            short = 'b',
            long = "block-size",
            value_parser = parse_block_size,
            default_value_t = DEFAULT_BLOCK_SIZE
        )]
        block_size: u32,

        /// Hash algorithm (blake3, xxh3, sha256)
        #[arg(short = 'a', long = "algorithm", default_value_t = HashAlgorithm::default())]
        algorithm: HashAlgorithm,

        #[command(flatten)]
        range: RangeArgs,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Read a checksum stream on stdin, write the changed source blocks to stdout
    Retrieve {
        /// Source device or image file
        path: PathBuf,

        /// Require this block size instead of adopting the checksum stream's
        #[arg(short = 'b', long = "block-size", value_parser = parse_block_size)]
        block_size: Option<u32>,

        /// Require this algorithm instead of adopting the checksum stream's
        #[arg(short = 'a', long = "algorithm")]
        algorithm: Option<HashAlgorithm>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Read a diff stream on stdin and apply it to the destination in place
    Save {
        /// Destination device or image file (must exist)
        path: PathBuf,

        /// Show a progress bar on stderr
        #[arg(short = 'p', long = "progress")]
        progress: bool,
    },

    /// Run all three stages locally: make DESTINATION match SOURCE
    Sync {
        /// Source device or image file
        source: PathBuf,

        /// Destination device or image file (must exist)
        destination: PathBuf,

        /// Block size in bytes; accepts K and M suffixes
        #[arg(
            short = 'b',
            long = "block-size",
            value_parser = parse_block_size,
            default_value_t = DEFAULT_BLOCK_SIZE
        )]
        block_size: u32,

        /// Hash algorithm (blake3, xxh3, sha256)
        #[arg(short = 'a', long = "algorithm", default_value_t = HashAlgorithm::default())]
        algorithm: HashAlgorithm,

        #[command(flatten)]
        range: RangeArgs,

        #[command(flatten)]
        run: RunArgs,
    },
}

/// Byte range of the device to sync
#[derive(Args, Debug, Clone, Copy, Default)]
pub struct RangeArgs {
    /// First byte to sync; accepts K, M, G and T suffixes
    #[arg(long = "start", value_parser = parse_size, default_value_t = 0)]
    pub start: u64,

    /// Stop before this byte instead of at the end of the device. The
    /// destination is then never truncated.
    #[arg(long = "end", value_parser = parse_size)]
    pub end: Option<u64>,
}

impl RangeArgs {
    pub fn range(&self) -> crate::Result<ByteRange> {
        ByteRange::new(self.start, self.end)
    }
}

/// Options shared by the hashing stages
#[derive(Args, Debug, Clone, Copy)]
pub struct RunArgs {
    /// Hash worker threads (default: CPU count, at most 8)
    #[arg(short = 'w', long = "workers", value_parser = clap::value_parser!(u16).range(1..=256))]
    pub workers: Option<u16>,

    /// Show a progress bar on stderr
    #[arg(short = 'p', long = "progress")]
    pub progress: bool,
}

impl RunArgs {
    pub fn workers(&self) -> usize {
        self.workers
            .map(usize::from)
            .unwrap_or_else(default_workers)
    }
}

impl Command {
    /// Subcommand name as typed on the command line
    pub fn name(&self) -> &'static str {
        match self {
            Command::Checksum { .. } => "checksum",
            Command::Retrieve { .. } => "retrieve",
            Command::Save { .. } => "save",
            Command::Sync { .. } => "sync",
        }
    }

    /// Whether the command writes a binary stream to stdout
    pub fn writes_stream(&self) -> bool {
        matches!(self, Command::Checksum { .. } | Command::Retrieve { .. })
    }
}

/// Parse a byte count such as `4096`, `128K`, `1M` or `2G` (binary units).
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, multiplier) = match s.char_indices().last() {
        Some((i, 'k' | 'K')) => (&s[..i], 1u64 << 10),
        Some((i, 'm' | 'M')) => (&s[..i], 1 << 20),
        Some((i, 'g' | 'G')) => (&s[..i], 1 << 30),
        Some((i, 't' | 'T')) => (&s[..i], 1 << 40),
        Some(_) => (s, 1),
        None => return Err("size is empty".to_string()),
    };
    let value = digits
        .parse::<u64>()
        .map_err(|_| format!("invalid size '{}'", s))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{}' is too large", s))
}

/// Parse a block size such as `4096`, `128K` or `1M`.
pub fn parse_block_size(s: &str) -> Result<u32, String> {
    let bytes = parse_size(s)?;
    if bytes < MIN_BLOCK_SIZE as u64 || bytes > MAX_BLOCK_SIZE as u64 {
        return Err(format!(
            "block size {} outside supported range {}..={}",
            bytes, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
        ));
    }
    Ok(bytes as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_block_size_suffixes() {
        assert_eq!(parse_block_size("4096"), Ok(4096));
        assert_eq!(parse_block_size("128K"), Ok(128 * 1024));
        assert_eq!(parse_block_size("128k"), Ok(128 * 1024));
        assert_eq!(parse_block_size("1M"), Ok(1024 * 1024));
        assert_eq!(parse_block_size("64M"), Ok(64 * 1024 * 1024));
    }

    #[test]
    fn parse_block_size_rejects_garbage() {
        assert!(parse_block_size("").is_err());
        assert!(parse_block_size("K").is_err());
        assert!(parse_block_size("12G").is_err());
        assert!(parse_block_size("-4096").is_err());
        assert!(parse_block_size("256").is_err());
        assert!(parse_block_size("128M").is_err());
    }

    #[test]
    fn checksum_defaults() {
        let cli = Cli::try_parse_from(["blocksync", "checksum", "/dev/sdb"]).unwrap();
        assert_eq!(cli.verbose, 0);
        assert!(!cli.quiet);
        match cli.command {
            Command::Checksum {
                path,
                block_size,
                algorithm,
                range,
                run,
            } => {
                assert_eq!(path, PathBuf::from("/dev/sdb"));
                assert_eq!(block_size, DEFAULT_BLOCK_SIZE);
                assert_eq!(algorithm, HashAlgorithm::Blake3);
                assert_eq!(range.range().unwrap(), ByteRange::default());
                assert!(run.workers.is_none());
                assert!(!run.progress);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn retrieve_pins_are_optional() {
        let cli = Cli::try_parse_from(["blocksync", "retrieve", "src.img"]).unwrap();
        match cli.command {
            Command::Retrieve {
                block_size,
                algorithm,
                ..
            } => {
                assert!(block_size.is_none());
                assert!(algorithm.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }

        let cli = Cli::try_parse_from([
            "blocksync", "retrieve", "-b", "1M", "-a", "xxh3", "-w", "2", "src.img",
        ])
        .unwrap();
        match cli.command {
            Command::Retrieve {
                block_size,
                algorithm,
                run,
                ..
            } => {
                assert_eq!(block_size, Some(1024 * 1024));
                assert_eq!(algorithm, Some(HashAlgorithm::Xxh3));
                assert_eq!(run.workers(), 2);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn parse_verbosity_global() {
        let cli = Cli::try_parse_from(["blocksync", "save", "-vvv", "dst.img"]).unwrap();
        assert_eq!(cli.verbose, 3);
        assert_eq!(cli.command.name(), "save");
        assert!(!cli.command.writes_stream());
    }

    #[test]
    fn quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["blocksync", "-q", "-v", "save", "dst.img"]).is_err());
    }

    #[test]
    fn rejects_unknown_algorithm_and_zero_workers() {
        assert!(Cli::try_parse_from(["blocksync", "checksum", "-a", "md5", "d"]).is_err());
        assert!(Cli::try_parse_from(["blocksync", "checksum", "-w", "0", "d"]).is_err());
    }

    #[test]
    fn parse_size_units() {
        assert_eq!(parse_size("0"), Ok(0));
        assert_eq!(parse_size("10000"), Ok(10_000));
        assert_eq!(parse_size("4K"), Ok(4096));
        assert_eq!(parse_size("2G"), Ok(2 << 30));
        assert_eq!(parse_size("1t"), Ok(1 << 40));
        assert!(parse_size("").is_err());
        assert!(parse_size("1.5G").is_err());
        assert!(parse_size("99999999999T").is_err());
    }

    #[test]
    fn checksum_range_and_stdin() {
        let cli = Cli::try_parse_from([
            "blocksync", "checksum", "--start", "1M", "--end", "3M", "-",
        ])
        .unwrap();
        match cli.command {
            Command::Checksum { path, range, .. } => {
                assert_eq!(path, PathBuf::from("-"));
                assert_eq!(
                    range.range().unwrap(),
                    ByteRange {
                        start: 1 << 20,
                        end: Some(3 << 20),
                    }
                );
            }
            other => panic!("unexpected command {:?}", other),
        }

        let cli = Cli::try_parse_from([
            "blocksync", "sync", "--start", "8K", "--end", "4K", "a", "b",
        ])
        .unwrap();
        match cli.command {
            Command::Sync { range, .. } => assert!(range.range().is_err()),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
