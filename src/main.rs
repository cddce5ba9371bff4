//! blocksync binary entry point.
//!
//! ```bash
//! # Remote destination, local source
//! ssh backup blocksync checksum /dev/vg/vm1 \
//!   | blocksync retrieve /dev/vg/vm1-snap \
//!   | ssh backup blocksync save /dev/vg/vm1
//!
//! # Both sides local
//! blocksync sync disk.img disk-copy.img
//! ```

use blocksync::cli::{Cli, Command};
use blocksync::error::{exit_code, BlocksyncError, Result};
use blocksync::logging::init_logging;
use blocksync::streaming::{
    Applier, ChecksumConfig, ChecksumProducer, Differ, HasherConfig, LocalSync, RetrieveConfig,
    SaveConfig, STREAM_BUFFER_SIZE,
};
use clap::Parser;
use std::io::IsTerminal;
use std::path::Path;
use std::process::ExitCode;
use tokio::io::{BufReader, BufWriter};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.verbose, cli.quiet) {
        eprintln!("ERROR: {}", e);
        return ExitCode::from(e.exit_code());
    }

    spawn_signal_handler();

    let name = cli.command.name();
    match run(cli.command).await {
        Ok(()) => ExitCode::from(exit_code::SUCCESS),
        Err(e) => {
            tracing::debug!("{} failed: {:?}", name, e);
            eprintln!("ERROR ({}): {}", name, e);
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(command: Command) -> Result<()> {
    if command.writes_stream() && std::io::stdout().is_terminal() {
        return Err(BlocksyncError::InvalidArgument(
            "refusing to write a binary stream to a terminal; pipe stdout somewhere".to_string(),
        ));
    }

    match command {
        Command::Checksum {
            path,
            block_size,
            algorithm,
            range,
            run,
        } => {
            let config = ChecksumConfig {
                path,
                block_size,
                range: range.range()?,
                hasher: HasherConfig::new(algorithm, run.workers()),
                progress: run.progress,
            };
            if config.reads_stdin() && std::io::stdin().is_terminal() {
                return Err(BlocksyncError::InvalidArgument(
                    "refusing to read device contents from a terminal".to_string(),
                ));
            }
            let mut stdout = BufWriter::with_capacity(STREAM_BUFFER_SIZE, tokio::io::stdout());
            ChecksumProducer::new(config).run(&mut stdout).await?;
        }
        Command::Retrieve {
            path,
            block_size,
            algorithm,
            run,
        } => {
            reject_stdio_path(&path)?;
            let config = RetrieveConfig {
                path,
                block_size,
                algorithm,
                workers: run.workers(),
                progress: run.progress,
            };
            let mut stdin = BufReader::with_capacity(STREAM_BUFFER_SIZE, tokio::io::stdin());
            let mut stdout = BufWriter::with_capacity(STREAM_BUFFER_SIZE, tokio::io::stdout());
            Differ::new(config).run(&mut stdin, &mut stdout).await?;
        }
        Command::Save { path, progress } => {
            reject_stdio_path(&path)?;
            let mut stdin = BufReader::with_capacity(STREAM_BUFFER_SIZE, tokio::io::stdin());
            Applier::new(SaveConfig { path, progress })
                .run(&mut stdin)
                .await?;
        }
        Command::Sync {
            source,
            destination,
            block_size,
            algorithm,
            range,
            run,
        } => {
            reject_stdio_path(&source)?;
            reject_stdio_path(&destination)?;
            let sync = LocalSync {
                source,
                destination,
                block_size,
                algorithm,
                range: range.range()?,
                workers: run.workers(),
                progress: run.progress,
            };
            sync.run().await?;
        }
    }
    Ok(())
}

/// stdin and stdout already carry the streams, so `-` cannot be a device.
fn reject_stdio_path(path: &Path) -> Result<()> {
    if path == Path::new("-") {
        return Err(BlocksyncError::InvalidArgument(
            "'-' is not a device path; stdin and stdout carry the streams".to_string(),
        ));
    }
    Ok(())
}

/// Exit immediately on SIGINT/SIGTERM. Writes are whole blocks at distinct
/// offsets, so stopping mid-run leaves the destination partially updated
/// but never torn.
fn spawn_signal_handler() {
    tokio::spawn(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("Cannot install SIGTERM handler: {}", e);
                    if tokio::signal::ctrl_c().await.is_ok() {
                        std::process::exit(exit_code::INTERRUPTED as i32);
                    }
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::debug!("Interrupted");
                    std::process::exit(exit_code::INTERRUPTED as i32);
                }
                _ = term.recv() => {
                    tracing::debug!("Terminated");
                    std::process::exit(exit_code::TERMINATED as i32);
                }
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(exit_code::INTERRUPTED as i32);
            }
        }
    });
}
