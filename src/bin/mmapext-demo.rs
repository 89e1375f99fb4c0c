//! Exercises a `MappingManager` against a real backing file.
//!
//! Use `RUST_LOG=debug` to see every mapping step.
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{error, info};

use mmapext::CreateOptions;
use mmapext::ErrorKind;
use mmapext::MapNextOptions;
use mmapext::MappingManager;

/// Maps a backing file chunk by chunk.
#[derive(Parser)]
#[command(name = "mmapext-demo")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the backing file (created if missing)
    #[arg(short, long, global = true, default_value = "mmapext-demo.bin")]
    file: PathBuf,

    /// Chunk size in bytes; must be a multiple of the page size
    #[arg(long, global = true, default_value_t = mmapext::DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Map chunks without growth, then sleep so /proc/<pid>/maps can be inspected
    Hold {
        #[arg(long, default_value = "4")]
        chunks: usize,

        #[arg(long, default_value = "30")]
        seconds: u64,
    },

    /// Map and fill chunks in increments, growing the reservation as needed
    Fill {
        #[arg(long)]
        target_chunks: usize,

        #[arg(long, default_value = "1")]
        increment: usize,

        /// Chunks added to the reservation whenever it is exhausted
        #[arg(long, default_value = "16")]
        grow_chunks: usize,
    },

    /// Map the whole reservation, then check that one more increment is refused
    Exhaust {
        #[arg(long, default_value = "1")]
        chunks_per_increment: usize,
    },
}

fn hold(manager: &mut MappingManager, chunks: usize, seconds: u64) -> mmapext::Result<()> {
    manager.map_next_chunk(MapNextOptions {
        dont_grow_if_fully_mapped: true,
        extra_chunks_to_reserve_on_grow: 0,
        chunks_to_map_next: chunks,
    })?;

    info!(
        "pid {}: {} bytes mapped at {:?}, sleeping {}s",
        std::process::id(),
        manager.mapped_size(),
        manager.base_address(),
        seconds
    );
    std::thread::sleep(Duration::from_secs(seconds));
    Ok(())
}

fn fill(
    manager: &mut MappingManager,
    target_chunks: usize,
    increment: usize,
    grow_chunks: usize,
) -> mmapext::Result<()> {
    let chunk_size = manager.chunk_size();

    while manager.num_chunks_mapped() < target_chunks {
        let start = manager.num_chunks_mapped() * chunk_size;
        let next = increment.min(target_chunks - manager.num_chunks_mapped());
        let outcome = manager.map_next_chunk(MapNextOptions {
            dont_grow_if_fully_mapped: false,
            extra_chunks_to_reserve_on_grow: grow_chunks.max(next),
            chunks_to_map_next: next,
        })?;

        if outcome.mapping_was_moved {
            info!(
                "mapping moved to {:?}, {} chunks reserved",
                manager.base_address(),
                manager.num_chunks_reserved()
            );
        }

        for byte in manager.mapped_mut()[start..].iter_mut() {
            *byte = 0xAA;
        }
    }

    info!(
        "filled {} chunks ({} bytes) with 0xAA",
        manager.num_chunks_mapped(),
        manager.mapped_size()
    );
    Ok(())
}

fn exhaust(manager: &mut MappingManager, chunks_per_increment: usize) -> mmapext::Result<()> {
    let no_growth = MapNextOptions {
        dont_grow_if_fully_mapped: true,
        extra_chunks_to_reserve_on_grow: 0,
        chunks_to_map_next: chunks_per_increment,
    };

    while manager.num_chunks_mapped() + chunks_per_increment <= manager.num_chunks_reserved() {
        manager.map_next_chunk(no_growth)?;
    }

    match manager.map_next_chunk(no_growth) {
        Err(e) if e.kind() == ErrorKind::FullyMapped => {
            info!(
                "refused as expected after {} of {} chunks: {}",
                manager.num_chunks_mapped(),
                manager.num_chunks_reserved(),
                e
            );
            Ok(())
        }
        Err(e) => Err(e),
        Ok(_) => Err(mmapext::Error::new(
            ErrorKind::Unknown,
            "mapping past the reservation succeeded without growth",
        )),
    }
}

fn run(cli: Cli) -> mmapext::Result<()> {
    let (initial_chunks, reserve_existing) = match cli.command {
        Commands::Hold { chunks, .. } => (chunks, true),
        Commands::Fill { increment: 0, .. }
        | Commands::Exhaust {
            chunks_per_increment: 0,
        } => {
            return Err(mmapext::Error::new(
                ErrorKind::InvalidArgument,
                "increments must be at least one chunk",
            ))
        }
        _ => (16, false),
    };

    let options = CreateOptions::new(&cli.file)
        .with_chunk_size(cli.chunk_size)
        .with_initial_reserved_size(initial_chunks as u64 * cli.chunk_size as u64)
        .with_reserve_existing_file_size(reserve_existing);
    let mut manager = MappingManager::create(options)?;

    let ret = match cli.command {
        Commands::Hold { chunks, seconds } => hold(&mut manager, chunks, seconds),
        Commands::Fill {
            target_chunks,
            increment,
            grow_chunks,
        } => fill(&mut manager, target_chunks, increment, grow_chunks),
        Commands::Exhaust {
            chunks_per_increment,
        } => exhaust(&mut manager, chunks_per_increment),
    };

    // Report the first failure.
    let deleted = manager.delete();
    ret.and(deleted)
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    if let Err(e) = run(Cli::parse()) {
        error!("{}", e);
        std::process::exit(1);
    }
}
