//! Print the content root a node would compute for a local file.

use chunklink_core::file::split_file_to_chunks;
use chunklink_core::DEFAULT_CHUNK_SIZE;
use clap::Parser;
use std::error::Error;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "merkle-root")]
#[command(about = "Compute the hash-tree root of a file", long_about = None)]
struct Args {
    /// File to hash
    path: PathBuf,

    /// Chunk size in bytes
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let file = split_file_to_chunks(&args.path, args.chunk_size)?;
    let tree = file.hash_tree()?;

    println!("Merkle Root: {}", tree.root());
    println!(
        "{} bytes, {} chunks of {} bytes",
        file.info.size, file.info.total_chunknum, args.chunk_size
    );
    Ok(())
}
