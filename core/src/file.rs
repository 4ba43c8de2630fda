use crate::hash_tree::{self, Digest, HashTree, HashTreeError, MerkleProof};
use crate::message::FileInfo;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024; // 512KB

/// A chunk failed verification against the published content root.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("chunk {chunknum} of {filename} does not match root {root}")]
pub struct IntegrityError {
    pub filename: String,
    pub chunknum: u32,
    pub root: Digest,
}

/// A local file split into fixed-size chunks, ready to publish.
#[derive(Debug, Clone)]
pub struct ChunkedFile {
    pub name: String,
    pub info: FileInfo,
    pub chunks: Vec<Vec<u8>>,
}

impl ChunkedFile {
    pub fn hash_tree(&self) -> Result<HashTree, HashTreeError> {
        HashTree::build(&self.chunks)
    }
}

pub fn chunk_count(size: u64, chunk_size: usize) -> u32 {
    size.div_ceil(chunk_size as u64) as u32
}

/// Split a file into chunks for publishing
pub fn split_file_to_chunks(path: &Path, chunk_size: usize) -> io::Result<ChunkedFile> {
    if chunk_size == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "chunk size must be positive",
        ));
    }

    let mut file = File::open(path)?;
    let file_size = file.metadata()?.len();
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();

    let total_chunknum = chunk_count(file_size, chunk_size);
    let mut chunks = Vec::with_capacity(total_chunknum as usize);

    for _ in 0..total_chunknum {
        let mut buffer = Vec::with_capacity(chunk_size);
        (&mut file)
            .take(chunk_size as u64)
            .read_to_end(&mut buffer)?;
        chunks.push(buffer);
    }

    Ok(ChunkedFile {
        name,
        info: FileInfo {
            size: file_size,
            total_chunknum,
        },
        chunks,
    })
}

/// Verify a downloaded chunk before it is kept or registered.
///
/// The proof must have been issued for `chunknum` of a file of `total_chunknum` chunks.
pub fn verify_chunk(
    filename: &str,
    chunknum: u32,
    total_chunknum: u32,
    data: &[u8],
    proof: &MerkleProof,
    root: &Digest,
) -> Result<(), IntegrityError> {
    if proof.leaf_index == chunknum as usize
        && hash_tree::verify(data, proof, total_chunknum as usize, root)
    {
        Ok(())
    } else {
        Err(IntegrityError {
            filename: filename.to_string(),
            chunknum,
            root: *root,
        })
    }
}

/// Assemble downloaded chunks into a complete file
pub fn assemble_chunks(
    chunks: &BTreeMap<u32, Vec<u8>>,
    info: &FileInfo,
    output: &Path,
) -> io::Result<()> {
    if chunks.len() != info.total_chunknum as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "Expected {} chunks, got {}",
                info.total_chunknum,
                chunks.len()
            ),
        ));
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(output)?;

    for (i, (chunknum, data)) in chunks.iter().enumerate() {
        if *chunknum != i as u32 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Missing chunk {}", i),
            ));
        }
        file.write_all(data)?;
    }

    file.flush()?;
    Ok(())
}
