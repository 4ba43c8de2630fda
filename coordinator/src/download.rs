//! Swarm download driven by coordinator location hints.
//!
//! Chunk bytes travel node to node through a [`ChunkSource`]; this module only decides
//! whom to ask, checks every chunk against the expected content root and tells the
//! coordinator about each chunk it now holds.

use crate::client::{ClientError, TrackerClient};
use async_trait::async_trait;
use chunklink_core::file::{assemble_chunks, verify_chunk};
use chunklink_core::{Digest, FileInfo, FileLocation, MerkleProof, NodeAddress};
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use tracing::{debug, info, warn};

/// Chunk bytes plus the proof tying them to the content root.
#[derive(Debug, Clone)]
pub struct FetchedChunk {
    pub data: Vec<u8>,
    pub proof: MerkleProof,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("provider {0} no longer holds the chunk")]
    Missing(NodeAddress),

    #[error("provider {provider} unreachable: {reason}")]
    Unreachable {
        provider: NodeAddress,
        reason: String,
    },
}

/// Transport for chunk payloads between nodes.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn fetch(
        &self,
        provider: &NodeAddress,
        filename: &str,
        chunknum: u32,
    ) -> Result<FetchedChunk, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub chunknum: u32,
    pub completed: u32,
    pub total: u32,
}

#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub filename: String,
    pub fileinfo: FileInfo,
    pub chunks: BTreeMap<u32, FetchedChunk>,
}

impl DownloadedFile {
    pub fn write_to(&self, output: &Path) -> io::Result<()> {
        let data: BTreeMap<u32, Vec<u8>> = self
            .chunks
            .iter()
            .map(|(chunknum, chunk)| (*chunknum, chunk.data.clone()))
            .collect();
        assemble_chunks(&data, &self.fileinfo, output)
    }
}

/// Download every chunk of `filename`, verifying each against `expected_root`.
///
/// Providers come from the coordinator's location reply. A provider that fails or
/// serves a chunk that does not verify is skipped; when every hinted provider has
/// failed, the location is fetched once more before giving up on that chunk.
pub async fn download<C, F>(
    client: &mut TrackerClient,
    source: &C,
    filename: &str,
    expected_root: Digest,
    mut on_progress: F,
) -> Result<DownloadedFile, ClientError>
where
    C: ChunkSource + ?Sized,
    F: FnMut(DownloadProgress),
{
    let mut location = client.locate_file(filename).await?;
    let fileinfo = location.fileinfo;
    let total = fileinfo.total_chunknum;
    let mut chunks = BTreeMap::new();

    info!("📥 Downloading {} ({} chunks)", filename, total);

    for chunknum in 0..total {
        let mut fetched = None;
        for attempt in 0..2 {
            if attempt > 0 {
                debug!("Refreshing location of {} for chunk {}", filename, chunknum);
                location = client.locate_file(filename).await?;
            }
            let providers = candidate_providers(&location, chunknum, client.address());
            fetched =
                fetch_verified(source, &providers, filename, chunknum, total, expected_root).await?;
            if fetched.is_some() {
                break;
            }
        }

        let chunk = fetched.ok_or_else(|| ClientError::NoProvider {
            filename: filename.to_string(),
            chunknum,
        })?;
        client.register_chunk(filename, chunknum).await?;
        chunks.insert(chunknum, chunk);

        on_progress(DownloadProgress {
            chunknum,
            completed: chunks.len() as u32,
            total,
        });
    }

    info!("✅ Download of {} complete", filename);
    Ok(DownloadedFile {
        filename: filename.to_string(),
        fileinfo,
        chunks,
    })
}

/// Holders of `chunknum` other than ourselves, rotated so consecutive chunks start
/// with different providers.
fn candidate_providers(
    location: &FileLocation,
    chunknum: u32,
    own: Option<&NodeAddress>,
) -> Vec<NodeAddress> {
    let mut providers: Vec<NodeAddress> = location
        .providers(chunknum)
        .into_iter()
        .filter(|p| Some(p) != own)
        .collect();
    if !providers.is_empty() {
        let shift = chunknum as usize % providers.len();
        providers.rotate_left(shift);
    }
    providers
}

async fn fetch_verified<C>(
    source: &C,
    providers: &[NodeAddress],
    filename: &str,
    chunknum: u32,
    total_chunknum: u32,
    expected_root: Digest,
) -> Result<Option<FetchedChunk>, ClientError>
where
    C: ChunkSource + ?Sized,
{
    for provider in providers {
        let chunk = match source.fetch(provider, filename, chunknum).await {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("Fetch of chunk {} of {} failed: {}", chunknum, filename, e);
                continue;
            }
        };

        let name = filename.to_string();
        let (chunk, verified) = tokio::task::spawn_blocking(move || {
            let verified = verify_chunk(
                &name,
                chunknum,
                total_chunknum,
                &chunk.data,
                &chunk.proof,
                &expected_root,
            );
            (chunk, verified)
        })
        .await?;

        match verified {
            Ok(()) => return Ok(Some(chunk)),
            Err(e) => warn!("Discarding chunk from {}: {}", provider, e),
        }
    }
    Ok(None)
}
