pub mod file;
pub mod hash_tree;
pub mod identity;
pub mod message;
pub mod protocol;

pub use file::{ChunkedFile, IntegrityError, DEFAULT_CHUNK_SIZE};
pub use hash_tree::{Digest, HashTree, HashTreeError, MerkleProof};
pub use identity::{Identity, KeyId, MessageSigner};
pub use message::{
    ChunkOwnership, FileCatalog, FileInfo, FileLocation, Message, NodeAddress, PublishRejection,
    RegisterRejection,
};
pub use protocol::{ChunkLinkCodec, ProtocolError, SignedEnvelope};

#[derive(Debug, thiserror::Error)]
pub enum ChunkLinkError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Hash tree error: {0}")]
    HashTree(#[from] HashTreeError),

    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ChunkLinkError>;
