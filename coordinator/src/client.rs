//! Node side of the control protocol.
//!
//! A [`TrackerClient`] holds one signed control connection to the coordinator and
//! issues requests strictly one at a time, so replies pair with requests by order.

use chunklink_core::file::split_file_to_chunks;
use chunklink_core::{
    ChunkLinkCodec, ChunkedFile, FileCatalog, FileInfo, FileLocation, HashTree, HashTreeError,
    Message, MessageSigner, NodeAddress, ProtocolError, PublishRejection, RegisterRejection,
};
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected to the coordinator")]
    NotConnected,

    #[error("cannot reach coordinator: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("registration refused: {0}")]
    RegisterRejected(RegisterRejection),

    #[error("file already published: {0}")]
    FileExists(String),

    #[error("publish of {filename} refused: {reason}")]
    PublishRejected {
        filename: String,
        reason: PublishRejection,
    },

    #[error("file not catalogued: {0}")]
    UnknownFile(String),

    #[error("unexpected {received} in answer to {request}")]
    UnexpectedReply {
        request: &'static str,
        received: &'static str,
    },

    #[error("no provider could serve chunk {chunknum} of {filename}")]
    NoProvider { filename: String, chunknum: u32 },

    #[error("Hash tree error: {0}")]
    HashTree(#[from] HashTreeError),

    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// A file this node published: its chunks and the tree used to prove them.
#[derive(Debug, Clone)]
pub struct PublishedFile {
    pub file: ChunkedFile,
    pub tree: HashTree,
}

pub struct TrackerClient {
    stream: Option<TcpStream>,
    codec: ChunkLinkCodec,
    signer: Arc<dyn MessageSigner>,
    address: Option<NodeAddress>,
}

impl TrackerClient {
    pub async fn connect(
        addr: SocketAddr,
        signer: Arc<dyn MessageSigner>,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        info!("🔗 Connected to coordinator at {}", addr);

        Ok(Self {
            stream: Some(stream),
            codec: ChunkLinkCodec::default(),
            signer,
            address: None,
        })
    }

    /// Whether the client still holds a link to the coordinator.
    ///
    /// A close from the coordinator side is only noticed by the next request, so this
    /// can report `true` for a link that is already gone.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Address this node registered with, if any.
    pub fn address(&self) -> Option<&NodeAddress> {
        self.address.as_ref()
    }

    pub async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Shutdown of coordinator link failed: {}", e);
            }
            info!("Disconnected from coordinator");
        }
    }

    pub async fn register(&mut self, address: NodeAddress) -> Result<(), ClientError> {
        let request = Message::RequestRegister {
            address: address.clone(),
        };
        match self.request(&request).await? {
            Message::ReplyRegister { result: true, .. } => {
                self.address = Some(address);
                Ok(())
            }
            Message::ReplyRegister {
                reason: Some(reason),
                ..
            } => Err(ClientError::RegisterRejected(reason)),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub async fn publish(&mut self, filename: &str, fileinfo: FileInfo) -> Result<(), ClientError> {
        let request = Message::RequestPublish {
            filename: filename.to_string(),
            fileinfo,
        };
        match self.request(&request).await? {
            Message::ReplyPublish { result: true, .. } => {
                info!("📤 Published {} ({} chunks)", filename, fileinfo.total_chunknum);
                Ok(())
            }
            Message::ReplyPublish {
                reason: Some(PublishRejection::AlreadyExists),
                ..
            } => Err(ClientError::FileExists(filename.to_string())),
            Message::ReplyPublish {
                reason: Some(reason),
                ..
            } => Err(ClientError::PublishRejected {
                filename: filename.to_string(),
                reason,
            }),
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Split a local file into chunks, compute its content root and publish it.
    ///
    /// Reading and hashing run on a blocking worker.
    pub async fn publish_path(
        &mut self,
        path: &Path,
        chunk_size: usize,
    ) -> Result<PublishedFile, ClientError> {
        let path = path.to_path_buf();
        let published = tokio::task::spawn_blocking(move || -> Result<PublishedFile, ClientError> {
            let file = split_file_to_chunks(&path, chunk_size)?;
            let tree = file.hash_tree()?;
            Ok(PublishedFile { file, tree })
        })
        .await??;

        self.publish(&published.file.name, published.file.info).await?;
        info!(
            "🌳 Content root of {}: {}",
            published.file.name,
            published.tree.root()
        );
        Ok(published)
    }

    pub async fn list_files(&mut self) -> Result<FileCatalog, ClientError> {
        let request = Message::RequestFileList;
        match self.request(&request).await? {
            Message::ReplyFileList { file_list } => Ok(file_list),
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Ownership is a hint: it can change before the caller uses it.
    pub async fn locate_file(&mut self, filename: &str) -> Result<FileLocation, ClientError> {
        let request = Message::RequestFileLocation {
            filename: filename.to_string(),
        };
        match self.request(&request).await? {
            Message::ReplyFileLocation {
                fileinfo: Some(fileinfo),
                chunkinfo,
                ..
            } => Ok(FileLocation {
                fileinfo,
                chunkinfo,
            }),
            Message::ReplyFileLocation { fileinfo: None, .. } => {
                Err(ClientError::UnknownFile(filename.to_string()))
            }
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Announce a verified chunk. The coordinator does not answer.
    pub async fn register_chunk(&mut self, filename: &str, chunknum: u32) -> Result<(), ClientError> {
        let request = Message::RequestChunkRegister {
            filename: filename.to_string(),
            chunknum,
        };
        self.send(&request).await
    }

    async fn send(&mut self, message: &Message) -> Result<(), ClientError> {
        let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
        let sent = self
            .codec
            .send_signed(stream, message, self.signer.as_ref())
            .await;
        if let Err(e) = sent {
            warn!("Lost coordinator link while sending {}: {}", message.kind(), e);
            self.stream = None;
            return Err(e.into());
        }
        Ok(())
    }

    async fn request(&mut self, message: &Message) -> Result<Message, ClientError> {
        self.send(message).await?;
        let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
        match self.codec.receive_verified(stream, self.signer.as_ref()).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                warn!("Lost coordinator link waiting for reply to {}: {}", message.kind(), e);
                self.stream = None;
                Err(e.into())
            }
        }
    }
}

fn unexpected(request: &Message, received: &Message) -> ClientError {
    ClientError::UnexpectedReply {
        request: request.kind(),
        received: received.kind(),
    }
}
