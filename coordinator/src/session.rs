use crate::registry::{ConnectionId, RegistryError, SharedRegistry, Teardown};
use chunklink_core::{
    ChunkLinkCodec, ChunkOwnership, Message, MessageSigner, ProtocolError, SignedEnvelope,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Registered,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub codec: ChunkLinkCodec,
    pub io_timeout: Duration,
}

/// One node connection: receives, verifies and dispatches its requests in order,
/// and always releases the node's registry entries when it ends.
pub struct PeerSession<S> {
    id: ConnectionId,
    remote: String,
    stream: S,
    state: SessionState,
    registry: SharedRegistry,
    signer: Arc<dyn MessageSigner>,
    settings: SessionSettings,
    shutdown: watch::Receiver<bool>,
}

impl<S> PeerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        remote: impl Into<String>,
        stream: S,
        registry: SharedRegistry,
        signer: Arc<dyn MessageSigner>,
        settings: SessionSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            remote: remote.into(),
            stream,
            state: SessionState::Connected,
            registry,
            signer,
            settings,
            shutdown,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Serve the connection until it ends, then tear down its registry state.
    pub async fn run(mut self) -> Teardown {
        self.registry.write().await.admit(self.id);
        info!("🔌 New connection {} from {}", self.id, self.remote);

        match self.serve().await {
            Ok(()) => info!("👋 {} closed the connection", self.label()),
            Err(e) => warn!("❌ {} disconnected: {}", self.label(), e),
        }

        let teardown = self.registry.write().await.release(self.id);
        self.state = SessionState::Closed;
        for filename in &teardown.orphaned {
            info!("🗑️ Removed {} (no remaining owners)", filename);
        }

        if let Err(e) = self.stream.shutdown().await {
            debug!("Shutdown of {} failed: {}", self.id, e);
        }

        teardown
    }

    async fn serve(&mut self) -> Result<(), ProtocolError> {
        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }

            // A node may stay quiet between requests for as long as it likes; only a
            // frame that has started must finish within the timeout.
            let len = tokio::select! {
                _ = self.shutdown.changed() => return Ok(()),
                len = self.settings.codec.read_frame_len(&mut self.stream) => match len {
                    Ok(len) => len,
                    Err(e) if e.is_clean_eof() => return Ok(()),
                    Err(e) => return Err(e),
                },
            };

            let body = tokio::select! {
                _ = self.shutdown.changed() => return Ok(()),
                body = timeout(
                    self.settings.io_timeout,
                    self.settings
                        .codec
                        .read_frame_body::<_, SignedEnvelope>(&mut self.stream, len),
                ) => body,
            };
            let envelope = match body {
                Ok(envelope) => envelope?,
                Err(_) => return Err(ProtocolError::Stalled(self.settings.io_timeout)),
            };
            let message = envelope.verify(self.signer.as_ref())?;
            debug!("Message received {} from {}", message.kind(), self.id);

            if let Some(reply) = self.dispatch(message).await {
                self.send(&reply).await?;
            }
        }
    }

    async fn send(&mut self, reply: &Message) -> Result<(), ProtocolError> {
        let sent = timeout(
            self.settings.io_timeout,
            self.settings
                .codec
                .send_signed(&mut self.stream, reply, self.signer.as_ref()),
        )
        .await;
        match sent {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Stalled(self.settings.io_timeout)),
        }
    }

    async fn dispatch(&mut self, message: Message) -> Option<Message> {
        match message {
            Message::RequestRegister { address } => {
                let outcome = self.registry.write().await.register(self.id, address.clone());
                match outcome {
                    Ok(()) => {
                        self.state = SessionState::Registered;
                        info!("📝 {} registered as {}", self.id, address);
                        Some(Message::ReplyRegister {
                            result: true,
                            reason: None,
                        })
                    }
                    Err(reason) => {
                        warn!("Register of {} as {} refused: {}", self.id, address, reason);
                        Some(Message::ReplyRegister {
                            result: false,
                            reason: Some(reason),
                        })
                    }
                }
            }
            Message::RequestPublish { filename, fileinfo } => {
                let outcome = self
                    .registry
                    .write()
                    .await
                    .publish(self.id, &filename, fileinfo);
                match outcome {
                    Ok(()) => {
                        info!(
                            "📁 {} published {} ({} bytes, {} chunks)",
                            self.label(),
                            filename,
                            fileinfo.size,
                            fileinfo.total_chunknum
                        );
                        Some(Message::ReplyPublish {
                            filename,
                            result: true,
                            reason: None,
                        })
                    }
                    Err(reason) => {
                        info!("Publish of {} by {} refused: {}", filename, self.label(), reason);
                        Some(Message::ReplyPublish {
                            filename,
                            result: false,
                            reason: Some(reason),
                        })
                    }
                }
            }
            Message::RequestFileList => {
                let file_list = self.registry.read().await.file_list();
                Some(Message::ReplyFileList { file_list })
            }
            Message::RequestFileLocation { filename } => {
                let location = self.registry.read().await.locate(&filename);
                match location {
                    Some(location) => Some(Message::ReplyFileLocation {
                        filename,
                        fileinfo: Some(location.fileinfo),
                        chunkinfo: location.chunkinfo,
                    }),
                    None => {
                        warn!("{} asked for unknown file {}", self.label(), filename);
                        Some(Message::ReplyFileLocation {
                            filename,
                            fileinfo: None,
                            chunkinfo: ChunkOwnership::new(),
                        })
                    }
                }
            }
            Message::RequestChunkRegister { filename, chunknum } => {
                let outcome = self
                    .registry
                    .write()
                    .await
                    .register_chunk(self.id, &filename, chunknum);
                match outcome {
                    Ok(true) => debug!("{} holds chunk {} of {}", self.label(), chunknum, filename),
                    Ok(false) => debug!("Duplicate chunk {} of {} from {}", chunknum, filename, self.label()),
                    Err(e @ RegistryError::UnknownFile(_)) => {
                        warn!("request_chunk_register with non-existing file: {}", e)
                    }
                    Err(e) => warn!("request_chunk_register from {} ignored: {}", self.label(), e),
                }
                None
            }
            Message::Unknown => {
                error!("Undefined message from {}", self.label());
                None
            }
            other => {
                warn!("Unexpected {} from {}", other.kind(), self.label());
                None
            }
        }
    }

    fn label(&self) -> String {
        match self.state {
            SessionState::Connected => format!("{} ({})", self.id, self.remote),
            _ => format!("{} ({}, registered)", self.id, self.remote),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use chunklink_core::{FileInfo, Identity, NodeAddress};
    use tokio::io::{duplex, DuplexStream};

    struct Harness {
        node: DuplexStream,
        codec: ChunkLinkCodec,
        identity: Arc<Identity>,
        registry: SharedRegistry,
        shutdown: watch::Sender<bool>,
        task: tokio::task::JoinHandle<Teardown>,
    }

    fn spawn_session() -> Harness {
        let (node, coordinator_side) = duplex(64 * 1024);
        let identity = Arc::new(Identity::generate());
        let registry = Registry::shared();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let settings = SessionSettings {
            codec: ChunkLinkCodec::default(),
            io_timeout: Duration::from_secs(5),
        };
        let session = PeerSession::new(
            "test",
            coordinator_side,
            registry.clone(),
            identity.clone(),
            settings,
            shutdown_rx,
        );
        assert_eq!(session.state(), SessionState::Connected);
        let task = tokio::spawn(session.run());

        Harness {
            node,
            codec: ChunkLinkCodec::default(),
            identity,
            registry,
            shutdown,
            task,
        }
    }

    impl Harness {
        async fn request(&mut self, message: Message) -> Message {
            self.codec
                .send_signed(&mut self.node, &message, self.identity.as_ref())
                .await
                .unwrap();
            self.codec
                .receive_verified(&mut self.node, self.identity.as_ref())
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_publish_then_close_runs_teardown() {
        let mut h = spawn_session();

        let reply = h
            .request(Message::RequestRegister {
                address: NodeAddress::new("a"),
            })
            .await;
        assert_eq!(
            reply,
            Message::ReplyRegister {
                result: true,
                reason: None
            }
        );

        let reply = h
            .request(Message::RequestPublish {
                filename: "f".to_string(),
                fileinfo: FileInfo {
                    size: 10,
                    total_chunknum: 1,
                },
            })
            .await;
        assert!(matches!(reply, Message::ReplyPublish { result: true, .. }));

        drop(h.node);
        let teardown = h.task.await.unwrap();
        assert_eq!(teardown.address, Some(NodeAddress::new("a")));
        assert_eq!(teardown.orphaned, vec!["f".to_string()]);
        assert!(h.registry.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_signal_runs_teardown() {
        let mut h = spawn_session();
        h.request(Message::RequestRegister {
            address: NodeAddress::new("a"),
        })
        .await;

        h.shutdown.send_replace(true);
        let teardown = h.task.await.unwrap();
        assert_eq!(teardown.address, Some(NodeAddress::new("a")));
        assert_eq!(h.registry.read().await.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_reply_to_node_is_ignored() {
        let mut h = spawn_session();
        h.codec
            .send_signed(
                &mut h.node,
                &Message::ReplyFileList {
                    file_list: Default::default(),
                },
                h.identity.as_ref(),
            )
            .await
            .unwrap();

        // The session is still serving.
        let reply = h.request(Message::RequestFileList).await;
        assert!(matches!(reply, Message::ReplyFileList { .. }));
    }
}
