use crate::config::CoordinatorConfig;
use crate::registry::{Registry, SharedRegistry};
use crate::session::{PeerSession, SessionSettings};
use chunklink_core::{ChunkLinkCodec, ChunkOwnership, FileCatalog, MessageSigner, NodeAddress};
use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause before the next accept after `failures` consecutive accept errors.
fn accept_backoff(failures: u32) -> Duration {
    ACCEPT_BACKOFF_MIN
        .saturating_mul(1u32 << failures.saturating_sub(1).min(10))
        .min(ACCEPT_BACKOFF_MAX)
}

struct RunningServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    acceptor: JoinHandle<()>,
}

/// Rendezvous point of the swarm. Tracks which node holds which chunk of which file;
/// never carries file bytes.
pub struct Coordinator {
    config: CoordinatorConfig,
    signer: Arc<dyn MessageSigner>,
    registry: SharedRegistry,
    running: Option<RunningServer>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, signer: Arc<dyn MessageSigner>) -> Self {
        Self {
            config,
            signer,
            registry: Registry::shared(),
            running: None,
        }
    }

    /// Bind `addr` and start accepting node connections. Returns the bound address.
    pub async fn start(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
        if let Some(running) = &self.running {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("coordinator already listening on {}", running.local_addr),
            ));
        }

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let settings = SessionSettings {
            codec: ChunkLinkCodec::new(self.config.max_frame_len),
            io_timeout: self.config.io_timeout,
        };

        let acceptor = tokio::spawn(accept_loop(
            listener,
            self.registry.clone(),
            self.signer.clone(),
            settings,
            shutdown_rx,
        ));
        info!("👂 Coordinator listening on {}", local_addr);

        self.running = Some(RunningServer {
            local_addr,
            shutdown,
            acceptor,
        });
        Ok(local_addr)
    }

    /// Close the listener and every live session, wait for their teardown, then reset.
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.shutdown.send_replace(true);
            if let Err(e) = running.acceptor.await {
                error!("Acceptor task failed: {}", e);
            }
            info!("🛑 Coordinator on {} stopped", running.local_addr);
        }

        let mut registry = self.registry.write().await;
        if registry.connection_count() != 0 {
            warn!(
                "Peer directory not fully cleared at stop: {} connections ({:?})",
                registry.connection_count(),
                registry.peers()
            );
        }
        registry.reset();
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub async fn file_list(&self) -> FileCatalog {
        self.registry.read().await.file_list()
    }

    pub async fn chunkinfo(&self) -> BTreeMap<String, ChunkOwnership> {
        self.registry.read().await.chunkinfo()
    }

    pub async fn peers(&self) -> Vec<NodeAddress> {
        self.registry.read().await.peers()
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.connection_count()
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: SharedRegistry,
    signer: Arc<dyn MessageSigner>,
    settings: SessionSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sessions = JoinSet::new();
    let mut accept_failures: u32 = 0;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    accept_failures = 0;
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY for {}: {}", remote, e);
                    }
                    let session = PeerSession::new(
                        remote.to_string(),
                        stream,
                        registry.clone(),
                        signer.clone(),
                        settings.clone(),
                        shutdown.clone(),
                    );
                    sessions.spawn(session.run());
                }
                Err(e) => {
                    // Errors such as EMFILE persist until sessions close; don't spin on them.
                    accept_failures = accept_failures.saturating_add(1);
                    let delay = accept_backoff(accept_failures);
                    error!("Failed to accept connection: {} (retrying in {:?})", e, delay);
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            },
            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = finished {
                    error!("Session task failed: {}", e);
                }
            }
        }
    }

    drop(listener);
    while let Some(finished) = sessions.join_next().await {
        if let Err(e) = finished {
            error!("Session task failed: {}", e);
        }
    }
}
