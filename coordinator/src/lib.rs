pub mod client;
pub mod config;
pub mod coordinator;
pub mod download;
pub mod registry;
pub mod session;

pub use client::{ClientError, PublishedFile, TrackerClient};
pub use config::{Cli, CoordinatorConfig};
pub use coordinator::Coordinator;
pub use download::{download, ChunkSource, DownloadProgress, DownloadedFile, FetchError, FetchedChunk};
pub use registry::{ConnectionId, Registry, RegistryError, Teardown};
pub use session::{PeerSession, SessionSettings, SessionState};
