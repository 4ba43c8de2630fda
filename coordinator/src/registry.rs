//! The coordinator's shared state: file catalog, chunk ownership and peer directory.
//!
//! All three live in one [`Registry`] behind a single lock, so every check-then-write
//! (publish, teardown) is one critical section and readers always see the three maps
//! agree with each other. Methods here are synchronous; callers hold the lock only for
//! the duration of one call and never across I/O.

use chunklink_core::{
    ChunkOwnership, FileCatalog, FileInfo, FileLocation, NodeAddress, PublishRejection,
    RegisterRejection,
};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub type SharedRegistry = Arc<RwLock<Registry>>;

/// Identity of one accepted transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        f.write_str(&simple[..8])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("file {0} is not catalogued")]
    UnknownFile(String),

    #[error("connection has not registered an address")]
    NotRegistered,

    #[error("chunk {chunknum} out of range for a file of {total_chunknum} chunks")]
    ChunkOutOfRange { chunknum: u32, total_chunknum: u32 },
}

/// What a connection left behind when it closed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Teardown {
    pub address: Option<NodeAddress>,
    pub orphaned: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Registry {
    // connection -> self-reported address, unset until registration
    peers: HashMap<ConnectionId, Option<NodeAddress>>,
    files: FileCatalog,
    // filename -> ownership; keys always match `files`
    chunkinfo: BTreeMap<String, ChunkOwnership>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Add a freshly accepted connection to the peer directory.
    pub fn admit(&mut self, conn: ConnectionId) {
        self.peers.entry(conn).or_insert(None);
    }

    pub fn address_of(&self, conn: ConnectionId) -> Option<&NodeAddress> {
        self.peers.get(&conn).and_then(Option::as_ref)
    }

    /// Bind `address` to `conn`. Re-registering the same address is a no-op.
    pub fn register(
        &mut self,
        conn: ConnectionId,
        address: NodeAddress,
    ) -> Result<(), RegisterRejection> {
        if let Some(existing) = self.address_of(conn) {
            return if *existing == address {
                Ok(())
            } else {
                Err(RegisterRejection::AlreadyRegistered)
            };
        }

        let in_use = self
            .peers
            .iter()
            .any(|(other, bound)| *other != conn && bound.as_ref() == Some(&address));
        if in_use {
            return Err(RegisterRejection::AddressInUse);
        }

        self.peers.insert(conn, Some(address));
        Ok(())
    }

    /// Catalogue a new file owned in full by the caller.
    pub fn publish(
        &mut self,
        conn: ConnectionId,
        filename: &str,
        fileinfo: FileInfo,
    ) -> Result<(), PublishRejection> {
        let address = self
            .address_of(conn)
            .cloned()
            .ok_or(PublishRejection::NotRegistered)?;
        if self.files.contains_key(filename) {
            return Err(PublishRejection::AlreadyExists);
        }
        if fileinfo.total_chunknum == 0 {
            return Err(PublishRejection::EmptyFile);
        }

        self.files.insert(filename.to_string(), fileinfo);
        let ownership = ChunkOwnership::from([(address, (0..fileinfo.total_chunknum).collect())]);
        self.chunkinfo.insert(filename.to_string(), ownership);
        Ok(())
    }

    /// Record that the caller holds `chunknum`. Returns false for a duplicate claim.
    pub fn register_chunk(
        &mut self,
        conn: ConnectionId,
        filename: &str,
        chunknum: u32,
    ) -> Result<bool, RegistryError> {
        let address = self
            .address_of(conn)
            .cloned()
            .ok_or(RegistryError::NotRegistered)?;
        let fileinfo = self
            .files
            .get(filename)
            .ok_or_else(|| RegistryError::UnknownFile(filename.to_string()))?;
        if chunknum >= fileinfo.total_chunknum {
            return Err(RegistryError::ChunkOutOfRange {
                chunknum,
                total_chunknum: fileinfo.total_chunknum,
            });
        }

        let ownership = self
            .chunkinfo
            .get_mut(filename)
            .ok_or_else(|| RegistryError::UnknownFile(filename.to_string()))?;
        Ok(ownership.entry(address).or_default().insert(chunknum))
    }

    pub fn file_list(&self) -> FileCatalog {
        self.files.clone()
    }

    pub fn locate(&self, filename: &str) -> Option<FileLocation> {
        let fileinfo = *self.files.get(filename)?;
        let chunkinfo = self.chunkinfo.get(filename).cloned().unwrap_or_default();
        Some(FileLocation {
            fileinfo,
            chunkinfo,
        })
    }

    pub fn chunkinfo(&self) -> BTreeMap<String, ChunkOwnership> {
        self.chunkinfo.clone()
    }

    /// Addresses of registered live connections.
    pub fn peers(&self) -> Vec<NodeAddress> {
        let mut peers: Vec<NodeAddress> = self.peers.values().flatten().cloned().collect();
        peers.sort();
        peers
    }

    pub fn connection_count(&self) -> usize {
        self.peers.len()
    }

    /// Remove a closed connection and everything it owned.
    ///
    /// Files left without any owner are removed from the catalog in the same call.
    pub fn release(&mut self, conn: ConnectionId) -> Teardown {
        let address = self.peers.remove(&conn).flatten();
        let mut orphaned = Vec::new();

        if let Some(address) = &address {
            for (filename, ownership) in self.chunkinfo.iter_mut() {
                if ownership.remove(address).is_some() && ownership.is_empty() {
                    orphaned.push(filename.clone());
                }
            }
            for filename in &orphaned {
                self.chunkinfo.remove(filename);
                self.files.remove(filename);
            }
        }

        Teardown { address, orphaned }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty() && self.files.is_empty() && self.chunkinfo.is_empty()
    }

    pub fn reset(&mut self) {
        self.peers.clear();
        self.files.clear();
        self.chunkinfo.clear();
    }
}
