use async_trait::async_trait;
use chunklink_coordinator::{
    download, ChunkSource, Coordinator, CoordinatorConfig, DownloadedFile, FetchError,
    FetchedChunk, TrackerClient,
};
use chunklink_core::{Digest, FileInfo, HashTree, Identity, NodeAddress};
use clap::Parser;
use rand::RngCore;
use std::collections::HashMap;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "chunklink-simulator")]
#[command(about = "Runs a coordinator and a swarm of virtual nodes in one process")]
struct Args {
    /// Number of downloading nodes
    #[arg(short, long, default_value_t = 5)]
    nodes: usize,

    /// Size of the published file in bytes
    #[arg(long, default_value_t = 3 * 1024 * 1024)]
    file_size: usize,

    #[arg(long, default_value_t = 256 * 1024)]
    chunk_size: usize,
}

/// Chunks each virtual node holds, keyed by file and chunk number.
#[derive(Default)]
struct VirtualSwarm {
    holdings: RwLock<HashMap<NodeAddress, HashMap<(String, u32), FetchedChunk>>>,
}

impl VirtualSwarm {
    async fn hold(&self, node: &NodeAddress, filename: &str, chunknum: u32, chunk: FetchedChunk) {
        self.holdings
            .write()
            .await
            .entry(node.clone())
            .or_default()
            .insert((filename.to_string(), chunknum), chunk);
    }

    async fn forget(&self, node: &NodeAddress) {
        self.holdings.write().await.remove(node);
    }
}

#[async_trait]
impl ChunkSource for VirtualSwarm {
    async fn fetch(
        &self,
        provider: &NodeAddress,
        filename: &str,
        chunknum: u32,
    ) -> Result<FetchedChunk, FetchError> {
        self.holdings
            .read()
            .await
            .get(provider)
            .and_then(|held| held.get(&(filename.to_string(), chunknum)))
            .cloned()
            .ok_or_else(|| FetchError::Missing(provider.clone()))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    info!("ChunkLink Swarm Simulator");

    let identity = Arc::new(Identity::generate());
    let mut coordinator = Coordinator::new(CoordinatorConfig::default(), identity.clone());
    let addr = coordinator.start("127.0.0.1:0".parse()?).await?;
    let swarm = Arc::new(VirtualSwarm::default());

    // Publisher
    let mut data = vec![0u8; args.file_size];
    rand::thread_rng().fill_bytes(&mut data);
    let blocks: Vec<Vec<u8>> = data
        .chunks(args.chunk_size.max(1))
        .map(|c| c.to_vec())
        .collect();
    let tree = HashTree::build(&blocks)?;
    let root = tree.root();
    let filename = "swarm.bin";
    let fileinfo = FileInfo {
        size: data.len() as u64,
        total_chunknum: blocks.len() as u32,
    };

    let seeder = NodeAddress::new("node-0");
    let mut publisher = connect_node(addr, &identity, &seeder).await?;
    publisher.publish(filename, fileinfo).await?;
    for (index, block) in blocks.iter().enumerate() {
        let chunk = FetchedChunk {
            data: block.clone(),
            proof: tree.proof(index)?,
        };
        swarm.hold(&seeder, filename, index as u32, chunk).await;
    }
    info!("[{}] Published {} with root {}", seeder, filename, root);

    info!("Spawning {} virtual nodes...", args.nodes);
    let mut handles = JoinSet::new();
    for i in 1..=args.nodes {
        let swarm = swarm.clone();
        let identity = identity.clone();
        handles.spawn(async move {
            // Staggered start so later nodes find earlier ones as providers.
            sleep(Duration::from_millis(50 * i as u64)).await;
            simulate_node(i, addr, identity, swarm, filename, root).await
        });
    }

    let mut online = Vec::new();
    while let Some(finished) = handles.join_next().await {
        match finished {
            Ok(Ok(client)) => online.push(client),
            Ok(Err(e)) => error!("Node failed: {}", e),
            Err(e) => error!("Node task panicked: {}", e),
        }
    }
    info!("{}/{} nodes completed the download", online.len(), args.nodes);

    // The seeder leaves; the file must stay available from its downloaders.
    publisher.disconnect().await;
    swarm.forget(&seeder).await;
    sleep(Duration::from_millis(100)).await;

    match coordinator.chunkinfo().await.get(filename) {
        Some(ownership) => info!("{} still has {} owners", filename, ownership.len()),
        None => warn!("{} was dropped with its seeder", filename),
    }

    match simulate_node(args.nodes + 1, addr, identity.clone(), swarm.clone(), filename, root).await
    {
        Ok(mut late) => {
            info!("Late node fetched {} entirely from peers", filename);
            late.disconnect().await;
        }
        Err(e) => warn!("Late node could not download {}: {}", filename, e),
    }

    for mut client in online {
        client.disconnect().await;
    }
    coordinator.stop().await;
    info!("Simulation finished");
    Ok(())
}

async fn connect_node(
    addr: SocketAddr,
    identity: &Arc<Identity>,
    address: &NodeAddress,
) -> Result<TrackerClient, Box<dyn Error + Send + Sync>> {
    let mut client = TrackerClient::connect(addr, identity.clone()).await?;
    client.register(address.clone()).await?;
    Ok(client)
}

async fn simulate_node(
    id: usize,
    addr: SocketAddr,
    identity: Arc<Identity>,
    swarm: Arc<VirtualSwarm>,
    filename: &'static str,
    root: Digest,
) -> Result<TrackerClient, Box<dyn Error + Send + Sync>> {
    let address = NodeAddress::new(format!("node-{}", id));
    info!("[{}] Node starting...", address);
    let mut client = connect_node(addr, &identity, &address).await?;

    let downloaded: DownloadedFile = download(&mut client, swarm.as_ref(), filename, root, |p| {
        if p.completed == p.total {
            info!("[node-{}] All {} chunks verified", id, p.total);
        }
    })
    .await?;

    for (chunknum, chunk) in downloaded.chunks {
        swarm.hold(&address, filename, chunknum, chunk).await;
    }
    info!("[{}] Now seeding {}", address, filename);
    Ok(client)
}
