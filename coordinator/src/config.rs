use chunklink_core::protocol::MAX_FRAME_LEN;
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8888";
pub const DEFAULT_IO_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub listen_addr: SocketAddr,
    /// How long a session waits for the rest of a frame once its header has arrived
    /// (or for a reply to drain) before the connection is treated as stalled and closed.
    /// Idle time between frames is not bounded.
    pub io_timeout: Duration,
    pub max_frame_len: usize,
    pub log_level: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8888)),
            io_timeout: Duration::from_secs(DEFAULT_IO_TIMEOUT_SECS),
            max_frame_len: MAX_FRAME_LEN,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "chunklink-coordinator")]
#[command(about = "Rendezvous coordinator for a chunked file-distribution swarm", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Address to accept node connections on
    #[arg(long, env = "CHUNKLINK_LISTEN", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen: SocketAddr,

    /// Seconds to wait for the body of a started frame before closing a stalled connection
    #[arg(long, env = "CHUNKLINK_IO_TIMEOUT_SECS", default_value_t = DEFAULT_IO_TIMEOUT_SECS)]
    pub io_timeout_secs: u64,

    /// Largest accepted frame body in bytes
    #[arg(long, env = "CHUNKLINK_MAX_FRAME_LEN", default_value_t = MAX_FRAME_LEN)]
    pub max_frame_len: usize,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "CHUNKLINK_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Hex-encoded 32-byte network key shared with every node
    #[arg(long, env = "CHUNKLINK_NETWORK_KEY", hide_env_values = true)]
    pub network_key: Option<String>,
}

impl Cli {
    pub fn config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            listen_addr: self.listen,
            io_timeout: Duration::from_secs(self.io_timeout_secs),
            max_frame_len: self.max_frame_len,
            log_level: self.log_level.clone(),
        }
    }
}
