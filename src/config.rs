use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::expiry::FixedTtl;

pub const DEFAULT_PORT: u16 = 4567;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    // reported as `X-Lamport-Node` and in health responses
    pub node_id: String,
    // `None` runs without persistence
    pub snapshot_dir: Option<PathBuf>,
    pub snapshot_base_name: String,
    pub snapshot_history: Option<usize>,
    pub ttl_ms: u64,
    pub read_wait_ms: u64,
    pub io_timeout_ms: u64,
    // status of a write whose payload fails validation, 400 or 500
    pub validation_status: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            node_id: "aggregation-server".into(),
            snapshot_dir: Some("snapshots".into()),
            snapshot_base_name: "weather".into(),
            snapshot_history: Some(32),
            ttl_ms: 30_000,
            read_wait_ms: 2_000,
            io_timeout_ms: 10_000,
            validation_status: 500,
        }
    }
}

impl ServerConfig {
    /// `[port] [config.json]`, the port overrides whatever the file listens on.
    pub fn from_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        let port = args.next();
        let mut config = match args.next() {
            Some(path) => {
                let json = std::fs::read_to_string(&path).with_context(|| format!("read {path}"))?;
                serde_json::from_str::<Self>(&json).with_context(|| format!("parse {path}"))?
            }
            None => Self::default(),
        };
        if let Some(port) = port {
            config
                .listen
                .set_port(port.parse().with_context(|| format!("invalid port {port:?}"))?)
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            matches!(self.validation_status, 400 | 500),
            "validation status must be 400 or 500, got {}",
            self.validation_status
        );
        anyhow::ensure!(!self.node_id.is_empty(), "empty node id");
        Ok(())
    }

    pub fn ttl(&self) -> FixedTtl {
        FixedTtl::new(Duration::from_millis(self.ttl_ms))
    }

    pub fn read_wait(&self) -> Duration {
        Duration::from_millis(self.read_wait_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}
