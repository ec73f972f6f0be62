//! sliced.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::DriveKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub storage: Option<StorageConfig>,
    pub raft: Option<RaftConfig>,
    pub roller: Option<RollerConfig>,
    pub provisioner: Option<ProvisionerConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    pub id: String,
    pub host: String,
    pub region: Option<String>,
    pub zone: Option<String>,
    /// Bootstrap a fresh metadata group with this node as its only voter.
    pub bootstrap: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: Option<PathBuf>,
    pub drives: Option<Vec<DriveConfig>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    pub mount: String,
    pub kind: Option<DriveKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    pub heartbeat_ms: Option<u64>,
    pub election_timeout_min_ms: Option<u64>,
    pub election_timeout_max_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollerConfig {
    /// How often idle topics are checked against their age limits.
    pub tick_ms: Option<u64>,
    /// Quiet time after which a segment meeting its minima is sealed.
    pub idle_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    /// Failed attempts after which every retry is logged at error level.
    pub alert_after: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub filter: Option<String>,
    pub json: Option<bool>,
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Scaffold a minimal single-node configuration.
    pub fn scaffold(id: &str, host: &str) -> Self {
        NodeConfig {
            node: NodeSection {
                id: id.to_string(),
                host: host.to_string(),
                region: None,
                zone: None,
                bootstrap: Some(true),
            },
            storage: Some(StorageConfig {
                data_dir: Some(PathBuf::from("/var/lib/sliced")),
                drives: Some(vec![DriveConfig {
                    mount: "/var/lib/sliced/d0".to_string(),
                    kind: Some(DriveKind::Ssd),
                }]),
            }),
            raft: Some(RaftConfig {
                heartbeat_ms: Some(500),
                election_timeout_min_ms: Some(1500),
                election_timeout_max_ms: Some(3000),
            }),
            roller: Some(RollerConfig {
                tick_ms: Some(1000),
                idle_ms: Some(30_000),
            }),
            provisioner: None,
            logging: None,
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.storage
            .as_ref()
            .and_then(|s| s.data_dir.clone())
            .unwrap_or_else(|| PathBuf::from("/var/lib/sliced"))
    }

    pub fn bootstrap(&self) -> bool {
        self.node.bootstrap.unwrap_or(false)
    }

    /// Returns (heartbeat, election min, election max) in milliseconds.
    pub fn raft_timings(&self) -> (u64, u64, u64) {
        let raft = self.raft.as_ref();
        (
            raft.and_then(|r| r.heartbeat_ms).unwrap_or(500),
            raft.and_then(|r| r.election_timeout_min_ms).unwrap_or(1500),
            raft.and_then(|r| r.election_timeout_max_ms).unwrap_or(3000),
        )
    }

    pub fn roller_tick(&self) -> Duration {
        Duration::from_millis(
            self.roller
                .as_ref()
                .and_then(|r| r.tick_ms)
                .unwrap_or(1000),
        )
    }

    pub fn roller_idle_ms(&self) -> u64 {
        self.roller
            .as_ref()
            .and_then(|r| r.idle_ms)
            .unwrap_or(30_000)
    }

    /// Returns (initial backoff, max backoff, alert threshold).
    pub fn provisioner_backoff(&self) -> (Duration, Duration, u32) {
        let p = self.provisioner.as_ref();
        (
            Duration::from_millis(p.and_then(|p| p.initial_backoff_ms).unwrap_or(100)),
            Duration::from_millis(p.and_then(|p| p.max_backoff_ms).unwrap_or(30_000)),
            p.and_then(|p| p.alert_after).unwrap_or(5),
        )
    }
}
