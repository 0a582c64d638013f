//! Install configuration.
//!
//! Loaded once at startup from a JSON file and never live-reloaded. Exactly
//! one of `paxos` (embedded consensus) or `kvs` (external KV bound store) must
//! be present.
//!
//! ```json
//! {
//!   "cluster": {
//!     "local_node_id": 1,
//!     "servers": ["1@10.0.0.1:8421", "2@10.0.0.2:8421", "3@10.0.0.3:8421"]
//!   },
//!   "paxos": { "data_directory": "/var/lib/timelock", "leader_lease_ms": 2000 },
//!   "async_lock": { "token_ttl_ms": 60000 }
//! }
//! ```
//!
//! # Environment Variables
//!
//! - `TIMELOCK_NODE_ID`: overrides `cluster.local_node_id`
//! - `TIMELOCK_DATA_DIR`: overrides `paxos.data_directory`

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TimelockError};
use crate::lock::LockConfig;
use crate::paxos::{ElectionConfig, NodeId};
use crate::timestamp::AllocatorConfig;

pub const ENV_NODE_ID: &str = "TIMELOCK_NODE_ID";
pub const ENV_DATA_DIR: &str = "TIMELOCK_DATA_DIR";

/// Name of the proposal log file inside `paxos.data_directory`.
pub const PAXOS_LOG_FILE: &str = "paxos.redb";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelockConfig {
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub paxos: Option<PaxosConfig>,
    #[serde(default)]
    pub kvs: Option<KvsConfig>,
    #[serde(default)]
    pub async_lock: AsyncLockConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub local_node_id: NodeId,
    /// Every member, including this node, as `id@host:port`.
    pub servers: Vec<String>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

/// Certificate paths handed to the transport layer; not interpreted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaxosConfig {
    pub data_directory: PathBuf,
    pub leader_lease_ms: u64,
    pub renew_interval_ms: u64,
    pub campaign_interval_ms: u64,
    pub rpc_timeout_ms: u64,
    pub max_round_attempts: u32,
    pub timestamp_batch_size: u64,
    pub reservation_timeout_ms: u64,
    /// Cap of the backoff between proposal log initialization attempts.
    pub init_backoff_cap_ms: u64,
}

impl Default for PaxosConfig {
    fn default() -> Self {
        Self {
            data_directory: PathBuf::from("./timelock_data"),
            leader_lease_ms: 2_000,
            renew_interval_ms: 500,
            campaign_interval_ms: 1_000,
            rpc_timeout_ms: 500,
            max_round_attempts: 5,
            timestamp_batch_size: 10_000,
            reservation_timeout_ms: 5_000,
            init_backoff_cap_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvsConfig {
    /// redb file holding the timestamp bound cell.
    pub path: PathBuf,
    #[serde(default = "default_batch_size")]
    pub timestamp_batch_size: u64,
    #[serde(default = "default_reservation_timeout_ms")]
    pub reservation_timeout_ms: u64,
}

fn default_batch_size() -> u64 {
    10_000
}

fn default_reservation_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsyncLockConfig {
    pub default_timeout_ms: u64,
    pub max_queue_depth: usize,
    pub token_ttl_ms: u64,
    pub reaper_interval_ms: u64,
}

impl Default for AsyncLockConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_queue_depth: 1_000,
            token_ttl_ms: 60_000,
            reaper_interval_ms: 1_000,
        }
    }
}

impl AsyncLockConfig {
    pub fn lock_config(&self) -> LockConfig {
        LockConfig {
            default_timeout: Duration::from_millis(self.default_timeout_ms),
            max_queue_depth: self.max_queue_depth,
            token_ttl: Duration::from_millis(self.token_ttl_ms),
            reaper_interval: Duration::from_millis(self.reaper_interval_ms),
        }
    }
}

impl PaxosConfig {
    pub fn election_config(&self) -> ElectionConfig {
        ElectionConfig {
            lease_duration: Duration::from_millis(self.leader_lease_ms),
            renew_interval: Duration::from_millis(self.renew_interval_ms),
            campaign_interval: Duration::from_millis(self.campaign_interval_ms),
            max_round_attempts: self.max_round_attempts,
            ..ElectionConfig::default()
        }
    }

    pub fn allocator_config(&self) -> AllocatorConfig {
        AllocatorConfig {
            batch_size: self.timestamp_batch_size,
            reservation_timeout: Duration::from_millis(self.reservation_timeout_ms),
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_directory.join(PAXOS_LOG_FILE)
    }
}

impl KvsConfig {
    pub fn allocator_config(&self) -> AllocatorConfig {
        AllocatorConfig {
            batch_size: self.timestamp_batch_size,
            reservation_timeout: Duration::from_millis(self.reservation_timeout_ms),
        }
    }
}

/// A cluster member parsed from `id@host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub id: NodeId,
    pub address: String,
}

impl ServerAddress {
    pub fn parse(s: &str) -> Result<Self> {
        let (id, address) = s.split_once('@').ok_or_else(|| {
            TimelockError::Config(format!("expected 'id@host:port', got '{}'", s))
        })?;
        let id: NodeId = id
            .trim()
            .parse()
            .map_err(|_| TimelockError::Config(format!("invalid node id: '{}'", id)))?;
        let address = address.trim();
        if address.is_empty() {
            return Err(TimelockError::Config(format!("missing address in '{}'", s)));
        }
        Ok(Self {
            id,
            address: address.to_string(),
        })
    }
}

impl std::fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// Which timestamp bound store the node runs with.
#[derive(Debug, Clone, Copy)]
pub enum Mode<'a> {
    Paxos(&'a PaxosConfig),
    Kvs(&'a KvsConfig),
}

impl TimelockConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read `path`, apply environment overrides and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            TimelockError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_json(&json)?;
        config.apply_overrides(
            std::env::var(ENV_NODE_ID).ok().as_deref(),
            std::env::var(ENV_DATA_DIR).ok().as_deref(),
        )?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, node_id: Option<&str>, data_dir: Option<&str>) -> Result<()> {
        if let Some(id) = node_id {
            self.cluster.local_node_id = id.trim().parse().map_err(|_| {
                TimelockError::Config(format!("{} must be a valid u64, got '{}'", ENV_NODE_ID, id))
            })?;
        }
        if let Some(dir) = data_dir {
            if let Some(paxos) = self.paxos.as_mut() {
                paxos.data_directory = PathBuf::from(dir);
            }
        }
        Ok(())
    }

    pub fn servers(&self) -> Result<Vec<ServerAddress>> {
        self.cluster
            .servers
            .iter()
            .map(|s| ServerAddress::parse(s))
            .collect()
    }

    pub fn mode(&self) -> Result<Mode<'_>> {
        match (&self.paxos, &self.kvs) {
            (Some(paxos), None) => Ok(Mode::Paxos(paxos)),
            (None, Some(kvs)) => Ok(Mode::Kvs(kvs)),
            (Some(_), Some(_)) => Err(TimelockError::Config(
                "exactly one of 'paxos' or 'kvs' must be configured, found both".into(),
            )),
            (None, None) => Err(TimelockError::Config(
                "exactly one of 'paxos' or 'kvs' must be configured, found neither".into(),
            )),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let servers = self.servers()?;
        if servers.is_empty() {
            return Err(TimelockError::Config("cluster.servers is empty".into()));
        }
        let mut ids = HashSet::new();
        for server in &servers {
            if !ids.insert(server.id) {
                return Err(TimelockError::Config(format!(
                    "duplicate node id {} in cluster.servers",
                    server.id
                )));
            }
        }
        if !ids.contains(&self.cluster.local_node_id) {
            return Err(TimelockError::Config(format!(
                "local node {} is not listed in cluster.servers",
                self.cluster.local_node_id
            )));
        }

        match self.mode()? {
            Mode::Paxos(paxos) => {
                if paxos.leader_lease_ms == 0 || paxos.rpc_timeout_ms == 0 {
                    return Err(TimelockError::Config(
                        "paxos.leader_lease_ms and paxos.rpc_timeout_ms must be positive".into(),
                    ));
                }
                if paxos.renew_interval_ms == 0 || paxos.renew_interval_ms >= paxos.leader_lease_ms {
                    return Err(TimelockError::Config(format!(
                        "paxos.renew_interval_ms ({}) must be positive and below leader_lease_ms ({})",
                        paxos.renew_interval_ms, paxos.leader_lease_ms
                    )));
                }
                if paxos.timestamp_batch_size == 0 || paxos.max_round_attempts == 0 {
                    return Err(TimelockError::Config(
                        "paxos.timestamp_batch_size and paxos.max_round_attempts must be positive"
                            .into(),
                    ));
                }
            }
            Mode::Kvs(kvs) => {
                if servers.len() != 1 {
                    return Err(TimelockError::Config(format!(
                        "kvs mode runs a single node, but {} servers are configured",
                        servers.len()
                    )));
                }
                if kvs.timestamp_batch_size == 0 {
                    return Err(TimelockError::Config(
                        "kvs.timestamp_batch_size must be positive".into(),
                    ));
                }
            }
        }

        let lock = &self.async_lock;
        if lock.max_queue_depth == 0 || lock.token_ttl_ms == 0 || lock.reaper_interval_ms == 0 {
            return Err(TimelockError::Config(
                "async_lock.max_queue_depth, token_ttl_ms and reaper_interval_ms must be positive"
                    .into(),
            ));
        }
        Ok(())
    }
}
