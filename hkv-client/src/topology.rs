//! # Topology and Routing
//!
//! Purpose: Hold the current master/replica view and pick the node each
//! command runs on, based on whether the verb only reads and on the active
//! `ReadFrom` policy.
//!
//! ## Design Principles
//! 1. **Immutable Snapshots**: A `Topology` never changes after it is built;
//!    a refresh swaps in a whole new one. Routing reads one consistent view.
//! 2. **Writes Fail Fast**: With no known master a write is rejected with
//!    `TopologyUnavailable` instead of waiting for a failover to finish.
//! 3. **Reuse Sockets**: Rebuilding a topology keeps open connections to
//!    nodes that are still members, whatever their new role.
//!
//! ## Routing Table
//!
//! | Policy           | Read-only verb                   | Other verbs |
//! |------------------|----------------------------------|-------------|
//! | MASTER           | master                           | master      |
//! | SLAVE            | healthy replica                  | master      |
//! | MASTER_PREFERRED | master, else healthy replica     | master      |
//! | SLAVE_PREFERRED  | healthy replica, else master     | master      |
//! | NEAREST          | lowest connect latency           | master      |

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use hkv_common::{same_keyword, CommandType, HkvError, HkvResult, ProtocolKeyword};
use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::connection::{ConnectOptions, NodeConnection};
use crate::registry::ConnectionRegistry;
use crate::sentinel::Discovery;

/// `host:port` of a node or sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid address '{0}', expected host:port")]
pub struct InvalidAddress(pub String);

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        NodeAddress {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for NodeAddress {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidAddress(s.to_string());
        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(NodeAddress::new(host, port))
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Read routing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadFrom {
    #[default]
    Master,
    #[serde(alias = "REPLICA")]
    Slave,
    MasterPreferred,
    #[serde(alias = "REPLICA_PREFERRED")]
    SlavePreferred,
    Nearest,
}

impl ReadFrom {
    pub const ALL: [ReadFrom; 5] = [
        ReadFrom::Master,
        ReadFrom::Slave,
        ReadFrom::MasterPreferred,
        ReadFrom::SlavePreferred,
        ReadFrom::Nearest,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReadFrom::Master => "MASTER",
            ReadFrom::Slave => "SLAVE",
            ReadFrom::MasterPreferred => "MASTER_PREFERRED",
            ReadFrom::SlavePreferred => "SLAVE_PREFERRED",
            ReadFrom::Nearest => "NEAREST",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown read policy '{0}'")]
pub struct UnknownReadFrom(pub String);

impl FromStr for ReadFrom {
    type Err = UnknownReadFrom;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        let normalized = normalized.replace("REPLICA", "SLAVE");
        ReadFrom::ALL
            .into_iter()
            .find(|policy| policy.as_str() == normalized)
            .ok_or_else(|| UnknownReadFrom(s.to_string()))
    }
}

impl fmt::Display for ReadFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verbs that never modify data and may run on a replica.
const READ_ONLY: &[CommandType] = &[
    CommandType::DBSIZE,
    CommandType::ECHO,
    CommandType::EXISTS,
    CommandType::GET,
    CommandType::GETRANGE,
    CommandType::HEXISTS,
    CommandType::HGET,
    CommandType::HGETALL,
    CommandType::HKEYS,
    CommandType::HLEN,
    CommandType::HMGET,
    CommandType::HVALS,
    CommandType::INFO,
    CommandType::KEYS,
    CommandType::LINDEX,
    CommandType::LLEN,
    CommandType::LRANGE,
    CommandType::MGET,
    CommandType::PTTL,
    CommandType::RANDOMKEY,
    CommandType::ROLE,
    CommandType::SCAN,
    CommandType::SCARD,
    CommandType::SISMEMBER,
    CommandType::SMEMBERS,
    CommandType::STRLEN,
    CommandType::TIME,
    CommandType::TTL,
    CommandType::TYPE,
    CommandType::ZCARD,
    CommandType::ZRANGE,
    CommandType::ZRANK,
    CommandType::ZSCORE,
];

/// Returns true when `verb` only reads. Unknown verbs count as writes.
pub fn is_read_only(verb: &dyn ProtocolKeyword) -> bool {
    READ_ONLY.iter().any(|known| same_keyword(known, verb))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Master,
    Replica,
}

/// Member of a topology together with its connection.
#[derive(Debug)]
pub struct Node {
    address: NodeAddress,
    role: NodeRole,
    healthy: bool,
    connection: NodeConnection,
}

impl Node {
    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Health as last reported by a sentinel.
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn connection(&self) -> &NodeConnection {
        &self.connection
    }
}

/// Immutable master/replica view.
#[derive(Debug, Default)]
pub struct Topology {
    generation: u64,
    master: Option<Arc<Node>>,
    replicas: Vec<Arc<Node>>,
}

impl Topology {
    /// Increases by one for every failover notification handled.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn master(&self) -> Option<&Arc<Node>> {
        self.master.as_ref()
    }

    pub fn replicas(&self) -> &[Arc<Node>] {
        &self.replicas
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.master.iter().chain(self.replicas.iter())
    }

    pub fn find(&self, address: &NodeAddress) -> Option<&Arc<Node>> {
        self.nodes().find(|node| &node.address == address)
    }

    /// Connections of `self` that `next` no longer uses.
    pub fn retired_by(&self, next: &Topology) -> Vec<NodeConnection> {
        self.nodes()
            .filter(|old| !next.nodes().any(|new| new.connection.same_socket(&old.connection)))
            .map(|old| old.connection.clone())
            .collect()
    }
}

/// Routes commands over the current topology.
pub struct TopologyRouter {
    current: RwLock<Arc<Topology>>,
    read_from: RwLock<ReadFrom>,
    generations: AtomicU64,
    rotation: AtomicUsize,
    auto_reconnect: bool,
}

impl TopologyRouter {
    pub fn new(topology: Topology, read_from: ReadFrom) -> Self {
        let generation = topology.generation;
        TopologyRouter {
            current: RwLock::new(Arc::new(topology)),
            read_from: RwLock::new(read_from),
            generations: AtomicU64::new(generation),
            rotation: AtomicUsize::new(0),
            auto_reconnect: false,
        }
    }

    /// Lets routing pick nodes whose connection is closed but can be
    /// reopened on dispatch.
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn topology(&self) -> Arc<Topology> {
        self.current.read().clone()
    }

    pub fn read_from(&self) -> ReadFrom {
        *self.read_from.read()
    }

    /// Takes effect for the next routed command; no reconnect happens.
    pub fn set_read_from(&self, read_from: ReadFrom) {
        let previous = std::mem::replace(&mut *self.read_from.write(), read_from);
        if previous != read_from {
            info!(from = %previous, to = %read_from, "read policy changed");
        }
    }

    /// Reserves the generation number of the next topology.
    pub fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Installs `topology` and returns the one it replaces.
    pub fn replace(&self, topology: Topology) -> Arc<Topology> {
        let next = Arc::new(topology);
        let previous = std::mem::replace(&mut *self.current.write(), next.clone());
        info!(
            generation = next.generation,
            master = %next.master.as_ref().map_or_else(|| "-".to_string(), |node| node.address.to_string()),
            replicas = next.replicas.len(),
            "topology updated"
        );
        previous
    }

    /// Selects the node for a command with verb `verb`.
    pub fn route(&self, verb: &dyn ProtocolKeyword) -> HkvResult<Arc<Node>> {
        let topology = self.topology();
        if !is_read_only(verb) {
            return master_of(&topology);
        }
        let policy = self.read_from();
        let selected = match policy {
            ReadFrom::Master => master_of(&topology),
            ReadFrom::Slave => self.replica_of(&topology),
            ReadFrom::MasterPreferred => match master_of(&topology) {
                Ok(master) if self.reachable(&master) => Ok(master),
                fallback => self.replica_of(&topology).or(fallback),
            },
            ReadFrom::SlavePreferred => self.replica_of(&topology).or_else(|_| master_of(&topology)),
            ReadFrom::Nearest => self.nearest_of(&topology),
        };
        if let Ok(node) = &selected {
            debug!(verb = verb.name(), %policy, node = %node.address, "routed");
        }
        selected
    }

    fn reachable(&self, node: &Node) -> bool {
        self.auto_reconnect || node.connection.is_open()
    }

    fn replica_of(&self, topology: &Topology) -> HkvResult<Arc<Node>> {
        let available: Vec<&Arc<Node>> = topology
            .replicas
            .iter()
            .filter(|node| node.healthy && self.reachable(node))
            .collect();
        if available.is_empty() {
            return Err(HkvError::TopologyUnavailable("no healthy replica available".to_string()));
        }
        let index = self.rotation.fetch_add(1, Ordering::Relaxed) % available.len();
        Ok(available[index].clone())
    }

    fn nearest_of(&self, topology: &Topology) -> HkvResult<Arc<Node>> {
        let master = topology.master.iter().filter(|node| self.reachable(node));
        let replicas = topology.replicas.iter().filter(|node| node.healthy && self.reachable(node));
        master
            .chain(replicas)
            .min_by_key(|node| node.connection.latency())
            .cloned()
            .ok_or_else(|| HkvError::TopologyUnavailable("no reachable node".to_string()))
    }
}

impl fmt::Debug for TopologyRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopologyRouter")
            .field("topology", &self.topology())
            .field("read_from", &self.read_from())
            .finish()
    }
}

fn master_of(topology: &Topology) -> HkvResult<Arc<Node>> {
    topology
        .master
        .clone()
        .ok_or_else(|| HkvError::TopologyUnavailable("no master known".to_string()))
}

/// Builds a topology from a sentinel discovery, reusing open connections of
/// `previous` for nodes that are still members.
///
/// Without `previous` an unreachable master is an error. On refresh it only
/// leaves the master unset until the next notification.
pub(crate) async fn connect_topology(
    discovery: &Discovery,
    previous: Option<&Topology>,
    generation: u64,
    options: &ConnectOptions,
    registry: &ConnectionRegistry,
) -> HkvResult<Topology> {
    let master = match attach(&discovery.master, previous, options, registry).await {
        Ok(connection) => Some(Arc::new(Node {
            address: discovery.master.clone(),
            role: NodeRole::Master,
            healthy: true,
            connection,
        })),
        Err(err) if previous.is_some() => {
            warn!(master = %discovery.master, %err, "new master unreachable");
            None
        }
        Err(err) => return Err(err),
    };

    let mut replicas: Vec<Arc<Node>> = Vec::with_capacity(discovery.replicas.len());
    for info in &discovery.replicas {
        if info.address == discovery.master || replicas.iter().any(|node| node.address == info.address) {
            continue;
        }
        match attach(&info.address, previous, options, registry).await {
            Ok(connection) => replicas.push(Arc::new(Node {
                address: info.address.clone(),
                role: NodeRole::Replica,
                healthy: info.is_healthy(),
                connection,
            })),
            Err(err) => warn!(replica = %info.address, %err, "replica unreachable, skipped"),
        }
    }

    Ok(Topology {
        generation,
        master,
        replicas,
    })
}

async fn attach(
    address: &NodeAddress,
    previous: Option<&Topology>,
    options: &ConnectOptions,
    registry: &ConnectionRegistry,
) -> HkvResult<NodeConnection> {
    if let Some(node) = previous.and_then(|topology| topology.find(address)) {
        if node.connection.is_open() {
            return Ok(node.connection.clone());
        }
    }
    NodeConnection::connect(address.to_string(), options.clone(), registry.clone(), None).await
}
