//! # HybridKV Master/Replica Client
//!
//! Purpose: Connect to a sentinel-managed master with replicas, route each
//! command to the right node and follow failovers without reconnecting by
//! hand.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `KVClient` and `MasterReplicaConnection` hide
//!    discovery, routing and event handling.
//! 2. **Pipelining**: Each node connection keeps many requests in flight
//!    and matches replies in order.
//! 3. **Atomic Topology**: Routing always reads one complete snapshot.
//! 4. **Protocol Clarity**: RESP2 framing lives in `hkv-common`; this crate
//!    only moves frames.

mod client;
pub mod commands;
mod config;
mod connection;
mod failover;
mod master_replica;
mod registry;
mod sentinel;
mod topology;

pub use client::KVClient;
pub use config::{ClientConfig, ConfigError};
pub use connection::{ConnectOptions, NodeConnection, PushMessage};
pub use failover::{FailoverMonitor, TopologyEvent, MONITORED_CHANNELS};
pub use master_replica::MasterReplicaConnection;
pub use registry::{ConnectionId, ConnectionKind, ConnectionRegistry, RegisteredConnection};
pub use sentinel::{Discovery, ReplicaInfo, SentinelConnection, SentinelConnector};
pub use topology::{
    is_read_only, InvalidAddress, Node, NodeAddress, NodeRole, ReadFrom, Topology, TopologyRouter, UnknownReadFrom,
};

pub use hkv_common::{
    interrupt, AsyncCommand, BooleanOutput, Command, CommandArgs, CommandKeyword, CommandOutput, CommandState,
    CommandType, CustomKeyword, HkvError, HkvResult, IntegerOutput, MapListOutput, NestedMultiOutput, NestedValue,
    ProtocolKeyword, ServerError, StatusOutput, TextOutput, ValueListOutput, ValueOutput,
};
