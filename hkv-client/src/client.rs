//! # Client Facade
//!
//! Purpose: Own the I/O runtime shared by every connection a client opens
//! and hand out blocking master/replica connections.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `KVClient` hides the runtime, sentinel discovery
//!    and failover handling behind one constructor.
//! 2. **Blocking Surface**: Callers never need an async runtime of their
//!    own; results are read through `AsyncCommand` handles.
//! 3. **Observable Resources**: Every socket is accounted in one registry.

use std::sync::Arc;

use hkv_common::{HkvError, HkvResult};
use tokio::runtime::{Builder, Runtime};
use tracing::info;

use crate::config::ClientConfig;
use crate::master_replica::MasterReplicaConnection;
use crate::registry::ConnectionRegistry;

const DEFAULT_IO_THREADS: usize = 2;

/// Entry point for opening connections.
///
/// Its methods block and must not be called from inside an async runtime.
pub struct KVClient {
    runtime: Arc<Runtime>,
    registry: ConnectionRegistry,
}

impl KVClient {
    /// Creates a client with a small I/O thread pool.
    pub fn new() -> HkvResult<Self> {
        Self::with_io_threads(DEFAULT_IO_THREADS)
    }

    pub fn with_io_threads(threads: usize) -> HkvResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name("hkv-io")
            .enable_all()
            .build()
            .map_err(|err| HkvError::connection_caused_by("unable to start I/O runtime", err))?;
        Ok(KVClient {
            runtime: Arc::new(runtime),
            registry: ConnectionRegistry::new(),
        })
    }

    /// Discovers the deployment named in `config` through its sentinels and
    /// connects to the master, the replicas and the sentinel event channels.
    ///
    /// **Errors**: `Config` for an invalid configuration, `Connection` when no
    /// sentinel or the master is unreachable, `TopologyUnavailable` when the
    /// sentinel knows no master of that name.
    pub fn connect_master_replica(&self, config: &ClientConfig) -> HkvResult<MasterReplicaConnection> {
        let connection = MasterReplicaConnection::connect(self.runtime.clone(), self.registry.clone(), config)?;
        info!(
            master_name = %config.master_name,
            live = self.registry.len(),
            "master/replica connection established"
        );
        Ok(connection)
    }

    /// Registry of every socket opened through this client.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Number of sockets currently open.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }
}

impl std::fmt::Debug for KVClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KVClient").field("registry", &self.registry).finish()
    }
}
