//! # Master/Replica Connection
//!
//! Purpose: One logical connection over a sentinel-managed deployment.
//! Commands are routed per verb: writes to the master, reads according to
//! the current `ReadFrom` policy.
//!
//! ## Usage
//!
//! ```no_run
//! use hkv_client::{ClientConfig, KVClient, ReadFrom};
//!
//! let client = KVClient::new()?;
//! let config = ClientConfig::new(["127.0.0.1:26379"], "mymaster");
//! let connection = client.connect_master_replica(&config)?;
//! connection.set(b"greeting".as_slice(), b"hello".as_slice())?;
//! connection.set_read_from(ReadFrom::SlavePreferred);
//! let value = connection.get(b"greeting".as_slice())?;
//! connection.close();
//! # let _ = value;
//! # Ok::<(), hkv_client::HkvError>(())
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hkv_common::{AsyncCommand, Command, CommandOutput, HkvError, HkvResult};
use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tracing::{info, warn};

use crate::commands;
use crate::config::ClientConfig;
use crate::connection::ConnectOptions;
use crate::failover::{FailoverMonitor, Refresher};
use crate::registry::{ConnectionKind, ConnectionRegistry};
use crate::sentinel::SentinelConnector;
use crate::topology::{connect_topology, ReadFrom, Topology, TopologyRouter};

/// Routed connection to a master and its replicas.
///
/// Blocking methods must not be called from inside an async runtime.
pub struct MasterReplicaConnection {
    runtime: Arc<Runtime>,
    router: Arc<TopologyRouter>,
    refresher: Arc<Refresher>,
    monitor: Mutex<Option<FailoverMonitor>>,
    master_name: String,
    timeout: Duration,
    auto_reconnect: bool,
    closed: AtomicBool,
}

impl MasterReplicaConnection {
    pub(crate) fn connect(
        runtime: Arc<Runtime>,
        registry: ConnectionRegistry,
        config: &ClientConfig,
    ) -> HkvResult<Self> {
        config.validate()?;
        let connector = SentinelConnector::new(
            config.sentinels.clone(),
            config.connect_timeout,
            config.timeout,
            registry.clone(),
        )
        .with_client_name(config.client_name.clone());
        let node_options = ConnectOptions {
            kind: ConnectionKind::Data,
            connect_timeout: config.connect_timeout,
            drain_timeout: config.drain_timeout,
            client_name: config.client_name.clone(),
        };

        let (router, refresher, monitor) = runtime.block_on(async {
            let discovery = connector.discover(&config.master_name).await?;
            let topology = connect_topology(&discovery, None, 0, &node_options, &registry).await?;
            let router = Arc::new(
                TopologyRouter::new(topology, config.read_from).with_auto_reconnect(config.auto_reconnect),
            );
            let refresher = Arc::new(Refresher::new(
                connector,
                router.clone(),
                config.master_name.clone(),
                node_options,
                registry,
            ));
            let monitor = FailoverMonitor::start(refresher.clone(), config.auto_reconnect).await;
            Ok::<_, HkvError>((router, refresher, monitor))
        })?;

        Ok(MasterReplicaConnection {
            runtime,
            router,
            refresher,
            monitor: Mutex::new(Some(monitor)),
            master_name: config.master_name.clone(),
            timeout: config.timeout,
            auto_reconnect: config.auto_reconnect,
            closed: AtomicBool::new(false),
        })
    }

    /// Routes `command` and returns its handle without waiting.
    ///
    /// Fails with `TopologyUnavailable` when no node fits the command. A
    /// command routed to a closed node completes with a connection error,
    /// unless auto-reconnect reopens the node first.
    pub fn dispatch<O>(&self, command: Command<O>) -> HkvResult<AsyncCommand<O>>
    where
        O: CommandOutput + 'static,
    {
        if self.is_closed() {
            return Err(HkvError::connection(format!(
                "connection to '{}' is closed",
                self.master_name
            )));
        }
        let node = self.router.route(command.keyword())?;
        let connection = node.connection();
        if self.auto_reconnect && !connection.is_open() {
            self.runtime.block_on(connection.reconnect())?;
        }
        Ok(connection.submit(command))
    }

    /// Dispatches `command` and waits up to the configured timeout.
    pub fn exec<O>(&self, command: Command<O>) -> HkvResult<O::Output>
    where
        O: CommandOutput + 'static,
    {
        self.dispatch(command)?.get_timeout(self.timeout)
    }

    pub fn ping(&self) -> HkvResult<String> {
        self.exec(commands::ping())
    }

    /// Fetches a value by key. Returns `Ok(None)` when the key is missing.
    pub fn get(&self, key: impl Into<Vec<u8>>) -> HkvResult<Option<Vec<u8>>> {
        self.exec(commands::get(key))
    }

    pub fn set(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> HkvResult<()> {
        self.exec(commands::set(key, value)).map(|_| ())
    }

    /// Deletes keys and returns how many existed.
    pub fn del<I, K>(&self, keys: I) -> HkvResult<i64>
    where
        I: IntoIterator<Item = K>,
        K: Into<Vec<u8>>,
    {
        self.exec(commands::del(keys))
    }

    /// `INFO [section]` from the node the read policy selects.
    pub fn info(&self, section: Option<&str>) -> HkvResult<String> {
        self.exec(commands::info(section)).map(Option::unwrap_or_default)
    }

    pub fn client_getname(&self) -> HkvResult<Option<String>> {
        self.exec(commands::client_getname())
    }

    /// Names the master connection until it reconnects; reconnects announce
    /// the configured client name.
    pub fn client_setname(&self, name: &str) -> HkvResult<()> {
        self.exec(commands::client_setname(name)).map(|_| ())
    }

    /// Sends `QUIT` to the master. Its connection counts as closed once the
    /// reply is read.
    pub fn quit(&self) -> HkvResult<()> {
        self.exec(commands::quit()).map(|_| ())
    }

    pub fn read_from(&self) -> ReadFrom {
        self.router.read_from()
    }

    /// Changes the read policy for subsequent commands.
    pub fn set_read_from(&self, read_from: ReadFrom) {
        self.router.set_read_from(read_from);
    }

    /// Current topology snapshot.
    pub fn topology(&self) -> Arc<Topology> {
        self.router.topology()
    }

    /// Rediscovers the topology now instead of waiting for an event.
    pub fn refresh_topology(&self) -> HkvResult<u64> {
        if self.is_closed() {
            return Err(HkvError::connection("connection is closed"));
        }
        self.runtime.block_on(self.refresher.refresh())
    }

    /// Number of sentinels currently delivering failover events.
    pub fn sentinel_subscriptions(&self) -> usize {
        self.monitor.lock().as_ref().map_or(0, FailoverMonitor::subscriptions)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes the failover monitor and every node connection, draining
    /// in-flight replies first. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let monitor = self.monitor.lock().take();
        let refresher = self.refresher.clone();
        self.runtime.block_on(async move {
            if let Some(monitor) = monitor {
                monitor.close().await;
            }
            refresher.shutdown().await;
        });
        info!(master_name = %self.master_name, "master/replica connection closed");
    }
}

impl Drop for MasterReplicaConnection {
    fn drop(&mut self) {
        // block_on panics inside a runtime; tasks then end with the runtime.
        if tokio::runtime::Handle::try_current().is_ok() {
            warn!(
                master_name = %self.master_name,
                live = self.router.topology().nodes().count(),
                "dropped inside a runtime without close, node sockets stay open"
            );
            return;
        }
        self.close();
    }
}

impl std::fmt::Debug for MasterReplicaConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterReplicaConnection")
            .field("master_name", &self.master_name)
            .field("read_from", &self.read_from())
            .field("closed", &self.is_closed())
            .finish()
    }
}
