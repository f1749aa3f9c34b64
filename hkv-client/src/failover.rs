//! # Failover Monitor
//!
//! Purpose: Keep the topology current. Sentinel events for the monitored
//! master trigger a rediscovery; the result replaces the topology in one
//! step.
//!
//! ## Design Principles
//! 1. **Coalesce Bursts**: One failover produces several events on several
//!    sentinels. Everything already queued is folded into one refresh.
//! 2. **Connect, Swap, Retire**: New nodes are connected before the swap;
//!    nodes that left are drained and closed after it. Routing never sees a
//!    half-built topology.
//! 3. **Serialized Refreshes**: At most one refresh runs at a time, so
//!    generations are installed in order. Shutdown takes the same lock, so
//!    no refresh installs nodes after the topology was closed.
//! 4. **Supervised Subscriptions**: A lost sentinel subscription is logged;
//!    with auto-reconnect it is reopened and followed by a refresh, since
//!    events may have been missed meanwhile.
//!
//! ## Event Payloads
//!
//! ```text
//! +switch-master      <master-name> <old-ip> <old-port> <new-ip> <new-port>
//! +sdown, -sdown, ... <instance-type> <name> <ip> <port> [@ <master-name> <ip> <port>]
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hkv_common::{HkvError, HkvResult};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::connection::{ConnectOptions, NodeConnection, PushMessage};
use crate::registry::ConnectionRegistry;
use crate::sentinel::SentinelConnector;
use crate::topology::{connect_topology, NodeAddress, TopologyRouter};

/// Sentinel channels that announce topology changes.
pub const MONITORED_CHANNELS: [&str; 5] = ["+switch-master", "+sdown", "-sdown", "+slave", "+convert-to-slave"];

const SUPERVISE_INTERVAL: Duration = Duration::from_secs(1);

/// Parsed sentinel event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    SwitchMaster {
        master_name: String,
        old: NodeAddress,
        new: NodeAddress,
    },
    Instance {
        channel: String,
        instance_type: String,
        address: NodeAddress,
        master_name: String,
    },
}

impl TopologyEvent {
    pub fn parse(message: &PushMessage) -> Option<Self> {
        let parts: Vec<&str> = message.payload.split_whitespace().collect();
        if message.channel == "+switch-master" {
            let [name, old_ip, old_port, new_ip, new_port] = parts.as_slice() else {
                return None;
            };
            return Some(TopologyEvent::SwitchMaster {
                master_name: name.to_string(),
                old: NodeAddress::new(*old_ip, old_port.parse().ok()?),
                new: NodeAddress::new(*new_ip, new_port.parse().ok()?),
            });
        }

        let [instance_type, name, ip, port, rest @ ..] = parts.as_slice() else {
            return None;
        };
        let master_name = match rest {
            ["@", master_name, ..] => master_name.to_string(),
            [] if *instance_type == "master" => name.to_string(),
            _ => return None,
        };
        Some(TopologyEvent::Instance {
            channel: message.channel.clone(),
            instance_type: instance_type.to_string(),
            address: NodeAddress::new(*ip, port.parse().ok()?),
            master_name,
        })
    }

    pub fn master_name(&self) -> &str {
        match self {
            TopologyEvent::SwitchMaster { master_name, .. } | TopologyEvent::Instance { master_name, .. } => {
                master_name
            }
        }
    }
}

/// Rebuilds the topology from sentinel state.
pub(crate) struct Refresher {
    connector: SentinelConnector,
    router: Arc<TopologyRouter>,
    master_name: String,
    node_options: ConnectOptions,
    registry: ConnectionRegistry,
    serial: AsyncMutex<()>,
    closed: AtomicBool,
}

impl Refresher {
    pub(crate) fn new(
        connector: SentinelConnector,
        router: Arc<TopologyRouter>,
        master_name: String,
        node_options: ConnectOptions,
        registry: ConnectionRegistry,
    ) -> Self {
        Refresher {
            connector,
            router,
            master_name,
            node_options,
            registry,
            serial: AsyncMutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Rediscovers, connects new members, swaps, then closes retired
    /// connections. Returns the installed generation.
    pub(crate) async fn refresh(&self) -> HkvResult<u64> {
        let _serial = self.serial.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(HkvError::connection(format!("connection to '{}' is closed", self.master_name)));
        }
        let generation = self.router.next_generation();
        let discovery = self.connector.discover(&self.master_name).await?;
        let previous = self.router.topology();
        let next = connect_topology(
            &discovery,
            Some(&previous),
            generation,
            &self.node_options,
            &self.registry,
        )
        .await?;
        let retired = previous.retired_by(&next);
        self.router.replace(next);
        for connection in retired {
            debug!(addr = %connection.addr(), "retiring node connection");
            connection.close().await;
        }
        Ok(generation)
    }

    /// Waits for a running refresh, then closes every node of the current
    /// topology. Later refreshes fail.
    pub(crate) async fn shutdown(&self) {
        let _serial = self.serial.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        let topology = self.router.topology();
        for node in topology.nodes() {
            node.connection().close().await;
        }
    }
}

struct Subscription {
    endpoint: String,
    connection: Option<NodeConnection>,
}

/// Background task reacting to sentinel events.
pub struct FailoverMonitor {
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

impl FailoverMonitor {
    /// Subscribes on every reachable sentinel and starts the event loop.
    /// Unreachable sentinels are skipped; with `resubscribe` they are
    /// retried, as are subscriptions lost later.
    pub(crate) async fn start(refresher: Arc<Refresher>, resubscribe: bool) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut subscriptions = Vec::new();
        for endpoint in refresher.connector.endpoints() {
            let connection = match refresher
                .connector
                .subscribe(endpoint, &MONITORED_CHANNELS, events_tx.clone())
                .await
            {
                Ok(connection) => Some(connection),
                Err(err) => {
                    warn!(sentinel = %endpoint, %err, "unable to subscribe to sentinel events");
                    None
                }
            };
            subscriptions.push(Subscription {
                endpoint: endpoint.clone(),
                connection,
            });
        }
        if subscriptions.iter().all(|subscription| subscription.connection.is_none()) {
            warn!(master = %refresher.master_name, "no sentinel subscription, failovers go unnoticed");
        }

        let subscriptions = Arc::new(Mutex::new(subscriptions));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(watch_events(
            refresher,
            subscriptions.clone(),
            events_tx,
            events_rx,
            shutdown_rx,
            resubscribe,
        ));
        FailoverMonitor {
            subscriptions,
            shutdown,
            worker,
        }
    }

    /// Number of open sentinel subscriptions.
    pub fn subscriptions(&self) -> usize {
        self.subscriptions
            .lock()
            .iter()
            .filter(|subscription| subscription.connection.as_ref().is_some_and(NodeConnection::is_open))
            .count()
    }

    /// Stops the event loop after any refresh in progress, then closes the
    /// subscriptions.
    pub(crate) async fn close(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.worker.await {
            warn!(%err, "failover monitor ended abnormally");
        }
        let connections: Vec<NodeConnection> = self
            .subscriptions
            .lock()
            .iter_mut()
            .filter_map(|subscription| subscription.connection.take())
            .collect();
        for connection in connections {
            connection.close().await;
        }
    }
}

async fn watch_events(
    refresher: Arc<Refresher>,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
    sink: mpsc::UnboundedSender<PushMessage>,
    mut events: mpsc::UnboundedReceiver<PushMessage>,
    mut shutdown: watch::Receiver<bool>,
    resubscribe: bool,
) {
    let mut supervise = time::interval_at(time::Instant::now() + SUPERVISE_INTERVAL, SUPERVISE_INTERVAL);
    supervise.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let message = tokio::select! {
            _ = shutdown.changed() => break,
            _ = supervise.tick() => {
                if supervise_subscriptions(&refresher, &subscriptions, &sink, resubscribe).await {
                    match refresher.refresh().await {
                        Ok(generation) => debug!(generation, "topology refreshed after resubscribe"),
                        Err(err) => warn!(%err, "topology refresh failed"),
                    }
                }
                continue;
            }
            message = events.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let mut trigger = relevant(&refresher.master_name, &message);
        while let Ok(next) = events.try_recv() {
            trigger = trigger.or_else(|| relevant(&refresher.master_name, &next));
        }
        let Some(event) = trigger else {
            continue;
        };

        info!(?event, "topology change announced");
        match refresher.refresh().await {
            Ok(generation) => debug!(generation, "topology refreshed"),
            Err(err) => warn!(%err, "topology refresh failed"),
        }
    }
    debug!(master = %refresher.master_name, "failover monitor stopped");
}

/// Detects lost subscriptions and, with `resubscribe`, reopens them.
/// Returns true when at least one subscription was reopened.
async fn supervise_subscriptions(
    refresher: &Refresher,
    subscriptions: &Mutex<Vec<Subscription>>,
    sink: &mpsc::UnboundedSender<PushMessage>,
    resubscribe: bool,
) -> bool {
    let mut lost = Vec::new();
    let mut endpoints = Vec::new();
    for subscription in subscriptions.lock().iter_mut() {
        if subscription.connection.as_ref().is_some_and(NodeConnection::is_open) {
            continue;
        }
        if let Some(connection) = subscription.connection.take() {
            warn!(sentinel = %subscription.endpoint, "sentinel subscription lost");
            lost.push(connection);
        }
        endpoints.push(subscription.endpoint.clone());
    }
    for connection in lost {
        connection.close().await;
    }
    if !resubscribe {
        return false;
    }

    let mut reopened = false;
    for endpoint in endpoints {
        match refresher.connector.subscribe(&endpoint, &MONITORED_CHANNELS, sink.clone()).await {
            Ok(connection) => {
                info!(sentinel = %endpoint, "sentinel subscription reopened");
                let mut subscriptions = subscriptions.lock();
                match subscriptions.iter_mut().find(|subscription| subscription.endpoint == endpoint) {
                    Some(subscription) => subscription.connection = Some(connection),
                    None => subscriptions.push(Subscription {
                        endpoint,
                        connection: Some(connection),
                    }),
                }
                reopened = true;
            }
            Err(err) => debug!(sentinel = %endpoint, %err, "sentinel still unreachable"),
        }
    }
    reopened
}

fn relevant(master_name: &str, message: &PushMessage) -> Option<TopologyEvent> {
    match TopologyEvent::parse(message) {
        Some(event) if event.master_name() == master_name => Some(event),
        Some(_) => None,
        None => {
            debug!(channel = %message.channel, payload = %message.payload, "unrecognized sentinel event");
            None
        }
    }
}
