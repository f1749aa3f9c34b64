//! # Sentinel Access
//!
//! Purpose: Ask sentinels where the master and replicas of a named
//! deployment are, and subscribe to the channels on which they announce
//! topology changes.
//!
//! ## Design Principles
//! 1. **First Reachable Wins**: Endpoints are tried in configured order; the
//!    first that accepts a connection answers discovery queries.
//! 2. **Short-Lived Queries**: Discovery connections are closed as soon as
//!    the answer is in. Only subscriptions stay open.
//! 3. **Health From Flags**: A replica flagged `s_down`, `o_down` or
//!    `disconnected` is kept in the topology but never routed to.

use std::collections::HashMap;
use std::time::Duration;

use hkv_common::{HkvError, HkvResult};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::commands;
use crate::connection::{ConnectOptions, NodeConnection, PushMessage};
use crate::registry::{ConnectionKind, ConnectionRegistry};
use crate::topology::NodeAddress;

const UNHEALTHY_FLAGS: [&str; 3] = ["s_down", "o_down", "disconnected"];

/// Replica entry reported by a sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaInfo {
    pub address: NodeAddress,
    pub flags: Vec<String>,
}

impl ReplicaInfo {
    /// Reads the `ip`, `port` and `flags` fields of one `SENTINEL SLAVES`
    /// element. Returns `None` when the address is missing or malformed.
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let host = fields.get("ip")?;
        let port = fields.get("port")?.parse::<u16>().ok()?;
        let flags = fields
            .get("flags")
            .map(|flags| flags.split(',').filter(|flag| !flag.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();
        Some(ReplicaInfo {
            address: NodeAddress::new(host.as_str(), port),
            flags,
        })
    }

    pub fn is_healthy(&self) -> bool {
        !self.flags.iter().any(|flag| UNHEALTHY_FLAGS.contains(&flag.as_str()))
    }
}

/// Result of one discovery round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    pub master: NodeAddress,
    pub replicas: Vec<ReplicaInfo>,
}

/// Opens connections to the configured sentinels.
#[derive(Debug, Clone)]
pub struct SentinelConnector {
    endpoints: Vec<String>,
    connect_timeout: Duration,
    command_timeout: Duration,
    client_name: Option<String>,
    registry: ConnectionRegistry,
}

impl SentinelConnector {
    pub fn new(
        endpoints: Vec<String>,
        connect_timeout: Duration,
        command_timeout: Duration,
        registry: ConnectionRegistry,
    ) -> Self {
        SentinelConnector {
            endpoints,
            connect_timeout,
            command_timeout,
            client_name: None,
            registry,
        }
    }

    /// Name announced with `CLIENT SETNAME` on every sentinel connection.
    pub fn with_client_name(mut self, name: Option<String>) -> Self {
        self.client_name = name;
        self
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Connects to the first reachable sentinel.
    ///
    /// When none is reachable the error keeps the last transport failure as
    /// its cause.
    pub async fn connect_any(&self) -> HkvResult<SentinelConnection> {
        let options = self.options(ConnectionKind::SentinelCommand);
        let mut last_error = None;
        for endpoint in &self.endpoints {
            match NodeConnection::connect(endpoint.as_str(), options.clone(), self.registry.clone(), None).await {
                Ok(connection) => {
                    debug!(sentinel = %endpoint, "sentinel connected");
                    return Ok(SentinelConnection {
                        connection,
                        timeout: self.command_timeout,
                    });
                }
                Err(err) => {
                    warn!(sentinel = %endpoint, %err, "sentinel unreachable");
                    last_error = Some(err);
                }
            }
        }
        let message = format!("unable to connect to any sentinel of [{}]", self.endpoints.join(", "));
        Err(match last_error {
            Some(cause) => HkvError::connection_caused_by(message, cause),
            None => HkvError::connection(message),
        })
    }

    /// Resolves master and replicas of `master_name` through the first
    /// reachable sentinel.
    pub async fn discover(&self, master_name: &str) -> HkvResult<Discovery> {
        let sentinel = self.connect_any().await?;
        let result = sentinel.discover(master_name).await;
        sentinel.close().await;
        result
    }

    /// Opens a pub/sub connection to `endpoint` subscribed to `channels`.
    /// Messages are forwarded to `sink`.
    pub async fn subscribe(
        &self,
        endpoint: &str,
        channels: &[&str],
        sink: mpsc::UnboundedSender<PushMessage>,
    ) -> HkvResult<NodeConnection> {
        let options = self.options(ConnectionKind::SentinelPubSub);
        let connection = NodeConnection::connect(endpoint, options, self.registry.clone(), Some(sink)).await?;
        for channel in channels {
            if let Err(err) = connection.execute(commands::subscribe(channel), self.command_timeout).await {
                connection.close().await;
                return Err(err);
            }
        }
        info!(sentinel = %endpoint, channels = channels.len(), "subscribed to sentinel events");
        Ok(connection)
    }

    fn options(&self, kind: ConnectionKind) -> ConnectOptions {
        ConnectOptions {
            kind,
            connect_timeout: self.connect_timeout,
            drain_timeout: self.command_timeout.min(self.connect_timeout),
            client_name: self.client_name.clone(),
        }
    }
}

/// Command connection to one sentinel.
#[derive(Debug)]
pub struct SentinelConnection {
    connection: NodeConnection,
    timeout: Duration,
}

impl SentinelConnection {
    pub fn addr(&self) -> &str {
        self.connection.addr()
    }

    /// `Ok(None)` when the sentinel does not monitor `master_name`.
    pub async fn master_addr(&self, master_name: &str) -> HkvResult<Option<NodeAddress>> {
        let reply = self
            .connection
            .execute(commands::sentinel_master_addr(master_name), self.timeout)
            .await?;
        match reply.as_slice() {
            [] => Ok(None),
            [Some(host), Some(port)] => {
                let host = String::from_utf8_lossy(host);
                let port = std::str::from_utf8(port)
                    .ok()
                    .and_then(|port| port.parse::<u16>().ok())
                    .ok_or_else(|| HkvError::Protocol(format!("invalid master port reported for '{}'", master_name)))?;
                Ok(Some(NodeAddress::new(host.into_owned(), port)))
            }
            _ => Err(HkvError::Protocol(format!(
                "unexpected master address reply with {} elements",
                reply.len()
            ))),
        }
    }

    pub async fn replicas(&self, master_name: &str) -> HkvResult<Vec<ReplicaInfo>> {
        let entries = self
            .connection
            .execute(commands::sentinel_replicas(master_name), self.timeout)
            .await?;
        let mut replicas = Vec::with_capacity(entries.len());
        for fields in &entries {
            match ReplicaInfo::from_fields(fields) {
                Some(replica) => replicas.push(replica),
                None => warn!(sentinel = %self.addr(), ?fields, "replica entry without address ignored"),
            }
        }
        Ok(replicas)
    }

    /// Master address plus replicas. A sentinel that knows no master for
    /// the name yields `TopologyUnavailable`.
    pub async fn discover(&self, master_name: &str) -> HkvResult<Discovery> {
        let master = self.master_addr(master_name).await?.ok_or_else(|| {
            HkvError::TopologyUnavailable(format!(
                "sentinel {} knows no master named '{}'",
                self.addr(),
                master_name
            ))
        })?;
        let replicas = self.replicas(master_name).await?;
        debug!(%master, replicas = replicas.len(), "discovered topology");
        Ok(Discovery { master, replicas })
    }

    pub async fn close(self) {
        self.connection.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn healthy_replica_from_fields() {
        let replica =
            ReplicaInfo::from_fields(&fields(&[("ip", "10.0.0.2"), ("port", "6380"), ("flags", "slave")])).unwrap();
        assert_eq!(replica.address, NodeAddress::new("10.0.0.2", 6380));
        assert!(replica.is_healthy());
    }

    #[test]
    fn down_flags_mark_replica_unhealthy() {
        for flags in ["slave,s_down", "slave,o_down", "slave,disconnected"] {
            let replica =
                ReplicaInfo::from_fields(&fields(&[("ip", "10.0.0.2"), ("port", "6380"), ("flags", flags)])).unwrap();
            assert!(!replica.is_healthy(), "{}", flags);
        }
    }

    #[test]
    fn entry_without_port_is_skipped() {
        assert!(ReplicaInfo::from_fields(&fields(&[("ip", "10.0.0.2")])).is_none());
    }
}
