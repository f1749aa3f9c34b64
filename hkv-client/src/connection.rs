//! # Node Connection
//!
//! Purpose: One pipelined RESP2 connection to a single node. Requests are
//! written in dispatch order and replies are matched to them first in,
//! first out.
//!
//! ## Design Principles
//! 1. **Enqueue Under One Lock**: Appending to the pending queue and handing
//!    bytes to the writer happen together, so wire order equals queue order.
//! 2. **Split I/O**: A writer task batches queued frames into one syscall;
//!    a reader task decodes frames and completes handles. Neither blocks
//!    callers.
//! 3. **Fail Everything on Loss**: When the transport dies every pending
//!    handle completes with a connection error. Nothing is left waiting.
//! 4. **Explicit Accounting**: Each open socket is registered for exactly
//!    as long as it lives.
//!
//! ## Lifecycle
//!
//! ```text
//!  connect ──► open ──(EOF / I/O error / QUIT)──► lost ──reconnect──► open
//!                │                                  │
//!                └──────────── close ───────────────┴──► closed (final)
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use hkv_common::resp::{RespDecoder, RespValue};
use hkv_common::{
    same_keyword, AsyncCommand, Command, CommandOutput, CommandType, HkvError, HkvResult, QueuedCommand,
};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::commands;
use crate::registry::{ConnectionId, ConnectionKind, ConnectionRegistry};

const READ_BUFFER_CAPACITY: usize = 16 * 1024;

/// Settings applied to every (re)connect of a node connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub kind: ConnectionKind,
    pub connect_timeout: Duration,
    pub drain_timeout: Duration,
    /// Sent with `CLIENT SETNAME` before the connection is handed out.
    pub client_name: Option<String>,
}

impl ConnectOptions {
    pub fn new(kind: ConnectionKind, connect_timeout: Duration) -> Self {
        ConnectOptions {
            kind,
            connect_timeout,
            drain_timeout: Duration::from_secs(5),
            client_name: None,
        }
    }
}

/// Pub/sub message delivered outside the request/reply flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub channel: String,
    pub payload: String,
}

impl PushMessage {
    /// Recognizes `message` and `pmessage` frames. Subscription
    /// confirmations are replies and return `None`.
    pub fn from_frame(frame: &RespValue) -> Option<Self> {
        let RespValue::Array(Some(items)) = frame else {
            return None;
        };
        let (channel, payload) = match items.as_slice() {
            [kind, channel, payload] if kind.as_bytes() == Some(b"message".as_slice()) => (channel, payload),
            [kind, _pattern, channel, payload] if kind.as_bytes() == Some(b"pmessage".as_slice()) => {
                (channel, payload)
            }
            _ => return None,
        };
        Some(PushMessage {
            channel: String::from_utf8_lossy(channel.as_bytes()?).into_owned(),
            payload: String::from_utf8_lossy(payload.as_bytes()?).into_owned(),
        })
    }
}

struct Transport {
    id: ConnectionId,
    epoch: u64,
    writer: mpsc::UnboundedSender<Bytes>,
    reader: JoinHandle<()>,
}

struct ConnState {
    queue: VecDeque<Arc<dyn QueuedCommand>>,
    transport: Option<Transport>,
    epoch: u64,
    closing: bool,
    latency: Duration,
}

struct NodeShared {
    addr: String,
    options: ConnectOptions,
    registry: ConnectionRegistry,
    push: Option<mpsc::UnboundedSender<PushMessage>>,
    state: Mutex<ConnState>,
    drained: Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// Handle to a pipelined connection. Clones share the same socket.
#[derive(Clone)]
pub struct NodeConnection {
    shared: Arc<NodeShared>,
}

impl NodeConnection {
    /// Opens a connection to `addr`.
    ///
    /// **Input**: address, options, the registry to account in and an
    /// optional sink for pub/sub messages.
    /// **Output**: an open connection, or `HkvError::Connection` carrying the
    /// transport failure as its cause.
    pub async fn connect(
        addr: impl Into<String>,
        options: ConnectOptions,
        registry: ConnectionRegistry,
        push: Option<mpsc::UnboundedSender<PushMessage>>,
    ) -> HkvResult<Self> {
        let shared = Arc::new(NodeShared {
            addr: addr.into(),
            options,
            registry,
            push,
            state: Mutex::new(ConnState {
                queue: VecDeque::new(),
                transport: None,
                epoch: 0,
                closing: false,
                latency: Duration::ZERO,
            }),
            drained: Notify::new(),
        });
        shared.open().await?;
        Ok(NodeConnection { shared })
    }

    pub fn addr(&self) -> &str {
        &self.shared.addr
    }

    pub fn kind(&self) -> ConnectionKind {
        self.shared.options.kind
    }

    /// True while a transport is attached and close has not been requested.
    pub fn is_open(&self) -> bool {
        let state = self.shared.state.lock();
        state.transport.is_some() && !state.closing
    }

    /// Time the most recent TCP connect took.
    pub fn latency(&self) -> Duration {
        self.shared.state.lock().latency
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.shared.state.lock().transport.as_ref().map(|transport| transport.id)
    }

    /// True when both handles share one underlying connection.
    pub fn same_socket(&self, other: &NodeConnection) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Number of requests written and awaiting a reply.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Queues a type-erased handle. A closed connection fails it at once.
    pub fn dispatch(&self, command: Arc<dyn QueuedCommand>) {
        self.shared.enqueue(command);
    }

    /// Wraps `command` in a handle and queues it.
    pub fn submit<O>(&self, command: Command<O>) -> AsyncCommand<O>
    where
        O: CommandOutput + 'static,
    {
        let handle = AsyncCommand::new(command);
        self.dispatch(Arc::new(handle.clone()));
        handle
    }

    /// Queues `command` and awaits its result for at most `timeout`.
    pub async fn execute<O>(&self, command: Command<O>, timeout: Duration) -> HkvResult<O::Output>
    where
        O: CommandOutput + 'static,
    {
        let handle = self.submit(command);
        match tokio::time::timeout(timeout, handle.wait()).await {
            Ok(result) => result,
            Err(_) => {
                handle.cancel(false);
                Err(HkvError::Timeout)
            }
        }
    }

    /// Reopens a lost transport. No-op when already open; fails after close.
    pub async fn reconnect(&self) -> HkvResult<()> {
        {
            let state = self.shared.state.lock();
            if state.closing {
                return Err(self.shared.closed_error());
            }
            if state.transport.is_some() {
                return Ok(());
            }
        }
        info!(addr = %self.shared.addr, "reconnecting");
        self.shared.open().await
    }

    /// Stops accepting work, waits up to the drain timeout for in-flight
    /// replies, then releases the socket. Leftovers fail with a connection
    /// error. Calling it again is a no-op.
    pub async fn close(&self) {
        let shared = &self.shared;
        {
            let mut state = shared.state.lock();
            if state.closing {
                return;
            }
            state.closing = true;
        }

        let drain = async {
            loop {
                let notified = shared.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                let idle = {
                    let state = shared.state.lock();
                    state.queue.is_empty() || state.transport.is_none()
                };
                if idle {
                    break;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(shared.options.drain_timeout, drain).await.is_err() {
            warn!(addr = %shared.addr, pending = self.pending(), "drain timed out");
        }

        let (transport, pending) = {
            let mut state = shared.state.lock();
            (state.transport.take(), std::mem::take(&mut state.queue))
        };
        if let Some(transport) = transport {
            shared.release(transport);
        }
        for command in pending {
            command.fail(shared.closed_error());
        }
        debug!(addr = %shared.addr, kind = ?shared.options.kind, "connection closed");
    }
}

impl fmt::Debug for NodeConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConnection")
            .field("addr", &self.shared.addr)
            .field("kind", &self.shared.options.kind)
            .field("open", &self.is_open())
            .finish()
    }
}

impl NodeShared {
    async fn open(self: &Arc<Self>) -> HkvResult<()> {
        let started = Instant::now();
        let connect = TcpStream::connect(self.addr.as_str());
        let stream = match tokio::time::timeout(self.options.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(HkvError::connection_caused_by(
                    format!("unable to connect to {}", self.addr),
                    err,
                ))
            }
            Err(elapsed) => {
                return Err(HkvError::connection_caused_by(
                    format!("connect to {} timed out", self.addr),
                    elapsed,
                ))
            }
        };
        let latency = started.elapsed();
        if let Err(err) = stream.set_nodelay(true) {
            debug!(addr = %self.addr, %err, "unable to set TCP_NODELAY");
        }

        let (read_half, write_half) = stream.into_split();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let epoch = {
            let mut state = self.state.lock();
            if state.closing {
                return Err(self.closed_error());
            }
            if state.transport.is_some() {
                // Another caller reopened first; dropping the halves closes ours.
                return Ok(());
            }
            state.epoch += 1;
            let epoch = state.epoch;
            let id = self.registry.register(&self.addr, self.options.kind);
            tokio::spawn(write_frames(self.clone(), write_half, frames_rx, epoch));
            let reader = tokio::spawn(read_frames(self.clone(), read_half, epoch));
            state.transport = Some(Transport {
                id,
                epoch,
                writer: frames_tx,
                reader,
            });
            state.latency = latency;
            epoch
        };

        if let Some(name) = &self.options.client_name {
            let handle = AsyncCommand::new(commands::client_setname(name));
            self.enqueue(Arc::new(handle.clone()));
            let outcome = match tokio::time::timeout(self.options.connect_timeout, handle.wait()).await {
                Ok(result) => result.map(|_| ()),
                Err(_) => Err(HkvError::Timeout),
            };
            if let Err(err) = outcome {
                warn!(addr = %self.addr, %err, "CLIENT SETNAME failed");
                self.transport_lost(epoch, err.clone());
                return Err(err);
            }
        }

        info!(
            addr = %self.addr,
            kind = ?self.options.kind,
            latency_us = latency.as_micros() as u64,
            "connected"
        );
        Ok(())
    }

    fn enqueue(&self, command: Arc<dyn QueuedCommand>) {
        let mut frame = BytesMut::new();
        command.encode(&mut frame);

        let mut state = self.state.lock();
        let rejected = match &state.transport {
            Some(transport) if !state.closing => transport.writer.send(frame.freeze()).is_err(),
            _ => true,
        };
        if rejected {
            drop(state);
            command.fail(self.closed_error());
            return;
        }
        state.queue.push_back(command);
    }

    fn on_frame(&self, epoch: u64, frame: RespValue) -> Flow {
        if let Some(push) = &self.push {
            if let Some(message) = PushMessage::from_frame(&frame) {
                if push.send(message).is_err() {
                    debug!(addr = %self.addr, "push receiver dropped");
                }
                return Flow::Continue;
            }
        }

        let (command, drained) = {
            let mut state = self.state.lock();
            let command = state.queue.pop_front();
            (command, state.queue.is_empty())
        };
        if drained {
            self.drained.notify_waiters();
        }
        let Some(command) = command else {
            warn!(addr = %self.addr, "reply without pending command discarded");
            return Flow::Continue;
        };

        if same_keyword(command.keyword(), &CommandType::QUIT) {
            // Closed before the handle completes so a caller observing the
            // QUIT result already sees the connection as closed.
            self.transport_lost(epoch, HkvError::connection(format!("connection to {} closed by QUIT", self.addr)));
            command.on_reply(&frame);
            return Flow::Quit;
        }
        command.on_reply(&frame);
        Flow::Continue
    }

    /// Detaches the transport of `epoch` and fails everything pending.
    /// Stale epochs are ignored.
    fn transport_lost(&self, epoch: u64, reason: HkvError) {
        let (transport, pending) = {
            let mut state = self.state.lock();
            match &state.transport {
                Some(transport) if transport.epoch == epoch => {}
                _ => return,
            }
            (state.transport.take(), std::mem::take(&mut state.queue))
        };
        if let Some(transport) = transport {
            self.release(transport);
        }
        if !pending.is_empty() {
            warn!(addr = %self.addr, pending = pending.len(), %reason, "connection lost");
        } else {
            debug!(addr = %self.addr, %reason, "connection lost");
        }
        for command in pending {
            command.fail(reason.clone());
        }
        self.drained.notify_waiters();
    }

    fn release(&self, transport: Transport) {
        transport.reader.abort();
        self.registry.deregister(transport.id);
    }

    fn closed_error(&self) -> HkvError {
        HkvError::connection(format!("connection to {} is closed", self.addr))
    }
}

async fn write_frames(
    shared: Arc<NodeShared>,
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    epoch: u64,
) {
    let mut batch = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
    while let Some(frame) = frames.recv().await {
        batch.extend_from_slice(&frame);
        while let Ok(next) = frames.try_recv() {
            batch.extend_from_slice(&next);
        }
        if let Err(err) = writer.write_all(&batch).await {
            let reason = HkvError::connection_caused_by(format!("write to {} failed", shared.addr), err);
            shared.transport_lost(epoch, reason);
            return;
        }
        batch.clear();
    }
    let _ = writer.shutdown().await;
}

async fn read_frames(shared: Arc<NodeShared>, mut reader: OwnedReadHalf, epoch: u64) {
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
    let mut decoder = RespDecoder::new();
    let reason = 'read: loop {
        loop {
            match decoder.decode(&mut buffer) {
                Ok(Some(frame)) => {
                    if shared.on_frame(epoch, frame) == Flow::Quit {
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(addr = %shared.addr, %err, "malformed reply, closing connection");
                    break 'read HkvError::from(err);
                }
            }
        }
        match reader.read_buf(&mut buffer).await {
            Ok(0) => break HkvError::connection(format!("connection to {} closed by peer", shared.addr)),
            Ok(_) => {}
            Err(err) => break HkvError::connection_caused_by(format!("read from {} failed", shared.addr), err),
        }
    };
    shared.transport_lost(epoch, reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hkv_common::{StatusOutput, ValueOutput};
    use tokio::net::TcpListener;

    fn options() -> ConnectOptions {
        ConnectOptions::new(ConnectionKind::Data, Duration::from_secs(1))
    }

    #[test]
    fn recognizes_message_frames() {
        let frame = RespValue::Array(Some(vec![
            RespValue::Bulk(Some(b"message".to_vec())),
            RespValue::Bulk(Some(b"+switch-master".to_vec())),
            RespValue::Bulk(Some(b"mymaster 10.0.0.1 6379 10.0.0.2 6379".to_vec())),
        ]));
        let message = PushMessage::from_frame(&frame).unwrap();
        assert_eq!(message.channel, "+switch-master");
        assert!(message.payload.starts_with("mymaster"));
    }

    #[test]
    fn subscribe_confirmation_is_a_reply() {
        let frame = RespValue::Array(Some(vec![
            RespValue::Bulk(Some(b"subscribe".to_vec())),
            RespValue::Bulk(Some(b"+sdown".to_vec())),
            RespValue::Integer(1),
        ]));
        assert!(PushMessage::from_frame(&frame).is_none());
    }

    #[tokio::test]
    async fn pipelined_replies_complete_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();
            let mut chunk = [0u8; 256];
            // Two GET requests, 24 bytes each.
            while seen.len() < 48 {
                let n = socket.read(&mut chunk).await.unwrap();
                seen.extend_from_slice(&chunk[..n]);
            }
            socket.write_all(b"$3\r\none\r\n$3\r\ntwo\r\n").await.unwrap();
            let _ = socket.read(&mut chunk).await;
        });

        let registry = ConnectionRegistry::new();
        let conn = NodeConnection::connect(addr, options(), registry.clone(), None).await.unwrap();
        assert_eq!(registry.len(), 1);

        let first = conn.submit(commands::get("key:1"));
        let second = conn.submit(commands::get("key:2"));
        assert_eq!(second.wait().await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(first.wait().await.unwrap(), Some(b"one".to_vec()));

        conn.close().await;
        assert!(!conn.is_open());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn peer_close_fails_pending_commands() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut chunk = [0u8; 64];
            let _ = socket.read(&mut chunk).await;
        });

        let registry = ConnectionRegistry::new();
        let conn = NodeConnection::connect(addr, options(), registry.clone(), None).await.unwrap();
        let handle = conn.submit(Command::new(CommandType::GET, ValueOutput::new()));
        let result = handle.wait().await;
        assert!(matches!(result, Err(HkvError::Connection { .. })));
        assert!(!conn.is_open());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn dispatch_after_close_fails_fast() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let _held = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let conn = NodeConnection::connect(addr, options(), ConnectionRegistry::new(), None)
            .await
            .unwrap();
        conn.close().await;
        conn.close().await;
        let handle = conn.submit(Command::new(CommandType::PING, StatusOutput::new()));
        assert!(handle.is_done());
        assert!(matches!(handle.get(), Err(HkvError::Connection { .. })));
        assert!(conn.reconnect().await.is_err());
    }

    async fn spawn_pong_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut chunk = [0u8; 1024];
            loop {
                let n = match socket.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                let pings = chunk[..n].windows(4).filter(|window| *window == b"PING").count();
                for _ in 0..pings {
                    socket.write_all(b"+PONG\r\n").await.unwrap();
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn panicking_callback_keeps_reader_alive() {
        let addr = spawn_pong_server().await;
        let registry = ConnectionRegistry::new();
        let conn = NodeConnection::connect(addr, options(), registry.clone(), None).await.unwrap();

        let first = conn.submit(commands::ping());
        first.on_complete(|_| panic!("callback failure"));
        assert_eq!(first.wait().await.unwrap(), "PONG");

        let second = conn.execute(commands::ping(), Duration::from_secs(2)).await;
        assert_eq!(second.unwrap(), "PONG");
        assert!(conn.is_open());
        assert_eq!(registry.len(), 1);
        conn.close().await;
    }

    #[tokio::test]
    async fn deeply_nested_reply_fails_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut chunk = [0u8; 64];
            let _ = socket.read(&mut chunk).await;
            let _ = socket.write_all(&b"*1\r\n".repeat(100_000)).await;
            let _ = socket.read(&mut chunk).await;
        });

        let registry = ConnectionRegistry::new();
        let conn = NodeConnection::connect(addr, options(), registry.clone(), None).await.unwrap();
        let result = conn.execute(commands::ping(), Duration::from_secs(2)).await;
        assert!(matches!(result, Err(HkvError::Protocol(_))));
        assert!(!conn.is_open());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn unreachable_address_keeps_io_cause() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = NodeConnection::connect(addr, options(), ConnectionRegistry::new(), None)
            .await
            .unwrap_err();
        let cause = std::error::Error::source(&err).unwrap();
        assert!(cause.downcast_ref::<std::io::Error>().is_some());
    }
}
