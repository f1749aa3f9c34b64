#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

pub const MASTER_NAME: &str = "mymaster";

static TRACING: Once = Once::new();
static NEXT_NODE_ID: AtomicUsize = AtomicUsize::new(1);

/// Installs a test-friendly subscriber once per binary. `RUST_LOG` selects
/// the level.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with_test_writer()
            .try_init();
    });
}

/// Log sink for asserting on emitted events.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Address nothing listens on.
pub fn unused_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    drop(listener);
    addr
}

/// Polls `check` until it holds or five seconds pass.
pub fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}

pub type Args = Vec<Vec<u8>>;

/// Per-connection state seen by a handler.
#[derive(Default)]
pub struct Session {
    pub client_name: Option<Vec<u8>>,
}

type Handler = Arc<dyn Fn(&mut Session, &Args, &mut Vec<u8>) + Send + Sync>;

struct Subscriber {
    channel: Vec<u8>,
    stream: Arc<Mutex<TcpStream>>,
}

/// RESP2 server on a random port. `SUBSCRIBE` and `QUIT` are built in;
/// everything else goes to the handler.
pub struct StubServer {
    pub addr: String,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl StubServer {
    fn spawn(handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let subscribers = Arc::new(Mutex::new(Vec::new()));

        let shared = subscribers.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let handler = handler.clone();
                let subscribers = shared.clone();
                thread::spawn(move || serve(stream, handler, subscribers));
            }
        });

        StubServer { addr, subscribers }
    }

    /// Sends a pub/sub message to every subscriber of `channel` and returns
    /// how many received it.
    pub fn publish(&self, channel: &str, payload: &str) -> usize {
        let mut frame = Vec::new();
        write_array_header(&mut frame, 3);
        write_bulk(&mut frame, b"message");
        write_bulk(&mut frame, channel.as_bytes());
        write_bulk(&mut frame, payload.as_bytes());

        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|subscriber| {
            if subscriber.channel != channel.as_bytes() {
                return true;
            }
            subscriber.stream.lock().unwrap().write_all(&frame).is_ok()
        });
        subscribers.iter().filter(|subscriber| subscriber.channel == channel.as_bytes()).count()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Cuts every subscribed connection, as a sentinel restart would.
    pub fn drop_subscribers(&self) {
        for subscriber in self.subscribers.lock().unwrap().drain(..) {
            let _ = subscriber.stream.lock().unwrap().shutdown(Shutdown::Both);
        }
    }
}

fn handle_client(session: &mut Session, args: &Args, out: &mut Vec<u8>) {
    match args.get(1).map(|sub| upper(sub)).as_deref() {
        Some("SETNAME") if args.len() == 3 => {
            session.client_name = Some(args[2].clone());
            write_simple(out, "OK");
        }
        Some("GETNAME") => match &session.client_name {
            Some(name) => write_bulk(out, name),
            None => out.extend_from_slice(b"$-1\r\n"),
        },
        _ => write_error(out, "ERR unknown subcommand"),
    }
}

fn serve(stream: TcpStream, handler: Handler, subscribers: Arc<Mutex<Vec<Subscriber>>>) {
    let mut reader = BufReader::new(stream.try_clone().expect("clone"));
    let writer = Arc::new(Mutex::new(stream));
    let mut session = Session::default();

    while let Ok(args) = read_command(&mut reader) {
        let verb = upper(&args[0]);
        let mut out = Vec::new();
        match verb.as_str() {
            "SUBSCRIBE" => {
                let mut subscribers = subscribers.lock().unwrap();
                for (idx, channel) in args[1..].iter().enumerate() {
                    subscribers.push(Subscriber {
                        channel: channel.clone(),
                        stream: writer.clone(),
                    });
                    write_array_header(&mut out, 3);
                    write_bulk(&mut out, b"subscribe");
                    write_bulk(&mut out, channel);
                    write_integer(&mut out, idx as i64 + 1);
                }
            }
            "QUIT" => {
                write_simple(&mut out, "OK");
                let mut stream = writer.lock().unwrap();
                let _ = stream.write_all(&out);
                let _ = stream.shutdown(Shutdown::Both);
                return;
            }
            _ => handler(&mut session, &args, &mut out),
        }
        if writer.lock().unwrap().write_all(&out).is_err() {
            return;
        }
    }
}

/// Data node answering PING, INFO, CLIENT SETNAME/GETNAME, GET, SET, DEL
/// and `DEBUG SLEEP <seconds>`.
pub struct NodeStub {
    pub server: StubServer,
    pub id: usize,
    role: Arc<Mutex<String>>,
}

impl NodeStub {
    pub fn addr(&self) -> &str {
        &self.server.addr
    }

    pub fn set_role(&self, role: &str) {
        *self.role.lock().unwrap() = role.to_string();
    }
}

pub fn spawn_node(role: &str) -> NodeStub {
    let role = Arc::new(Mutex::new(role.to_string()));
    let data: Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>> = Arc::new(Mutex::new(HashMap::new()));

    let id = NEXT_NODE_ID.fetch_add(1, Ordering::SeqCst);

    let current_role = role.clone();
    let server = StubServer::spawn(Arc::new(move |session: &mut Session, args: &Args, out: &mut Vec<u8>| {
        match upper(&args[0]).as_str() {
            "PING" => write_simple(out, "PONG"),
            "INFO" => {
                let info = format!(
                    "# Server\r\nnode_id:{}\r\n# Replication\r\nrole:{}\r\n",
                    id,
                    current_role.lock().unwrap()
                );
                write_bulk(out, info.as_bytes());
            }
            "CLIENT" => handle_client(session, args, out),
            "DEBUG" => {
                let seconds = args.get(2).and_then(|arg| String::from_utf8_lossy(arg).parse::<f64>().ok());
                match (args.get(1).map(|sub| upper(sub)).as_deref(), seconds) {
                    (Some("SLEEP"), Some(seconds)) => {
                        thread::sleep(Duration::from_secs_f64(seconds));
                        write_simple(out, "OK");
                    }
                    _ => write_error(out, "ERR unknown DEBUG subcommand"),
                }
            }
            "GET" => match data.lock().unwrap().get(&args[1]) {
                Some(value) => write_bulk(out, value),
                None => out.extend_from_slice(b"$-1\r\n"),
            },
            "SET" => {
                data.lock().unwrap().insert(args[1].clone(), args[2].clone());
                write_simple(out, "OK");
            }
            "DEL" => {
                let mut data = data.lock().unwrap();
                let removed = args[1..].iter().filter(|key| data.remove(*key).is_some()).count();
                write_integer(out, removed as i64);
            }
            other => write_error(out, &format!("ERR unknown command '{}'", other)),
        }
    }));

    NodeStub { server, id, role }
}

/// What a sentinel stub reports.
pub struct SentinelState {
    pub master: Option<String>,
    pub replicas: Vec<(String, String)>,
}

pub struct SentinelStub {
    pub server: StubServer,
    state: Arc<Mutex<SentinelState>>,
    client_names: Arc<Mutex<Vec<String>>>,
}

impl SentinelStub {
    /// Names announced with `CLIENT SETNAME`, one entry per connection.
    pub fn client_names(&self) -> Vec<String> {
        self.client_names.lock().unwrap().clone()
    }

    pub fn addr(&self) -> &str {
        &self.server.addr
    }

    pub fn set_master(&self, master: Option<&str>) {
        self.state.lock().unwrap().master = master.map(str::to_string);
    }

    /// Replaces the replica list with `(address, flags)` pairs.
    pub fn set_replicas(&self, replicas: &[(&str, &str)]) {
        self.state.lock().unwrap().replicas =
            replicas.iter().map(|(addr, flags)| (addr.to_string(), flags.to_string())).collect();
    }

    /// Publishes `+switch-master` for the monitored master.
    pub fn announce_switch(&self, old: &str, new: &str) -> usize {
        let (old_host, old_port) = split_addr(old);
        let (new_host, new_port) = split_addr(new);
        let payload = format!("{} {} {} {} {}", MASTER_NAME, old_host, old_port, new_host, new_port);
        self.server.publish("+switch-master", &payload)
    }
}

pub fn spawn_sentinel(master: Option<&str>, replicas: &[(&str, &str)]) -> SentinelStub {
    let state = Arc::new(Mutex::new(SentinelState {
        master: master.map(str::to_string),
        replicas: replicas.iter().map(|(addr, flags)| (addr.to_string(), flags.to_string())).collect(),
    }));

    let client_names = Arc::new(Mutex::new(Vec::new()));

    let shared = state.clone();
    let names = client_names.clone();
    let server = StubServer::spawn(Arc::new(move |session: &mut Session, args: &Args, out: &mut Vec<u8>| {
        match upper(&args[0]).as_str() {
            "PING" => write_simple(out, "PONG"),
            "CLIENT" => {
                handle_client(session, args, out);
                if args.get(1).map(|sub| upper(sub)).as_deref() == Some("SETNAME") {
                    if let Some(name) = &session.client_name {
                        names.lock().unwrap().push(String::from_utf8_lossy(name).into_owned());
                    }
                }
            }
            "SENTINEL" => {
                let state = shared.lock().unwrap();
                let known = args.get(2).map(|name| name.as_slice()) == Some(MASTER_NAME.as_bytes());
                match upper(&args[1]).as_str() {
                    "GET-MASTER-ADDR-BY-NAME" => match (&state.master, known) {
                        (Some(master), true) => {
                            let (host, port) = split_addr(master);
                            write_array_header(out, 2);
                            write_bulk(out, host.as_bytes());
                            write_bulk(out, port.as_bytes());
                        }
                        _ => out.extend_from_slice(b"*-1\r\n"),
                    },
                    "SLAVES" | "REPLICAS" => {
                        let replicas: &[(String, String)] = if known { &state.replicas } else { &[] };
                        write_array_header(out, replicas.len());
                        for (addr, flags) in replicas {
                            let (host, port) = split_addr(addr);
                            write_array_header(out, 8);
                            for (field, value) in [("name", addr.as_str()), ("ip", host), ("port", port), ("flags", flags.as_str())] {
                                write_bulk(out, field.as_bytes());
                                write_bulk(out, value.as_bytes());
                            }
                        }
                    }
                    _ => write_error(out, "ERR unknown sentinel subcommand"),
                }
            }
            other => write_error(out, &format!("ERR unknown command '{}'", other)),
        }
    }));

    SentinelStub {
        server,
        state,
        client_names,
    }
}

fn split_addr(addr: &str) -> (&str, &str) {
    addr.rsplit_once(':').expect("host:port")
}

fn upper(data: &[u8]) -> String {
    String::from_utf8_lossy(data).to_ascii_uppercase()
}

fn read_command(reader: &mut BufReader<TcpStream>) -> std::io::Result<Vec<Vec<u8>>> {
    let mut line = Vec::new();
    read_line(reader, &mut line)?.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"))?;
    if line.first() != Some(&b'*') {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected array"));
    }
    let count = parse_usize(&line[1..])?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        read_line(reader, &mut line)?.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"))?;
        if line.first() != Some(&b'$') {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected bulk"));
        }
        let len = parse_usize(&line[1..])?;
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf)?;
        if crlf != [b'\r', b'\n'] {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "missing crlf"));
        }
        args.push(data);
    }
    if args.is_empty() {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "empty command"));
    }
    Ok(args)
}

fn read_line(reader: &mut BufReader<TcpStream>, buf: &mut Vec<u8>) -> std::io::Result<Option<()>> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Ok(None);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid line"));
    }
    buf.truncate(buf.len() - 2);
    Ok(Some(()))
}

fn parse_usize(data: &[u8]) -> std::io::Result<usize> {
    if data.is_empty() {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "empty"));
    }
    let mut value = 0usize;
    for &b in data {
        if !b.is_ascii_digit() {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "digit"));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as usize);
    }
    Ok(value)
}

fn write_simple(out: &mut Vec<u8>, msg: &str) {
    out.extend_from_slice(b"+");
    out.extend_from_slice(msg.as_bytes());
    out.extend_from_slice(b"\r\n");
}

fn write_error(out: &mut Vec<u8>, msg: &str) {
    out.extend_from_slice(b"-");
    out.extend_from_slice(msg.as_bytes());
    out.extend_from_slice(b"\r\n");
}

fn write_bulk(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(b"$");
    out.extend_from_slice(data.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

fn write_integer(out: &mut Vec<u8>, value: i64) {
    out.extend_from_slice(b":");
    out.extend_from_slice(value.to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
}

fn write_array_header(out: &mut Vec<u8>, count: usize) {
    out.extend_from_slice(b"*");
    out.extend_from_slice(count.to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
}
