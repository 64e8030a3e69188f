//! TCP replication server
//!
//! One accept thread plus one thread per client session. Each session is a
//! [`DataListener`] on the repository: the names a client subscribes to are
//! pushed back to it as [`ServerMessage::Events`] batches. When the session
//! ends, for whatever reason, its listener is deleted from every cell.

use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use dashstore_core::names::parent;
use dashstore_core::{create_data_name, DataEvent, DataListener, DataRepository, ListenerId, StoredValue, Value};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{RemoteError, RemoteResult};
use crate::protocol::{
    percent_decode, Command, Handshake, ServerMessage, Welcome, ANONYMOUS_PATH, DEFAULT_PORT, LOG_LINE_SEPARATOR,
    RESTORE_DEFAULT_TOKEN,
};

/// Pause between polls of the non-blocking accept socket.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Clients must greet within this long.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on; port 0 picks a free port
    pub bind_addr: String,
    /// Sent to every client after the handshake
    pub settings: BTreeMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_addr: format!("127.0.0.1:{}", DEFAULT_PORT), settings: BTreeMap::new() }
    }
}

struct Shared {
    repo: Arc<DataRepository>,
    settings: BTreeMap<String, String>,
    sessions: Mutex<Vec<Arc<Session>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    shutdown: AtomicBool,
}

/// One connected client.
struct Session {
    data_path: String,
    stream: TcpStream,
    writer: Mutex<BufWriter<TcpStream>>,
    running: AtomicBool,
    repo: Weak<DataRepository>,
}

impl Session {
    fn send(&self, message: &ServerMessage) -> RemoteResult<()> {
        message.write_to(&mut *self.writer.lock())
    }

    /// A null value whose cell cannot be edited goes out as empty text.
    fn redact(&self, repo: &DataRepository, event: &DataEvent) -> DataEvent {
        if event.value.is_none() {
            if let Some(stored) = repo.get_value(&event.name) {
                if !stored.is_editable() {
                    return DataEvent { value: Some(Value::text("").with_editable(false)), ..event.clone() };
                }
            }
        }
        event.clone()
    }

    fn close(&self) {
        self.running.store(false, Ordering::Release);
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl DataListener for Session {
    fn data_values_changed(&self, events: &[DataEvent]) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let Some(repo) = self.repo.upgrade() else { return };
        let events: Vec<DataEvent> = events.iter().map(|e| self.redact(&repo, e)).collect();
        if let Err(e) = self.send(&ServerMessage::Events(events)) {
            debug!("[server] dropping {}: {}", self.data_path, e);
            self.close();
        }
    }
}

/// Handle to a running replication server.
/// Dropping it stops the accept thread and closes every session.
pub struct RepositoryServer {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    accept: Option<thread::JoinHandle<()>>,
}

impl RepositoryServer {
    /// Bind and start accepting clients.
    pub fn start(repo: Arc<DataRepository>, config: ServerConfig) -> RemoteResult<Self> {
        let listener = TcpListener::bind(&config.bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            repo,
            settings: config.settings,
            sessions: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        });

        let accept_shared = Arc::clone(&shared);
        let accept = thread::Builder::new()
            .name("dashstore-accept".to_string())
            .spawn(move || accept_loop(listener, accept_shared))?;
        info!("[server] listening on {}", local_addr);
        Ok(Self { local_addr, shared, accept: Some(accept) })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Number of live client sessions.
    pub fn connection_count(&self) -> usize {
        self.shared.sessions.lock().len()
    }

    /// Disconnect every client whose data path is `prefix`. Used when the
    /// datafile behind that path is closed.
    pub fn close_connections_for(&self, prefix: &str) -> usize {
        let sessions: Vec<Arc<Session>> =
            self.shared.sessions.lock().iter().filter(|s| s.data_path == prefix).cloned().collect();
        for session in &sessions {
            session.close();
        }
        sessions.len()
    }

    /// Block until the accept thread exits.
    pub fn wait(mut self) {
        if let Some(handle) = self.accept.take() {
            let _ = handle.join();
        }
    }

    /// Stop accepting, close every session and wait for their threads.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.accept.take() {
            let _ = handle.join();
        }
        let sessions: Vec<Arc<Session>> = self.shared.sessions.lock().clone();
        for session in sessions {
            session.close();
        }
        let threads: Vec<thread::JoinHandle<()>> = std::mem::take(&mut *self.shared.threads.lock());
        for handle in threads {
            let _ = handle.join();
        }
    }
}

impl Drop for RepositoryServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    while !shared.shutdown.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("[server] connection from {}", peer);
                let session_shared = Arc::clone(&shared);
                let spawned = thread::Builder::new().name("dashstore-session".to_string()).spawn(move || {
                    if let Err(e) = serve(&session_shared, stream) {
                        if !e.is_disconnect() {
                            warn!("[server] session from {} ended: {}", peer, e);
                        }
                    }
                });
                match spawned {
                    Ok(handle) => {
                        let mut threads = shared.threads.lock();
                        threads.retain(|h| !h.is_finished());
                        threads.push(handle);
                    }
                    Err(e) => warn!("[server] could not start session thread: {}", e),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                warn!("[server] accept failed: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// Map a client ID to a data path: absolute IDs are percent-decoded paths,
/// anything else is looked up among the datafile IDs.
fn resolve_path(repo: &DataRepository, id: &str) -> String {
    if id.starts_with('/') {
        return percent_decode(id);
    }
    repo.get_path(id).unwrap_or_else(|| ANONYMOUS_PATH.to_string())
}

fn serve(shared: &Shared, stream: TcpStream) -> RemoteResult<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    let repo = &shared.repo;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream.try_clone()?);

    let hello = Handshake::read_from(&mut reader)?;
    let data_path = resolve_path(repo, &hello.id);
    let tag_present = hello.required_tag.is_empty()
        || repo
            .get_simple_value(&create_data_name(Some(&data_path), &hello.required_tag))
            .is_some_and(|v| v.test());
    Welcome { data_path: data_path.clone(), tag_present, settings: shared.settings.clone() }.write_to(&mut writer)?;
    stream.set_read_timeout(None)?;

    let session = Arc::new(Session {
        data_path,
        stream,
        writer: Mutex::new(writer),
        running: AtomicBool::new(true),
        repo: Arc::downgrade(repo),
    });
    let id = repo.register_listener(Arc::clone(&session) as Arc<dyn DataListener>);
    shared.sessions.lock().push(Arc::clone(&session));
    info!("[server] client connected for {}", session.data_path);

    let result = run_commands(repo, &session, id, &mut reader);

    session.close();
    repo.delete_data_listener(id);
    shared.sessions.lock().retain(|s| !Arc::ptr_eq(s, &session));
    info!("[server] client for {} disconnected", session.data_path);
    result
}

fn run_commands(
    repo: &DataRepository,
    session: &Session,
    id: ListenerId,
    reader: &mut BufReader<TcpStream>,
) -> RemoteResult<()> {
    while session.running.load(Ordering::Acquire) {
        let command = match Command::read_from(reader) {
            Ok(Some(command)) => command,
            Ok(None) => return Ok(()),
            Err(e) if !session.running.load(Ordering::Acquire) => {
                debug!("[server] read after close: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        match command {
            Command::Quit => return Ok(()),
            Command::PutValue { name, value } if value == RESTORE_DEFAULT_TOKEN => repo.restore_default_value(&name),
            Command::PutValue { name, value } => put_from_client(repo, &name, &value),
            Command::RemoveValue { name } => repo.remove_value(&name),
            Command::MaybeCreateValue { name, value, prefix } => repo.maybe_create_value(&name, &value, &prefix),
            Command::AddDataListener { name } => repo.add_data_listener(&name, id),
            Command::RemoveDataListener { name } => repo.remove_data_listener(&name, id),
            Command::ListDataNames { prefix } => {
                session.send(&ServerMessage::Names(repo.list_data_names(&prefix)))?;
            }
            Command::LogMessage { text } => {
                for line in text.split(LOG_LINE_SEPARATOR) {
                    info!("[server] {}: {}", session.data_path, line);
                }
            }
        }
    }
    Err(RemoteError::Disconnected)
}

/// Apply a client write. Read-only cells are refused, and frozen envelopes
/// are only ever written by the freeze engine.
fn put_from_client(repo: &DataRepository, name: &str, text: &str) {
    if let Some(existing) = repo.get_value(name) {
        if !existing.is_editable() {
            warn!("[server] refusing to overwrite read-only value {}", name);
            return;
        }
    }
    match repo.stored_from_text(name, text, parent(name)) {
        None => repo.remove_value(name),
        Some(StoredValue::Frozen(_)) | Some(StoredValue::Malformed(_)) => {
            warn!("[server] ignoring value for {}: {:?}", name, text);
        }
        Some(value) => repo.put_value(name, Some(value)),
    }
}
