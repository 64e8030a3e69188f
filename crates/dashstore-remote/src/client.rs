//! TCP replication client
//!
//! Connects to a [`RepositoryServer`](crate::server::RepositoryServer),
//! sends commands on the calling thread and reads server messages on a
//! background thread. Every event received updates a local mirror of the
//! subscribed values and is also queued for [`RepositoryClient::next_events`].

use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dashstore_core::{DataEvent, Value};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{RemoteError, RemoteResult};
use crate::protocol::{Command, Handshake, ServerMessage, Welcome, LOG_LINE_SEPARATOR, RESTORE_DEFAULT_TOKEN};

type Mirror = Arc<Mutex<BTreeMap<String, Option<Value>>>>;

/// A connection to a replication server.
pub struct RepositoryClient {
    stream: TcpStream,
    writer: Mutex<BufWriter<TcpStream>>,
    welcome: Welcome,
    mirror: Mirror,
    events: Mutex<Receiver<Vec<DataEvent>>>,
    names: Mutex<Receiver<Vec<String>>>,
    connected: Arc<AtomicBool>,
    reader: Option<thread::JoinHandle<()>>,
}

impl RepositoryClient {
    /// Connect and greet. `id` is a datafile ID or an absolute path;
    /// `required_tag` may be empty. Fails with `Forbidden` when the server
    /// reports the tag missing.
    pub fn connect(addr: impl ToSocketAddrs, id: &str, required_tag: &str) -> RemoteResult<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = BufWriter::new(stream.try_clone()?);

        Handshake { id: id.to_string(), required_tag: required_tag.to_string() }.write_to(&mut writer)?;
        let welcome = Welcome::read_from(&mut reader)?;
        if !welcome.tag_present {
            let _ = Command::Quit.write_to(&mut writer);
            let _ = stream.shutdown(Shutdown::Both);
            return Err(RemoteError::Forbidden { path: welcome.data_path, tag: required_tag.to_string() });
        }

        let mirror: Mirror = Arc::new(Mutex::new(BTreeMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let (events_tx, events_rx) = mpsc::channel();
        let (names_tx, names_rx) = mpsc::channel();

        let reader_mirror = Arc::clone(&mirror);
        let reader_connected = Arc::clone(&connected);
        let reader = thread::Builder::new().name("dashstore-client".to_string()).spawn(move || {
            loop {
                match ServerMessage::read_from(&mut reader) {
                    Ok(Some(ServerMessage::Events(batch))) => {
                        {
                            let mut mirror = reader_mirror.lock();
                            for event in &batch {
                                mirror.insert(event.name.clone(), event.value.clone());
                            }
                        }
                        let _ = events_tx.send(batch);
                    }
                    Ok(Some(ServerMessage::Names(names))) => {
                        let _ = names_tx.send(names);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        if !e.is_disconnect() && reader_connected.load(Ordering::Acquire) {
                            warn!("[client] connection lost: {}", e);
                        }
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::Release);
            debug!("[client] reader finished");
        })?;

        Ok(Self {
            stream,
            writer: Mutex::new(writer),
            welcome,
            mirror,
            events: Mutex::new(events_rx),
            names: Mutex::new(names_rx),
            connected,
            reader: Some(reader),
        })
    }

    /// Data path the server resolved for this client.
    pub fn data_path(&self) -> &str {
        &self.welcome.data_path
    }

    pub fn settings(&self) -> &BTreeMap<String, String> {
        &self.welcome.settings
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn send(&self, command: Command) -> RemoteResult<()> {
        if !self.is_connected() {
            return Err(RemoteError::Disconnected);
        }
        command.write_to(&mut *self.writer.lock())
    }

    pub fn put_value(&self, name: &str, value: &Value) -> RemoteResult<()> {
        self.send(Command::PutValue { name: name.to_string(), value: value.wire_string() })
    }

    /// Write raw datafile text, e.g. an expression.
    pub fn put_text(&self, name: &str, text: &str) -> RemoteResult<()> {
        self.send(Command::PutValue { name: name.to_string(), value: text.to_string() })
    }

    /// Ask the server to put the inherited default back.
    pub fn restore_default(&self, name: &str) -> RemoteResult<()> {
        self.put_text(name, RESTORE_DEFAULT_TOKEN)
    }

    pub fn remove_value(&self, name: &str) -> RemoteResult<()> {
        self.send(Command::RemoveValue { name: name.to_string() })
    }

    pub fn maybe_create_value(&self, name: &str, text: &str, prefix: &str) -> RemoteResult<()> {
        self.send(Command::MaybeCreateValue { name: name.to_string(), value: text.to_string(), prefix: prefix.to_string() })
    }

    pub fn add_data_listener(&self, name: &str) -> RemoteResult<()> {
        self.send(Command::AddDataListener { name: name.to_string() })
    }

    pub fn remove_data_listener(&self, name: &str) -> RemoteResult<()> {
        self.mirror.lock().remove(name);
        self.send(Command::RemoveDataListener { name: name.to_string() })
    }

    /// Names with values under `prefix`, as the server sees them.
    pub fn list_data_names(&self, prefix: &str, timeout: Duration) -> RemoteResult<Vec<String>> {
        let names = self.names.lock();
        self.send(Command::ListDataNames { prefix: prefix.to_string() })?;
        match names.recv_timeout(timeout) {
            Ok(list) => Ok(list),
            Err(RecvTimeoutError::Timeout) => Err(RemoteError::Protocol("no reply to listDataNames".into())),
            Err(RecvTimeoutError::Disconnected) => Err(RemoteError::Disconnected),
        }
    }

    /// Send text to the server log. Newlines become separate log lines.
    pub fn log_message(&self, text: &str) -> RemoteResult<()> {
        let text: String = text.chars().map(|c| if c == '\n' { LOG_LINE_SEPARATOR } else { c }).collect();
        self.send(Command::LogMessage { text })
    }

    /// Last value received for `name`. `None` if nothing arrived yet;
    /// `Some(None)` if the server reported it null.
    pub fn value(&self, name: &str) -> Option<Option<Value>> {
        self.mirror.lock().get(name).cloned()
    }

    /// Next event batch, waiting up to `timeout`.
    pub fn next_events(&self, timeout: Duration) -> Option<Vec<DataEvent>> {
        self.events.lock().recv_timeout(timeout).ok()
    }

    /// Wait until the mirrored value of `name` satisfies `check`.
    pub fn wait_for(&self, name: &str, timeout: Duration, check: impl Fn(Option<&Value>) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = self.value(name) {
                if check(value.as_ref()) {
                    return true;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            // drain one batch so the channel does not grow unbounded
            let _ = self.events.lock().recv_timeout((deadline - now).min(Duration::from_millis(50)));
        }
    }

    /// Say goodbye and close.
    pub fn quit(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if self.is_connected() {
            let _ = Command::Quit.write_to(&mut *self.writer.lock());
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl Drop for RepositoryClient {
    fn drop(&mut self) {
        self.close();
    }
}
