//! Dashstore replication protocol
//!
//! Mirrors repository cells into other processes over TCP. A client names a
//! datafile (by ID or path), subscribes to cells, and receives their changes
//! as batched events; it can also write, remove and create values remotely.
//!
//! # Architecture
//!
//! - [`protocol`]: line-oriented handshake and commands, JSON-line server messages
//! - [`server`]: accept thread plus one thread per session; each session is
//!   a listener on the repository
//! - [`client`]: command sender with a background reader and a local mirror

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::RepositoryClient;
pub use error::{RemoteError, RemoteResult};
pub use protocol::{Command, ServerMessage, DEFAULT_PORT, RESTORE_DEFAULT_TOKEN};
pub use server::{RepositoryServer, ServerConfig};
