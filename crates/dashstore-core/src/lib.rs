//! Dashstore Core: reactive named-value repository
//!
//! A process-wide store of hierarchically named values. Values may be plain
//! data or expressions over other names; expressions recalculate when what
//! they read changes, and every change is pushed to subscribed listeners.
//!
//! # Architecture
//!
//! - **Cells**: one per name, holding a [`StoredValue`] and its listeners
//! - **Notifier**: batches changed names per listener and delivers them in
//!   dependency order
//! - **Compiled functions**: expressions that subscribe to exactly what
//!   their last evaluation read
//! - **Datafiles**: flat `name=value` text files mounted under a prefix,
//!   with inherited defaults and atomic save
//! - **Freeze engine**: snapshots sets of cells read-only while a flag is true
//! - **Workers**: notifier, realizer, freezer and saver threads
//!
//! The replication protocol that mirrors cells into other processes lives
//! in the `dashstore-remote` crate.

pub mod compiled;
pub mod config;
pub mod consistency;
pub mod datafile;
pub mod durability;
pub mod error;
pub mod freeze;
pub mod listener;
pub mod names;
pub mod notify;
pub mod persistence;
pub mod realizer;
pub mod repository;
pub mod saver;
pub mod script;
pub mod stored;
pub mod value;
pub mod worker;

// Re-export key types for convenience
pub use compiled::{CompiledFunction, Recalc};
pub use config::Config;
pub use consistency::ConsistencyObserver;
pub use error::{DataError, DataResult};
pub use freeze::{FreezeState, FrozenSet};
pub use listener::{DataEvent, DataListener, EventKind, ListenerId, RepositoryListener};
pub use names::{create_data_name, inheritable_lookup, ANONYMOUS_PREFIX};
pub use repository::{DataRepository, RepositoryStats};
pub use stored::{Former, FrozenValue, StoredValue};
pub use value::Value;
pub use worker::WorkerHandle;
