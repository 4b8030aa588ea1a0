//! Raft consensus over UDP, with a replicated key-value store on top.
//!
//! Based on:
//! - "In Search of an Understandable Consensus Algorithm" (Ongaro & Ousterhout)
//! - Diego Ongaro's PhD dissertation
//!
//! [`Node`] is the protocol core: it consumes one [`Event`] at a time and
//! returns the [`Action`]s to perform, without touching sockets or clocks.
//! [`Server`] drives a node with worker threads and a UDP transport.

pub mod action;
pub mod client;
pub mod client_api;
pub mod codec;
pub mod config;
pub mod error;
pub mod file_storage;
pub mod kv;
pub mod log;
pub mod node;
pub mod runtime;
pub mod server;
pub mod state;
pub mod storage;
pub mod timer;
pub mod transport;
pub mod types;
pub mod worker;

#[cfg(test)]
mod sim;

pub use action::Action;
pub use client::{Client, ClientError};
pub use config::Config;
pub use error::{Error, Result};
pub use file_storage::FileStorage;
pub use kv::{KvCommand, KvQuery, KvResult, KvStore};
pub use log::LogContainer;
pub use node::Node;
pub use runtime::{Event, ReplyTo, StateMachine};
pub use server::{Server, ServerError, ServerHandle, SubmitError};
pub use state::Role;
pub use storage::{MemoryStorage, Persistence, StorageError};
pub use types::{Cluster, LogIndex, NodeId, Term};
