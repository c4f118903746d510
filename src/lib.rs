//! shoal: a federated asynchronous client for pools of independent
//! Redis-compatible servers.
//!
//! A [`Client`] fronts many backends behind one logical interface:
//! commands are routed by consistent hash of their key (or caller-supplied
//! group) to exactly one node, dead backends fail fast behind an
//! exponential-backoff retry gate with multi-address failover, and batches
//! of dispatched commands are awaited with a single [`Client::poll`]
//! barrier bounded by a per-batch timeout.

pub mod backend;
pub mod book;
pub mod client;
pub mod command;
pub mod config;
pub mod health;
pub mod protocol;
pub mod registry;
pub mod ring;
mod share;

pub use book::Callback;
pub use client::Client;
pub use command::{arg, Command};
pub use config::{ClientConfig, NodeConfig};
pub use protocol::{Reply, RespCodec};
pub use registry::Addr;
