//! wolfdoc - Replica Set Connection Core
//!
//! The connection layer of a document database client: it discovers the
//! members of a replica set, keeps per-server socket pools, and hands out
//! sockets to sessions according to their consistency mode.
//!
//! # Architecture
//!
//! A [`Cluster`] runs a background sync loop that probes every known address
//! with an `isMaster` handshake and keeps the set of live servers and masters
//! current. Each [`Server`] owns a socket pool and a pinger that tracks round
//! trip times. A [`Socket`] multiplexes requests over one TCP connection and
//! routes replies back by request id. A [`Session`] pins sockets according to
//! its [`Mode`] and replays credentials onto them.
//!
//! # Features
//!
//! - Topology discovery from seeds with set-name validation
//! - Read preference modes with tag sets and latency-aware selection
//! - Per-server socket pools with limits and abend tracking
//! - Pipelined requests with per-socket timeouts
//! - Lazy credential login and deferred logout

pub mod auth;
pub mod cluster;
pub mod command;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod server;
pub mod session;
pub mod socket;
pub mod window;
pub mod wire;

#[cfg(test)]
pub(crate) mod mock;

pub use cluster::Cluster;
pub use config::{DialInfo, WolfdocConfig};
pub use error::{Error, Result};
pub use server::Server;
pub use session::{dial, dial_with, dial_with_info, dial_with_timeout, Mode, Session};
pub use socket::Socket;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::auth::{Authenticator, Credential};
    pub use crate::cluster::{Cluster, ClusterSummary};
    pub use crate::command::{Command, CommandReply};
    pub use crate::config::{DialInfo, WolfdocConfig};
    pub use crate::diagnostics::{Diagnostics, Stats};
    pub use crate::error::{Error, Result};
    pub use crate::server::ServerTags;
    pub use crate::session::{dial, dial_with_info, Mode, Session};
    pub use crate::wire::{Op, QueryOp, Reply};
}
