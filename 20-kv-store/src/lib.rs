//! Networked key-value store with multiplexed client sessions.
//!
//! One TCP connection per client carries a tagged binary protocol. The server
//! keeps a shared in-memory map and caps how many users may be logged in at
//! once; logins beyond the cap wait in arrival order. Clients may keep many
//! requests in flight on one connection, including conditional reads that
//! only complete once another client writes a matching value.
//!
//! - [`frame`] encodes and decodes the wire format.
//! - [`connection`] wraps a stream with locked reads and writes.
//! - [`demux`] routes incoming frames to whichever caller waits on their tag.
//! - [`store`] and [`session`] hold the server's shared state.
//! - [`protocol`] maps frames to typed requests and replies.
//! - [`server`] accepts connections and dispatches requests.
//! - [`client`] is the async client library; [`console`] and [`cli`] drive it
//!   from the command line.

pub mod cli;
pub mod client;
pub mod connection;
pub mod console;
pub mod demux;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod server;
pub mod session;
pub mod store;

pub use client::{Client, GetWhenCallback};
pub use error::{Error, Result};
pub use server::{Server, ServerConfig};
pub use session::{AuthError, SessionManager};
pub use store::KvStore;
