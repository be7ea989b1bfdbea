//! Line-oriented TCP chat relay.
//!
//! Clients connect, send a display name on the first line, and from then on
//! every line they send is relayed to everyone else as `name: line`. Sending
//! `exit` (any case) leaves the chat.
//!
//! - [`registry`] keeps the live connections and hands out snapshots for
//!   fan-out without holding its lock across network writes.
//! - [`coordinator`] owns the listener, spawns one task per connection and
//!   implements broadcast, stop and shutdown.
//! - [`connection`] is a single client's session: id, display name, state
//!   and its serialized write end.
//! - [`protocol`] has the line framing helpers and the notice texts.
//! - [`config`] and [`cli`] describe where and how the relay listens.
//!
//! The binary in `main.rs` only wires these together with logging and
//! Ctrl-C handling.

pub mod cli;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod registry;

pub use config::ServerConfig;
pub use coordinator::{BroadcastReport, Coordinator, CoordinatorHandle};
pub use error::RelayError;
