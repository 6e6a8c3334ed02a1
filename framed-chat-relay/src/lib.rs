//! Length-prefixed JSON chat relay.
//!
//! A server accepts many TCP connections, gives each one a unique username
//! and relays messages either to one named user or to everyone (`"ALL"`).
//! Each module focuses on a concrete responsibility:
//!
//! - [`frame`] cuts a byte stream into `[u32 length][payload]` frames.
//! - [`envelope`] defines the JSON envelopes carried inside frames.
//! - [`session`] holds per-connection state and the buffered frame reader.
//! - [`registry`] owns usernames, sessions and the message log.
//! - [`router`] is the single task that applies connection events to the
//!   registry, so no lock is needed.
//! - [`server`] accepts TCP connections and pumps frames to and from the router.
//! - [`client`] mirrors the protocol on the connecting side and drives a terminal.
//! - [`console`] parses operator input lines.
//! - [`cli`] parses the command-line interface for server and client modes.
//!
//! Unit tests drive the router with in-memory sessions; integration tests
//! run the server over real sockets.

pub mod cli;
pub mod client;
pub mod console;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
