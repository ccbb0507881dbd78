//! Reliable progress channel of the reading sync fabric.
//!
//! Clients hold a long-lived TCP connection, authenticate with a single
//! `auth` record and then exchange newline-delimited JSON `progress` records.
//! Every accepted update is fanned out to all live connections of the same
//! user, including the one it came from.
//!
//! # Architecture
//!
//! - **Multiple sessions per user**: a user may be connected from several
//!   devices at once; each connection gets its own server-generated id.
//! - **Dual-index registry**: `SessionRegistry` keeps connections by id and a
//!   user index for routing, with an atomic global capacity limit.
//! - **Single dispatch funnel**: connection handlers and the API layer both
//!   enqueue into one bounded queue drained by one worker, which gives
//!   per-user FIFO delivery and backpressure instead of drops.
//! - **Ephemeral delivery**: a user with no live connections simply misses
//!   the update.
//!
//! # Modules
//!
//! - `connection`: `ConnectionHandle` and `SessionRegistry`
//! - `dispatcher`: queue, worker and fan-out
//! - `handler`: per-connection state machine
//! - `server`: accept loop and graceful shutdown
//! - `message`: wire records
//! - `domain_event_handler`: bridge from `events::DomainEvent`

pub mod connection;
pub mod dispatcher;
pub mod domain_event_handler;
pub mod error;
pub mod handler;
pub mod message;
pub mod server;

pub use connection::{ConnectionHandle, ConnectionId, SessionRegistry};
pub use dispatcher::{DeliveryReport, Dispatcher};
pub use domain_event_handler::ProgressEventHandler;
pub use error::Error;
pub use server::Server;
