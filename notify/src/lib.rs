//! Best-effort notification channel of the reading sync fabric.
//!
//! Clients register a return address over UDP, optionally scoped to a set of
//! topics, and receive a `release` datagram whenever a topic reaches a new
//! milestone. Delivery is at most once with no acknowledgment or retry.
//!
//! A user's latest registration replaces all earlier ones, even from a
//! different address. Registrations never expire on their own.

pub mod domain_event_handler;
pub mod error;
pub mod fanout;
pub mod message;
pub mod registration;
pub mod server;

pub use domain_event_handler::ReleaseEventHandler;
pub use error::Error;
pub use fanout::{DatagramSink, DeliveryReport, Notifier};
pub use registration::{Registration, RegistrationTable};
pub use server::{DatagramHandler, Server};
