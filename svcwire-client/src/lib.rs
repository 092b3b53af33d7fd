//! # svcwire-client
//!
//! Client library for svcwire.
//!
//! This crate provides:
//! - Async TCP client multiplexing many requests over one connection
//! - Event listeners that survive reconnects
//! - Automatic reconnection with exponential backoff
//! - File uploads with per-fragment acknowledgement
//! - Handles for proxied server-side resource sessions

pub mod client;
pub mod connection;
pub mod error;
pub mod events;
pub mod pending;

pub use client::{Client, RemoteResource};
pub use connection::{
    Connection, ConnectionConfig, ConnectionState, ReconnectPolicy, TransferDirection,
    TransferProgress,
};
pub use error::ClientError;
pub use events::{EventBus, EventSubscription, Registration};
pub use pending::{PendingTable, Waiter};
