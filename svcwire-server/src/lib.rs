//! # svcwire-server
//!
//! Server side of svcwire.
//!
//! This crate provides:
//! - TCP connection handling with a handshake, heartbeat and idle timeout
//! - Service registry and dispatch of `Service.method` requests
//! - Event listener registry with filtered fan-out
//! - Resource proxy sessions owned by connections
//! - Streamed file uploads
//! - Token-based authentication with permissions
//! - Prometheus metrics

pub mod auth;
pub mod builtin;
pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod metrics;
pub mod resource;
pub mod server;
pub mod service;
pub mod session;
pub mod upload;

pub use auth::{Permissions, TokenValidator};
pub use config::{AuthConfig, Config, NetworkConfig, ProtocolConfig};
pub use error::ServerError;
pub use events::{EmitReport, EventRegistry};
pub use handler::CommandHandler;
pub use resource::{MemoryDriver, ResourceConnection, ResourceDriver, ResourceError, ResourceTable};
pub use server::{Server, ServerConfig};
pub use service::{
    AllOf, AnyOf, CallContext, MethodTable, PermissionPolicy, ServiceContext, ServiceDef,
    ServiceError, ServiceRegistry,
};
pub use session::{ConnectionId, Session, SessionState};
pub use upload::{FileStorage, LocalFileStorage, UploadTracker};
