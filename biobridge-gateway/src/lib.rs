//! # Biobridge Gateway
//!
//! TCP gateway between biometric capture devices and an upstream enrollment
//! service.
//!
//! - [`gateway`] - Device listener and connection registry
//! - [`connection`] - Per-connection frame handling
//! - [`orchestrator`] - Two-sample enrollment workflow
//! - [`session`] - Single upstream session with failover and bounded retry
//! - [`client`] - Typed upstream calls with one re-auth retry
//! - [`upstream`] - Upstream transport trait and its HTTP implementation
//! - [`sink`] - Persistence of enrollment outcomes
//! - [`control`] - Local JSON control API
//! - [`config`] - CLI flags and environment configuration

pub mod client;
pub mod config;
pub mod connection;
pub mod control;
pub mod gateway;
pub mod orchestrator;
pub mod session;
pub mod sink;
pub mod upstream;

pub use client::UpstreamClient;
pub use config::{Credentials, GatewayConfig, SessionConfig};
pub use connection::{ConnectionError, ConnectionId};
pub use gateway::{Gateway, GatewayError};
pub use orchestrator::Orchestrator;
pub use session::{Session, SessionManager};
pub use sink::{RecordSink, SinkError, SqliteRecordSink, TracingRecordSink};
pub use upstream::{EnrollmentApi, HttpEnrollmentApi, SessionError, UpstreamError};
