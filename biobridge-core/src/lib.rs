//! # Biobridge Core
//!
//! Pure domain types and protocol logic for the biobridge device gateway.
//!
//! ## Design Principles
//!
//! This crate is intentionally **IO-free**:
//! - No sockets or HTTP calls
//! - No filesystem or database access
//! - No logging
//!
//! Everything here is a plain Rust type or a synchronous function. The
//! gateway daemon (`biobridge-gateway`) owns all IO: device sockets, the
//! upstream enrollment service, and persistence.
//!
//! ## Modules
//!
//! - [`frame`] - Device wire frames and incremental reassembly
//! - [`command`] - Command code table and reply payloads
//! - [`enrollment`] - Enrollment workflow state machine
//! - [`identity`] - Device and identity identifiers, biometric templates
//! - [`record`] - Records handed to the persistence collaborator
//! - [`status`] - Read-only status snapshots (session health, connections)

pub mod command;
pub mod enrollment;
pub mod frame;
pub mod identity;
pub mod record;
pub mod status;

pub use command::{Command, ReplyStatus};
pub use enrollment::{
    Enrollment, EnrollmentEvent, EnrollmentEventKind, EnrollmentPhase, EnrollmentView,
    FailureReason, InvalidPhaseTransition,
};
pub use frame::{Decoded, Frame, FrameBuffer, FrameError};
pub use identity::{DeviceId, IdentityId, Template};
pub use record::{EnrollmentRecord, RecordOutcome};
pub use status::{ConnectionSummary, GatewayStatus, SessionHealth, SessionPhase};
