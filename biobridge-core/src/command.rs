//! Device command table and reply payloads.
//!
//! Every command code the gateway understands is declared once in
//! `define_commands!`. Unknown codes are not an error: they get a generic
//! acknowledgment.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::enrollment::{EnrollmentPhase, FailureReason};
use crate::identity::IdentityId;

macro_rules! define_commands {
    ( $( $(#[$meta:meta])* $variant:ident = $code:literal, $display:literal; )* ) => {
        /// Commands a capture device may send.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum Command {
            $( $(#[$meta])* $variant = $code, )*
        }

        impl Command {
            /// Classify a raw code. Returns `None` for unrecognized codes.
            pub fn from_code(code: u16) -> Option<Self> {
                match code {
                    $( $code => Some(Self::$variant), )*
                    _ => None,
                }
            }

            #[inline]
            pub fn code(self) -> u16 {
                self as u16
            }

            /// Name for logging.
            pub fn name(self) -> &'static str {
                match self {
                    $( Self::$variant => $display, )*
                }
            }
        }

        /// Every defined command.
        pub const KNOWN_COMMANDS: &[Command] = &[ $( Command::$variant, )* ];
    };
}

define_commands! {
    /// Status query. Answered from connection-local state.
    DeviceStatus = 0x0001, "device_status";
    /// Gateway name and version.
    DeviceInfo = 0x0002, "device_info";
    Keepalive = 0x0003, "keepalive";
    /// Begin enrolling a new identity.
    EnrollStart = 0x0010, "enroll_start";
    /// The device has a finger on the sensor; capture the next sample.
    SampleDelivered = 0x0011, "sample_delivered";
    /// The device identified someone on its own (check-in).
    IdentifyEvent = 0x0020, "identify_event";
}

impl Command {
    /// Returns true if the reply needs no upstream call.
    pub fn is_local(self) -> bool {
        matches!(self, Self::DeviceStatus | Self::DeviceInfo | Self::Keepalive)
    }
}

// ============================================================================
// Reply Payloads
// ============================================================================

/// First byte of every reply payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ReplyStatus {
    Ok = 0x00,
    Failure = 0x01,
    /// Invalid phase transition or malformed request payload.
    Rejected = 0x02,
    /// Generic acknowledgment of an unrecognized command.
    Ack = 0xFF,
}

impl ReplyStatus {
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Self::Ok),
            0x01 => Some(Self::Failure),
            0x02 => Some(Self::Rejected),
            0xFF => Some(Self::Ack),
            _ => None,
        }
    }

    /// Status for an enrollment that reached `phase` without being rejected.
    pub fn for_phase(phase: EnrollmentPhase) -> Self {
        match phase {
            EnrollmentPhase::Failed => Self::Failure,
            _ => Self::Ok,
        }
    }
}

/// `[status]`
pub fn status_reply(status: ReplyStatus) -> Bytes {
    Bytes::copy_from_slice(&[status.code()])
}

/// `[status, phase, reason]`, with `0` standing in for an absent phase or reason.
pub fn enrollment_reply(
    status: ReplyStatus,
    phase: Option<EnrollmentPhase>,
    reason: Option<FailureReason>,
) -> Bytes {
    Bytes::copy_from_slice(&[
        status.code(),
        phase.map(|p| p.code()).unwrap_or(0),
        reason.map(|r| r.code()).unwrap_or(0),
    ])
}

/// `[status]` followed by the UTF-8 gateway identification string.
pub fn device_info_reply() -> Bytes {
    let info = gateway_identification();
    let mut buf = BytesMut::with_capacity(1 + info.len());
    buf.put_u8(ReplyStatus::Ok.code());
    buf.put_slice(info.as_bytes());
    buf.freeze()
}

pub fn gateway_identification() -> String {
    format!("biobridge/{}", env!("CARGO_PKG_VERSION"))
}

/// Decoded `[status, phase, reason]` reply, for device-side tooling and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrollmentReply {
    pub status: u8,
    pub phase: u8,
    pub reason: u8,
}

impl EnrollmentReply {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        match payload {
            [status, phase, reason] => Some(Self {
                status: *status,
                phase: *phase,
                reason: *reason,
            }),
            _ => None,
        }
    }
}

// ============================================================================
// Request Payloads
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{field} must not be empty")]
    EmptyField { field: &'static str },

    #[error("expected at most {max} bytes, got {len}")]
    TooLong { len: usize, max: usize },
}

/// Payload of [`Command::EnrollStart`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollStartRequest {
    pub external_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl EnrollStartRequest {
    pub fn parse(payload: &[u8]) -> Result<Self, PayloadError> {
        let request: Self = serde_json::from_slice(payload)?;
        if request.external_id.trim().is_empty() {
            return Err(PayloadError::EmptyField {
                field: "external_id",
            });
        }
        Ok(request)
    }

    /// The display name, falling back to the external id.
    pub fn display_name(&self) -> &str {
        match self.display_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.external_id,
        }
    }
}

/// Payload of [`Command::SampleDelivered`]: an optional quality threshold byte.
pub fn parse_sample_quality(payload: &[u8]) -> Result<Option<u8>, PayloadError> {
    match payload {
        [] => Ok(None),
        [quality] => Ok(Some(*quality)),
        _ => Err(PayloadError::TooLong {
            len: payload.len(),
            max: 1,
        }),
    }
}

/// Payload of [`Command::IdentifyEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyEventRequest {
    pub identity_id: IdentityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
}

impl IdentifyEventRequest {
    pub fn parse(payload: &[u8]) -> Result<Self, PayloadError> {
        Ok(serde_json::from_slice(payload)?)
    }
}
