//! Read-only status snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enrollment::EnrollmentView;
use crate::identity::DeviceId;

/// Lifecycle phase of the upstream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// No session and no login in flight.
    Unauthenticated,
    /// A login is in flight.
    Authenticating,
    /// A session is current.
    Authenticated,
    /// The last session was rejected or expired; the next acquire logs in.
    Invalidated,
}

/// Observable state of the session manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHealth {
    pub phase: SessionPhase,
    /// Endpoint of the current session.
    pub endpoint: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
    /// Failed login rounds since the last success.
    pub consecutive_failures: u32,
    /// A retry timer is outstanding.
    pub retry_scheduled: bool,
    /// Total retry timers ever scheduled.
    pub retries_scheduled: u64,
    /// Total login attempts against individual endpoints.
    pub login_attempts: u64,
}

impl SessionHealth {
    pub fn unauthenticated() -> Self {
        Self {
            phase: SessionPhase::Unauthenticated,
            endpoint: None,
            issued_at: None,
            consecutive_failures: 0,
            retry_scheduled: false,
            retries_scheduled: 0,
            login_attempts: 0,
        }
    }
}

/// Summary of one live device connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSummary {
    /// Gateway-assigned connection id.
    pub id: u64,
    pub peer: String,
    /// Learned from the first frame header.
    pub device_id: Option<DeviceId>,
    pub connected_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Current or last enrollment on this connection.
    pub enrollment: Option<EnrollmentView>,
}

/// Gateway-wide snapshot served by the control API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayStatus {
    pub listen_addr: String,
    pub connected_clients: usize,
    pub session: SessionHealth,
    pub connections: Vec<ConnectionSummary>,
}
