//! Errors surfaced by upstream calls.

use std::time::Duration;

use thiserror::Error;

/// Why the session manager could not provide a session.
///
/// `Clone` so one login outcome can be handed to every waiting caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Every candidate endpoint rejected or failed the login.
    #[error("login failed on all {attempts} endpoints (last error: {last_error})")]
    AllEndpointsFailed { attempts: usize, last_error: String },

    /// A background retry is pending; callers fail fast until it runs.
    #[error("upstream login backing off, next attempt in {retry_in:?}")]
    BackingOff { retry_in: Duration },

    #[error("no upstream endpoints configured")]
    NoEndpoints,

    /// The login task ended without reporting a result.
    #[error("login task aborted")]
    LoginAborted,
}

/// Errors from a single upstream operation.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The upstream rejected the session token (HTTP 401).
    #[error("authorization rejected by upstream")]
    Unauthorized,

    /// The call did not finish within the request timeout.
    #[error("upstream call timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status other than 401.
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The response could not be interpreted.
    #[error("invalid upstream response: {0}")]
    Decode(String),

    /// No session could be obtained for the call.
    #[error("no upstream session: {0}")]
    Session(#[from] SessionError),
}

impl UpstreamError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }

    /// True when the call never reached the upstream for lack of a session.
    pub fn is_session_unavailable(&self) -> bool {
        matches!(self, Self::Session(_))
    }
}
