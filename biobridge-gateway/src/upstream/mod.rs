//! Upstream enrollment service.
//!
//! [`EnrollmentApi`] is the raw transport: one method per upstream request,
//! each taking an explicit session. The HTTP implementation lives in
//! [`http`]; tests substitute their own.

mod error;
pub mod http;

use async_trait::async_trait;
use biobridge_core::{DeviceId, IdentityId, Template};
use reqwest::Url;

pub use error::{SessionError, UpstreamError};
pub use http::HttpEnrollmentApi;

use crate::config::Credentials;
use crate::session::Session;

/// Requests the gateway makes against the upstream service.
///
/// Implementations report an authorization rejection as
/// [`UpstreamError::Unauthorized`] so callers can re-authenticate. They do
/// not retry or time out on their own.
#[async_trait]
pub trait EnrollmentApi: Send + Sync + 'static {
    /// Log in against one endpoint, returning the session token.
    async fn login(&self, endpoint: &Url, credentials: &Credentials) -> Result<String, UpstreamError>;

    /// Create a new identity, returning its upstream id.
    async fn create_identity(
        &self,
        session: &Session,
        display_name: &str,
        external_id: &str,
    ) -> Result<IdentityId, UpstreamError>;

    /// Ask a device to capture one fingerprint sample.
    async fn capture_sample(
        &self,
        session: &Session,
        device_id: DeviceId,
        quality: u8,
    ) -> Result<Template, UpstreamError>;

    /// Returns true if the template matches an existing identity.
    async fn check_duplicate(&self, session: &Session, template: &Template) -> Result<bool, UpstreamError>;

    /// Store both templates on the identity.
    async fn commit_templates(
        &self,
        session: &Session,
        identity_id: &IdentityId,
        sample_a: &Template,
        sample_b: &Template,
    ) -> Result<(), UpstreamError>;
}
