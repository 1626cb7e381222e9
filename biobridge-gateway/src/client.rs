//! Typed upstream operations on top of the session manager.
//!
//! Each operation acquires a session, calls the upstream with it, and on an
//! authorization rejection invalidates that session and retries exactly once
//! with a freshly acquired one. Timeouts and other failures surface as-is;
//! a timeout never invalidates the session.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use biobridge_core::{DeviceId, IdentityId, Template};

use crate::session::{Session, SessionManager};
use crate::upstream::{EnrollmentApi, UpstreamError};

#[derive(Clone)]
pub struct UpstreamClient {
    api: Arc<dyn EnrollmentApi>,
    sessions: SessionManager,
    timeout: Duration,
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl UpstreamClient {
    pub fn new(api: Arc<dyn EnrollmentApi>, sessions: SessionManager, timeout: Duration) -> Self {
        Self {
            api,
            sessions,
            timeout,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub async fn create_identity(
        &self,
        display_name: &str,
        external_id: &str,
    ) -> Result<IdentityId, UpstreamError> {
        self.call("create_identity", |api, session| async move {
            api.create_identity(&session, display_name, external_id).await
        })
        .await
    }

    pub async fn capture_sample(&self, device_id: DeviceId, quality: u8) -> Result<Template, UpstreamError> {
        self.call("capture_sample", |api, session| async move {
            api.capture_sample(&session, device_id, quality).await
        })
        .await
    }

    pub async fn check_duplicate(&self, template: &Template) -> Result<bool, UpstreamError> {
        self.call("check_duplicate", |api, session| async move {
            api.check_duplicate(&session, template).await
        })
        .await
    }

    pub async fn commit_templates(
        &self,
        identity_id: &IdentityId,
        sample_a: &Template,
        sample_b: &Template,
    ) -> Result<(), UpstreamError> {
        self.call("commit_templates", |api, session| async move {
            api.commit_templates(&session, identity_id, sample_a, sample_b)
                .await
        })
        .await
    }

    async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, UpstreamError>
    where
        F: Fn(Arc<dyn EnrollmentApi>, Arc<Session>) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let session = self.sessions.acquire().await?;

        match self.attempt(op, &f, Arc::clone(&session)).await {
            Err(UpstreamError::Unauthorized) => {
                tracing::info!(op, endpoint = %session.endpoint, "Upstream rejected session, re-authenticating");
                self.sessions.invalidate(&session);

                let fresh = self.sessions.acquire().await?;
                let result = self.attempt(op, &f, fresh).await;
                if let Err(UpstreamError::Unauthorized) = &result {
                    tracing::warn!(op, "Upstream rejected a fresh session");
                }
                result
            }
            other => other,
        }
    }

    async fn attempt<T, F, Fut>(&self, op: &'static str, f: &F, session: Arc<Session>) -> Result<T, UpstreamError>
    where
        F: Fn(Arc<dyn EnrollmentApi>, Arc<Session>) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        match tokio::time::timeout(self.timeout, f(Arc::clone(&self.api), session)).await {
            Ok(Err(UpstreamError::Http(e))) if e.is_timeout() => {
                tracing::warn!(op, timeout = ?self.timeout, "Upstream call timed out");
                Err(UpstreamError::Timeout(self.timeout))
            }
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(op, timeout = ?self.timeout, "Upstream call timed out");
                Err(UpstreamError::Timeout(self.timeout))
            }
        }
    }
}
