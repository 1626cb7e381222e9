//! HTTP transport for a BioStar 2 style upstream.
//!
//! Every authenticated request carries the session token in the
//! `bs-session-id` header; login returns it in the same response header.
//! HTTP 401 on any request means the token was rejected.

use std::time::Duration;

use async_trait::async_trait;
use biobridge_core::{DeviceId, IdentityId, Template};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::json;

use super::{EnrollmentApi, UpstreamError};
use crate::config::Credentials;
use crate::session::Session;

/// Header carrying the upstream session token.
pub const SESSION_HEADER: &str = "bs-session-id";

/// reqwest-backed [`EnrollmentApi`].
#[derive(Clone, Debug)]
pub struct HttpEnrollmentApi {
    http: reqwest::Client,
}

impl HttpEnrollmentApi {
    /// Build a client whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(biobridge_core::command::gateway_identification())
            .build()?;
        Ok(Self { http })
    }
}

fn api_url(endpoint: &Url, path: &str) -> String {
    format!("{}/api/{}", endpoint.as_str().trim_end_matches('/'), path)
}

/// Map 401 and other non-success statuses to errors.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(UpstreamError::Unauthorized);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(UpstreamError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct CreateUserResponse {
    #[serde(rename = "User")]
    user: UserRef,
}

#[derive(Debug, Deserialize)]
struct UserRef {
    id: IdentityId,
}

#[derive(Debug, Deserialize)]
struct ScanResponse {
    data: ScanData,
}

#[derive(Debug, Deserialize)]
struct ScanData {
    template0: String,
}

#[async_trait]
impl EnrollmentApi for HttpEnrollmentApi {
    async fn login(&self, endpoint: &Url, credentials: &Credentials) -> Result<String, UpstreamError> {
        let response = self
            .http
            .post(api_url(endpoint, "login"))
            .json(&json!({
                "User": {
                    "login_id": credentials.login_id,
                    "password": credentials.password,
                }
            }))
            .send()
            .await?;
        let response = check_status(response).await?;

        let token = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| UpstreamError::Decode(format!("login response has no {} header", SESSION_HEADER)))?;

        Ok(token.to_string())
    }

    async fn create_identity(
        &self,
        session: &Session,
        display_name: &str,
        external_id: &str,
    ) -> Result<IdentityId, UpstreamError> {
        let response = self
            .http
            .post(api_url(&session.endpoint, "users"))
            .header(SESSION_HEADER, &session.token)
            .json(&json!({
                "User": {
                    "name": display_name,
                    "user_id": external_id,
                }
            }))
            .send()
            .await?;
        let response = check_status(response).await?;

        let body: CreateUserResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Decode(format!("create user: {}", e)))?;
        Ok(body.user.id)
    }

    async fn capture_sample(
        &self,
        session: &Session,
        device_id: DeviceId,
        quality: u8,
    ) -> Result<Template, UpstreamError> {
        let response = self
            .http
            .post(api_url(
                &session.endpoint,
                &format!("devices/{}/scan_fingerprint", device_id),
            ))
            .header(SESSION_HEADER, &session.token)
            .json(&json!({
                "enroll_quality": quality,
                "raw_image": false,
            }))
            .send()
            .await?;
        let response = check_status(response).await?;

        let body: ScanResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Decode(format!("scan fingerprint: {}", e)))?;
        Template::from_base64(&body.data.template0)
            .map_err(|e| UpstreamError::Decode(format!("template0 is not base64: {}", e)))
    }

    async fn check_duplicate(&self, session: &Session, template: &Template) -> Result<bool, UpstreamError> {
        let response = self
            .http
            .post(api_url(&session.endpoint, "server_matching/identify_finger"))
            .header(SESSION_HEADER, &session.token)
            .json(&json!({ "template": template.to_base64() }))
            .send()
            .await?;

        // A match is a successful identify; "no match" comes back as 404.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status(response).await?;
        Ok(true)
    }

    async fn commit_templates(
        &self,
        session: &Session,
        identity_id: &IdentityId,
        sample_a: &Template,
        sample_b: &Template,
    ) -> Result<(), UpstreamError> {
        let response = self
            .http
            .put(api_url(&session.endpoint, &format!("users/{}", identity_id)))
            .header(SESSION_HEADER, &session.token)
            .json(&json!({
                "fingerprint_templates": [{
                    "template0": sample_a.to_base64(),
                    "template1": sample_b.to_base64(),
                    "isNew": true,
                }]
            }))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}
