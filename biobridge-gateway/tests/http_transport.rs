//! HTTP transport request/response shapes against a mock upstream.

use std::time::Duration;

use biobridge_core::{DeviceId, IdentityId, Template};
use biobridge_gateway::config::Credentials;
use biobridge_gateway::upstream::http::SESSION_HEADER;
use biobridge_gateway::{EnrollmentApi, HttpEnrollmentApi, Session, UpstreamError};
use reqwest::Url;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn api() -> HttpEnrollmentApi {
    HttpEnrollmentApi::new(Duration::from_secs(5)).unwrap()
}

fn session(server: &MockServer) -> Session {
    Session::new(Url::parse(&server.uri()).unwrap(), "tok-1")
}

#[tokio::test]
async fn test_login_returns_session_header() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/login"))
        .and(body_json(json!({"User": {"login_id": "admin", "password": "secret"}})))
        .respond_with(ResponseTemplate::new(200).insert_header(SESSION_HEADER, "abc123"))
        .expect(1)
        .mount(&server)
        .await;

    let endpoint = Url::parse(&server.uri()).unwrap();
    let token = api()
        .login(&endpoint, &Credentials::new("admin", "secret"))
        .await
        .unwrap();
    assert_eq!(token, "abc123");
}

#[tokio::test]
async fn test_login_without_token_is_decode_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/login"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let endpoint = Url::parse(&server.uri()).unwrap();
    let err = api()
        .login(&endpoint, &Credentials::new("admin", "secret"))
        .await
        .unwrap_err();
    assert!(matches!(err, UpstreamError::Decode(_)), "got {err:?}");
}

#[tokio::test]
async fn test_create_identity() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/users"))
        .and(header(SESSION_HEADER, "tok-1"))
        .and(body_json(json!({"User": {"name": "Ada", "user_id": "M-100"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"User": {"id": 55}})))
        .expect(1)
        .mount(&server)
        .await;

    let id = api()
        .create_identity(&session(&server), "Ada", "M-100")
        .await
        .unwrap();
    assert_eq!(id, IdentityId::new("55"));
}

#[tokio::test]
async fn test_unauthorized_status_maps_to_unauthorized() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/users"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = api()
        .create_identity(&session(&server), "Ada", "M-100")
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());
}

#[tokio::test]
async fn test_server_error_keeps_status_and_body() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/users"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let err = api()
        .create_identity(&session(&server), "Ada", "M-100")
        .await
        .unwrap_err();
    match err {
        UpstreamError::Status { status, body } => {
            assert_eq!(status, 503);
            assert_eq!(body, "maintenance");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_capture_decodes_template() {
    let server = MockServer::start().await;
    let template = Template::new(&b"minutiae"[..]);

    Mock::given(method("POST"))
        .and(path("/api/devices/541531029/scan_fingerprint"))
        .and(header(SESSION_HEADER, "tok-1"))
        .and(body_json(json!({"enroll_quality": 80, "raw_image": false})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"data": {"template0": template.to_base64()}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let captured = api()
        .capture_sample(&session(&server), DeviceId::new(541_531_029), 80)
        .await
        .unwrap();
    assert_eq!(captured, template);
}

#[tokio::test]
async fn test_capture_rejects_bad_template() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/devices/7/scan_fingerprint"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"template0": "%%%"}})))
        .mount(&server)
        .await;

    let err = api()
        .capture_sample(&session(&server), DeviceId::new(7), 80)
        .await
        .unwrap_err();
    assert!(matches!(err, UpstreamError::Decode(_)), "got {err:?}");
}

#[tokio::test]
async fn test_duplicate_check_match_and_no_match() {
    let template = Template::new(&b"sample-a"[..]);

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/server_matching/identify_finger"))
        .and(body_json(json!({"template": template.to_base64()})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"User": {"user_id": "M-1"}})))
        .mount(&server)
        .await;
    assert!(api().check_duplicate(&session(&server), &template).await.unwrap());

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/server_matching/identify_finger"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    assert!(!api().check_duplicate(&session(&server), &template).await.unwrap());
}

#[tokio::test]
async fn test_commit_sends_both_templates() {
    let server = MockServer::start().await;
    let a = Template::new(&b"sample-a"[..]);
    let b = Template::new(&b"sample-b"[..]);

    Mock::given(method("PUT"))
        .and(path("/api/users/bio-55"))
        .and(header(SESSION_HEADER, "tok-1"))
        .and(body_json(json!({
            "fingerprint_templates": [{
                "template0": a.to_base64(),
                "template1": b.to_base64(),
                "isNew": true,
            }]
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    api()
        .commit_templates(&session(&server), &IdentityId::new("bio-55"), &a, &b)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_slow_upstream_times_out() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/users"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let api = HttpEnrollmentApi::new(Duration::from_millis(50)).unwrap();
    let err = api
        .create_identity(&session(&server), "Ada", "M-100")
        .await
        .unwrap_err();
    match err {
        UpstreamError::Http(e) => assert!(e.is_timeout()),
        other => panic!("unexpected error: {other:?}"),
    }
}
