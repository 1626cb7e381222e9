//! Test harnesses for gateway integration tests.
//!
//! - [`FakeUpstream`]: scripted in-process upstream that counts every call
//! - [`MemorySink`]: collects records in memory
//! - [`TestGateway`]: a gateway bound to an ephemeral port
//! - [`TestDevice`]: a device speaking the wire protocol over real TCP

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use biobridge_core::command::EnrollmentReply;
use biobridge_core::{
    DeviceId, EnrollmentRecord, Frame, FrameBuffer, IdentityId, Template,
};
use biobridge_gateway::config::{parse_endpoints, Credentials, GatewayConfig, SessionConfig};
use biobridge_gateway::sink::{RecordSink, SinkError};
use biobridge_gateway::upstream::{EnrollmentApi, UpstreamError};
use biobridge_gateway::{Gateway, Session};
use reqwest::Url;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// Identity id handed out by [`FakeUpstream::create_identity`].
pub const IDENTITY_ID: &str = "bio-55";

/// Three upstream endpoints, tried in this order.
pub const ENDPOINTS: &str = "http://bs1.test,http://bs2.test,http://bs3.test";

pub fn template_a() -> Template {
    Template::new(&b"template-A"[..])
}

pub fn template_b() -> Template {
    Template::new(&b"template-B"[..])
}

// ============================================================================
// Fake upstream
// ============================================================================

/// In-process upstream.
///
/// Captures alternate between [`template_a`] and [`template_b`]. Hosts in
/// the down set fail login.
#[derive(Default)]
pub struct FakeUpstream {
    pub logins: AtomicUsize,
    pub creates: AtomicUsize,
    pub captures: AtomicUsize,
    pub duplicate_checks: AtomicUsize,
    pub commits: AtomicUsize,

    down: Mutex<HashSet<String>>,
    duplicate: AtomicBool,
    /// The next N enrollment calls are rejected as unauthorized.
    reject_next: AtomicUsize,
    /// Delay applied to every enrollment call.
    delay: Mutex<Option<Duration>>,
    fail_creates: AtomicBool,

    pub tokens_seen: Mutex<Vec<String>>,
    pub checked_templates: Mutex<Vec<Template>>,
    pub committed: Mutex<Vec<(IdentityId, Template, Template)>>,
    pub qualities: Mutex<Vec<u8>>,
}

impl FakeUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_down(&self, hosts: &[&str]) {
        *self.down.lock().unwrap() = hosts.iter().map(|h| h.to_string()).collect();
    }

    pub fn set_duplicate(&self, duplicate: bool) {
        self.duplicate.store(duplicate, Ordering::SeqCst);
    }

    pub fn reject_next(&self, n: usize) {
        self.reject_next.store(n, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_creates(&self) {
        self.fail_creates.store(true, Ordering::SeqCst);
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn enrollment_calls(&self) -> usize {
        Self::count(&self.creates)
            + Self::count(&self.captures)
            + Self::count(&self.duplicate_checks)
            + Self::count(&self.commits)
    }

    /// Common prelude of every enrollment call.
    async fn enter(&self, session: &Session) -> Result<(), UpstreamError> {
        self.tokens_seen.lock().unwrap().push(session.token.clone());

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let rejected = self
            .reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(UpstreamError::Unauthorized);
        }
        Ok(())
    }
}

#[async_trait]
impl EnrollmentApi for FakeUpstream {
    async fn login(&self, endpoint: &Url, _: &Credentials) -> Result<String, UpstreamError> {
        let n = self.logins.fetch_add(1, Ordering::SeqCst);
        let host = endpoint.host_str().unwrap_or_default().to_string();
        if self.down.lock().unwrap().contains(&host) {
            return Err(UpstreamError::Status {
                status: 503,
                body: format!("{} unavailable", host),
            });
        }
        Ok(format!("token-{}", n))
    }

    async fn create_identity(
        &self,
        session: &Session,
        _display_name: &str,
        _external_id: &str,
    ) -> Result<IdentityId, UpstreamError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.enter(session).await?;
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(UpstreamError::Status {
                status: 500,
                body: "boom".to_string(),
            });
        }
        Ok(IdentityId::new(IDENTITY_ID))
    }

    async fn capture_sample(&self, session: &Session, _: DeviceId, quality: u8) -> Result<Template, UpstreamError> {
        let n = self.captures.fetch_add(1, Ordering::SeqCst);
        self.enter(session).await?;
        self.qualities.lock().unwrap().push(quality);
        Ok(if n % 2 == 0 { template_a() } else { template_b() })
    }

    async fn check_duplicate(&self, session: &Session, template: &Template) -> Result<bool, UpstreamError> {
        self.duplicate_checks.fetch_add(1, Ordering::SeqCst);
        self.enter(session).await?;
        self.checked_templates.lock().unwrap().push(template.clone());
        Ok(self.duplicate.load(Ordering::SeqCst))
    }

    async fn commit_templates(
        &self,
        session: &Session,
        identity_id: &IdentityId,
        sample_a: &Template,
        sample_b: &Template,
    ) -> Result<(), UpstreamError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.enter(session).await?;
        self.committed
            .lock()
            .unwrap()
            .push((identity_id.clone(), sample_a.clone(), sample_b.clone()));
        Ok(())
    }
}

// ============================================================================
// Memory sink
// ============================================================================

#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<EnrollmentRecord>>,
    failing: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every later `record` call fail.
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<EnrollmentRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn record(&self, record: &EnrollmentRecord) -> Result<(), SinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Io(std::io::Error::other("sink offline")));
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

// ============================================================================
// Gateway
// ============================================================================

pub fn session_config() -> SessionConfig {
    let mut config = SessionConfig::new(
        parse_endpoints(ENDPOINTS).unwrap(),
        Credentials::new("admin", "secret"),
    );
    config.backoff = Duration::from_millis(200);
    config.login_timeout = Duration::from_secs(2);
    config
}

pub fn gateway_config() -> GatewayConfig {
    let mut config = GatewayConfig::new("127.0.0.1:0".parse().unwrap(), session_config());
    config.request_timeout = Duration::from_secs(2);
    config
}

/// A gateway serving on an ephemeral port.
pub struct TestGateway {
    pub gateway: Gateway,
    pub addr: SocketAddr,
    pub upstream: Arc<FakeUpstream>,
    pub sink: Arc<MemorySink>,
    shutdown: broadcast::Sender<()>,
}

impl TestGateway {
    pub async fn start() -> Self {
        Self::with_config(FakeUpstream::new(), gateway_config()).await
    }

    pub async fn with_upstream(upstream: Arc<FakeUpstream>) -> Self {
        Self::with_config(upstream, gateway_config()).await
    }

    pub async fn with_config(upstream: Arc<FakeUpstream>, mut config: GatewayConfig) -> Self {
        let listener = TcpListener::bind(config.listen_addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        config.listen_addr = addr;

        let sink = MemorySink::new();
        let gateway = Gateway::new(config, upstream.clone(), sink.clone());
        let (shutdown, _) = broadcast::channel(1);

        let serving = gateway.clone();
        let shutdown_tx = shutdown.clone();
        tokio::spawn(async move {
            serving.serve(listener, &shutdown_tx).await.unwrap();
        });

        Self {
            gateway,
            addr,
            upstream,
            sink,
            shutdown,
        }
    }

    pub async fn connect(&self, device_id: u32) -> TestDevice {
        TestDevice::connect(self.addr, device_id).await
    }

    /// Wait until the gateway lists `n` live connections.
    pub async fn wait_for_connections(&self, n: usize) {
        wait_until(|| self.gateway.status().connected_clients == n).await;
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

/// Poll `cond` for up to five seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Device
// ============================================================================

/// A fake capture device.
pub struct TestDevice {
    pub device_id: u32,
    stream: TcpStream,
    buffer: FrameBuffer,
}

impl TestDevice {
    pub async fn connect(addr: SocketAddr, device_id: u32) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        stream.set_nodelay(true).unwrap();
        Self {
            device_id,
            stream,
            buffer: FrameBuffer::default(),
        }
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    pub async fn send(&mut self, command: u16, payload: &[u8]) {
        let bytes = Frame::new(self.device_id, command, payload.to_vec())
            .encode()
            .unwrap();
        self.send_raw(&bytes).await;
    }

    /// Next frame from the gateway, failing the test after five seconds.
    pub async fn recv(&mut self) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(frame) = self.buffer.next_frame().unwrap() {
                    return frame;
                }
                let n = self.stream.read_buf(self.buffer.buf_mut()).await.unwrap();
                assert!(n > 0, "gateway closed the connection");
            }
        })
        .await
        .expect("timed out waiting for a frame")
    }

    /// True if nothing arrives within `wait`.
    pub async fn is_quiet(&mut self, wait: Duration) -> bool {
        if !self.buffer.is_empty() {
            return false;
        }
        tokio::time::timeout(wait, self.stream.read_buf(self.buffer.buf_mut()))
            .await
            .is_err()
    }

    pub async fn request(&mut self, command: u16, payload: &[u8]) -> Frame {
        self.send(command, payload).await;
        let reply = self.recv().await;
        assert_eq!(reply.header, self.device_id, "reply must echo the header");
        assert_eq!(reply.command, command, "reply must echo the command code");
        reply
    }

    /// Send a frame and decode the `[status, phase, reason]` reply.
    pub async fn enrollment_request(&mut self, command: u16, payload: &[u8]) -> [u8; 3] {
        let reply = self.request(command, payload).await;
        let parsed = EnrollmentReply::parse(&reply.payload).expect("three byte reply");
        [parsed.status, parsed.phase, parsed.reason]
    }

    pub async fn start_enrollment(&mut self, external_id: &str) -> [u8; 3] {
        let payload = serde_json::json!({ "external_id": external_id }).to_string();
        self.enrollment_request(0x0010, payload.as_bytes()).await
    }

    pub async fn deliver_sample(&mut self) -> [u8; 3] {
        self.enrollment_request(0x0011, &[]).await
    }

    pub async fn status(&mut self) -> [u8; 3] {
        self.enrollment_request(0x0001, &[]).await
    }
}
