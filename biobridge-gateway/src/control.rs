//! Local control API: line-delimited JSON over TCP.
//!
//! ```text
//! -> {"op":"status"}
//! <- {"ok":true,"status":{...}}
//! -> {"op":"start_enrollment","connection_id":1,"display_name":"Ada","external_id":"M-100"}
//! <- {"ok":true,"enrollment":{...}}
//! <- {"ok":false,"error":"no such connection: 7"}
//! ```
//!
//! `biobridge status` and `biobridge enroll` are clients of this API.

use std::net::SocketAddr;

use biobridge_core::{EnrollmentView, GatewayStatus};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use crate::connection::ConnectionId;
use crate::gateway::Gateway;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    Status,
    StartEnrollment {
        connection_id: ConnectionId,
        display_name: String,
        external_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ControlResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<GatewayStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrollment: Option<EnrollmentView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    fn status(status: GatewayStatus) -> Self {
        Self {
            ok: true,
            status: Some(status),
            ..Default::default()
        }
    }

    fn enrollment(view: EnrollmentView) -> Self {
        Self {
            ok: true,
            enrollment: Some(view),
            ..Default::default()
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid control message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("gateway returned an error: {0}")]
    Remote(String),

    #[error("unexpected response from gateway")]
    UnexpectedResponse,
}

/// Longest request line a control client may send.
const MAX_REQUEST_LINE: usize = 64 * 1024;

/// Longest response line the CLI accepts (status grows with connections).
const MAX_RESPONSE_LINE: usize = 16 * 1024 * 1024;

/// Read one `\n`-terminated line of at most `limit` bytes into `line`.
///
/// Returns `Ok(false)` on a clean end of stream. A line that reaches the
/// limit without a newline is an `InvalidData` error, and the stream is no
/// longer line-aligned after it.
async fn read_line_limited<R>(reader: &mut R, line: &mut String, limit: usize) -> std::io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let n = (&mut *reader).take(limit as u64).read_line(line).await?;
    if n == 0 {
        return Ok(false);
    }
    if !line.ends_with('\n') && n >= limit {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("control line exceeds {} bytes", limit),
        ));
    }
    Ok(true)
}

// ============================================================================
// Server
// ============================================================================

/// Serve control clients until `shutdown` fires.
pub async fn serve_control(
    listener: TcpListener,
    gateway: Gateway,
    shutdown: &broadcast::Sender<()>,
) -> std::io::Result<()> {
    let local = listener.local_addr()?;
    tracing::info!(addr = %local, "Control listener bound");

    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let gateway = gateway.clone();
                        let shutdown = shutdown.subscribe();
                        tokio::spawn(async move {
                            if let Err(e) = handle_control_client(stream, gateway, shutdown).await {
                                tracing::debug!(peer = %peer, error = %e, "Control client error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Control accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("Shutdown signal received, stopping control accept loop");
                break;
            }
        }
    }
    Ok(())
}

async fn handle_control_client(
    stream: TcpStream,
    gateway: Gateway,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        let more = tokio::select! {
            more = read_line_limited(&mut reader, &mut line, MAX_REQUEST_LINE) => more,
            _ = shutdown.recv() => return Ok(()),
        };
        match more {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                // Answer once, then drop the client: the rest of the line is unread.
                let response = ControlResponse::error(e.to_string());
                let mut encoded = serde_json::to_vec(&response)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                encoded.push(b'\n');
                writer.write_all(&encoded).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        }
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(request) => dispatch(&gateway, request).await,
            Err(e) => ControlResponse::error(format!("invalid request: {}", e)),
        };

        let mut encoded = serde_json::to_vec(&response)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        encoded.push(b'\n');
        writer.write_all(&encoded).await?;
    }
}

async fn dispatch(gateway: &Gateway, request: ControlRequest) -> ControlResponse {
    match request {
        ControlRequest::Status => ControlResponse::status(gateway.status()),
        ControlRequest::StartEnrollment {
            connection_id,
            display_name,
            external_id,
        } => match gateway
            .start_enrollment(connection_id, &display_name, &external_id)
            .await
        {
            Ok(view) => ControlResponse::enrollment(view),
            Err(e) => {
                tracing::warn!(conn = connection_id, error = %e, "Programmatic enrollment start failed");
                ControlResponse::error(e.to_string())
            }
        },
    }
}

// ============================================================================
// Client
// ============================================================================

/// Client for the control API, used by the CLI subcommands.
#[derive(Debug, Clone, Copy)]
pub struct ControlClient {
    addr: SocketAddr,
}

impl ControlClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub async fn status(&self) -> Result<GatewayStatus, ControlError> {
        self.request(&ControlRequest::Status)
            .await?
            .status
            .ok_or(ControlError::UnexpectedResponse)
    }

    pub async fn start_enrollment(
        &self,
        connection_id: ConnectionId,
        display_name: &str,
        external_id: &str,
    ) -> Result<EnrollmentView, ControlError> {
        let request = ControlRequest::StartEnrollment {
            connection_id,
            display_name: display_name.to_string(),
            external_id: external_id.to_string(),
        };
        self.request(&request)
            .await?
            .enrollment
            .ok_or(ControlError::UnexpectedResponse)
    }

    async fn request(&self, request: &ControlRequest) -> Result<ControlResponse, ControlError> {
        let stream = TcpStream::connect(self.addr).await?;
        let (reader, mut writer) = stream.into_split();

        let mut encoded = serde_json::to_vec(request)?;
        encoded.push(b'\n');
        writer.write_all(&encoded).await?;

        let mut line = String::new();
        if !read_line_limited(&mut BufReader::new(reader), &mut line, MAX_RESPONSE_LINE).await? {
            return Err(ControlError::UnexpectedResponse);
        }
        let response: ControlResponse = serde_json::from_str(&line)?;

        if !response.ok {
            return Err(ControlError::Remote(
                response.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        Ok(response)
    }
}
