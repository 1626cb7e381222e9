//! Per-connection device handler.
//!
//! One task per device socket. The task owns the connection's frame buffer
//! and its enrollment; nothing else touches either. Frames are handled
//! strictly in order and every inbound frame gets exactly one reply.
//! Control commands from the gateway arrive on an mpsc channel and are
//! interleaved between frames.

use std::time::Duration;

use biobridge_core::command::{
    device_info_reply, enrollment_reply, parse_sample_quality, status_reply, EnrollStartRequest,
    IdentifyEventRequest,
};
use biobridge_core::{
    Command, ConnectionSummary, DeviceId, Enrollment, EnrollmentView, Frame, FrameBuffer,
    InvalidPhaseTransition, ReplyStatus,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::orchestrator::Orchestrator;

pub type ConnectionId = u64;

/// Control commands queue depth per connection.
const CONTROL_CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("device id not known yet: the device has not sent a frame")]
    DeviceUnknown,

    #[error(transparent)]
    InvalidPhase(#[from] InvalidPhaseTransition),

    #[error("connection closed")]
    Closed,
}

/// Commands routed to a connection task from outside.
#[derive(Debug)]
pub enum ControlCommand {
    StartEnrollment {
        display_name: String,
        external_id: String,
        reply: oneshot::Sender<Result<EnrollmentView, ConnectionError>>,
    },
}

/// Gateway-side handle to a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    control: mpsc::Sender<ControlCommand>,
    summary: watch::Receiver<ConnectionSummary>,
}

impl ConnectionHandle {
    /// Latest summary published by the connection task.
    pub fn summary(&self) -> ConnectionSummary {
        self.summary.borrow().clone()
    }

    /// Ask the connection to start an enrollment for its device.
    pub async fn start_enrollment(
        &self,
        display_name: String,
        external_id: String,
    ) -> Result<EnrollmentView, ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(ControlCommand::StartEnrollment {
                display_name,
                external_id,
                reply,
            })
            .await
            .map_err(|_| ConnectionError::Closed)?;
        rx.await.map_err(|_| ConnectionError::Closed)?
    }
}

/// Per-connection state. Discarded when the socket closes.
#[derive(Debug)]
struct ConnectionState {
    connected_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    device_id: Option<DeviceId>,
    enrollment: Option<Enrollment>,
}

pub struct Connection<S> {
    id: ConnectionId,
    peer: String,
    stream: S,
    buffer: FrameBuffer,
    idle_timeout: Duration,
    orchestrator: Orchestrator,
    state: ConnectionState,
    control_rx: mpsc::Receiver<ControlCommand>,
    summary_tx: watch::Sender<ConnectionSummary>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        id: ConnectionId,
        peer: impl Into<String>,
        stream: S,
        orchestrator: Orchestrator,
        max_payload: usize,
        idle_timeout: Duration,
    ) -> (Self, ConnectionHandle) {
        let peer = peer.into();
        let now = Utc::now();
        let state = ConnectionState {
            connected_at: now,
            last_activity_at: now,
            device_id: None,
            enrollment: None,
        };

        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (summary_tx, summary_rx) = watch::channel(summarize(id, &peer, &state));

        let connection = Self {
            id,
            peer,
            stream,
            buffer: FrameBuffer::new(max_payload),
            idle_timeout,
            orchestrator,
            state,
            control_rx,
            summary_tx,
        };
        let handle = ConnectionHandle {
            id,
            control: control_tx,
            summary: summary_rx,
        };
        (connection, handle)
    }

    /// Serve the connection until the device disconnects, goes idle, or the
    /// gateway shuts down.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> std::io::Result<()> {
        tracing::info!(conn = self.id, peer = %self.peer, "Device connected");

        let mut idle_deadline = Instant::now() + self.idle_timeout;

        let result = loop {
            tokio::select! {
                read = self.stream.read_buf(self.buffer.buf_mut()) => {
                    match read {
                        Ok(0) => {
                            tracing::info!(conn = self.id, "Device closed connection");
                            break Ok(());
                        }
                        Ok(n) => {
                            tracing::trace!(conn = self.id, bytes = n, "Read from device");
                            idle_deadline = Instant::now() + self.idle_timeout;
                            self.state.last_activity_at = Utc::now();
                            if let Err(e) = self.drain_frames().await {
                                break Err(e);
                            }
                        }
                        Err(e) => break Err(e),
                    }
                }
                Some(command) = self.control_rx.recv() => {
                    if let Err(e) = self.handle_control(command).await {
                        break Err(e);
                    }
                }
                _ = tokio::time::sleep_until(idle_deadline) => {
                    tracing::info!(conn = self.id, idle = ?self.idle_timeout, "Closing idle device connection");
                    break Ok(());
                }
                _ = shutdown.recv() => {
                    tracing::debug!(conn = self.id, "Shutdown signal received, closing device connection");
                    break Ok(());
                }
            }
        };

        if let Some(enrollment) = &self.state.enrollment {
            if !enrollment.is_terminal() {
                tracing::info!(
                    conn = self.id,
                    external_id = %enrollment.external_id,
                    phase = %enrollment.phase,
                    "Discarding unfinished enrollment"
                );
            }
        }
        result
    }

    /// Handle every complete frame currently buffered.
    async fn drain_frames(&mut self) -> std::io::Result<()> {
        loop {
            match self.buffer.next_frame() {
                Ok(Some(frame)) => {
                    let reply = frame.reply(self.handle_frame(&frame).await);
                    self.write_frame(&reply).await?;
                    self.publish();
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    // The buffer skips the rejected frame, including payload still in flight.
                    tracing::warn!(conn = self.id, error = %e, "Skipping oversized device frame");
                }
            }
        }
    }

    async fn write_frame(&mut self, frame: &Frame) -> std::io::Result<()> {
        let bytes = frame
            .encode()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await
    }

    fn publish(&self) {
        self.summary_tx
            .send_replace(summarize(self.id, &self.peer, &self.state));
    }

    // ========================================================================
    // Frame dispatch
    // ========================================================================

    /// Produce the reply payload for one inbound frame.
    async fn handle_frame(&mut self, frame: &Frame) -> Bytes {
        if self.state.device_id.is_none() {
            let device_id = DeviceId::new(frame.header);
            tracing::info!(conn = self.id, device = %device_id, "Device identified");
            self.state.device_id = Some(device_id);
        }

        let Some(command) = Command::from_code(frame.command) else {
            tracing::debug!(conn = self.id, code = frame.command, "Unrecognized command, acknowledging");
            return status_reply(ReplyStatus::Ack);
        };
        tracing::debug!(
            conn = self.id,
            command = command.name(),
            len = frame.payload_len(),
            "Frame received"
        );

        match command {
            Command::DeviceStatus => self.current_status(),
            Command::DeviceInfo => device_info_reply(),
            Command::Keepalive => status_reply(ReplyStatus::Ok),
            Command::EnrollStart => self.on_enroll_start(&frame.payload, DeviceId::new(frame.header)).await,
            Command::SampleDelivered => self.on_sample_delivered(&frame.payload).await,
            Command::IdentifyEvent => self.on_identify(&frame.payload, DeviceId::new(frame.header)).await,
        }
    }

    /// `[status, phase, reason]` for the current or last enrollment.
    fn current_status(&self) -> Bytes {
        match &self.state.enrollment {
            Some(enrollment) => reply_for(enrollment),
            None => enrollment_reply(ReplyStatus::Ok, None, None),
        }
    }

    fn rejected(&self) -> Bytes {
        match &self.state.enrollment {
            Some(e) => enrollment_reply(ReplyStatus::Rejected, Some(e.phase), e.failure),
            None => enrollment_reply(ReplyStatus::Rejected, None, None),
        }
    }

    async fn on_enroll_start(&mut self, payload: &[u8], device_id: DeviceId) -> Bytes {
        let request = match EnrollStartRequest::parse(payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(conn = self.id, error = %e, "Malformed enrollment start");
                return self.rejected();
            }
        };

        match self
            .begin_enrollment(device_id, request.display_name(), &request.external_id)
            .await
        {
            Ok(()) => self.current_status(),
            Err(e) => {
                tracing::warn!(conn = self.id, error = %e, "Enrollment start rejected");
                self.rejected()
            }
        }
    }

    async fn on_sample_delivered(&mut self, payload: &[u8]) -> Bytes {
        let quality = match parse_sample_quality(payload) {
            Ok(quality) => quality,
            Err(e) => {
                tracing::warn!(conn = self.id, error = %e, "Malformed sample notification");
                return self.rejected();
            }
        };

        let Some(enrollment) = self.state.enrollment.as_mut() else {
            let e = InvalidPhaseTransition::no_enrollment("sample_delivered");
            tracing::warn!(conn = self.id, error = %e, "Sample rejected");
            return self.rejected();
        };

        match self.orchestrator.on_sample_delivered(enrollment, quality).await {
            Ok(()) => reply_for(enrollment),
            Err(e) => {
                tracing::warn!(conn = self.id, error = %e, "Sample rejected");
                self.rejected()
            }
        }
    }

    async fn on_identify(&mut self, payload: &[u8], device_id: DeviceId) -> Bytes {
        match IdentifyEventRequest::parse(payload) {
            Ok(request) => {
                self.orchestrator.on_identify(device_id, request).await;
                status_reply(ReplyStatus::Ok)
            }
            Err(e) => {
                tracing::warn!(conn = self.id, error = %e, "Malformed identify event");
                status_reply(ReplyStatus::Rejected)
            }
        }
    }

    /// Open a new enrollment unless one is still in progress.
    async fn begin_enrollment(
        &mut self,
        device_id: DeviceId,
        display_name: &str,
        external_id: &str,
    ) -> Result<(), InvalidPhaseTransition> {
        if let Some(current) = &self.state.enrollment {
            if !current.is_terminal() {
                return Err(InvalidPhaseTransition {
                    from: Some(current.phase),
                    event: "enroll_start",
                    reason: format!("enrollment for '{}' is still in progress", current.external_id),
                });
            }
        }

        let enrollment = self.orchestrator.start(device_id, display_name, external_id).await;
        self.state.enrollment = Some(enrollment);
        Ok(())
    }

    // ========================================================================
    // Control commands
    // ========================================================================

    async fn handle_control(&mut self, command: ControlCommand) -> std::io::Result<()> {
        match command {
            ControlCommand::StartEnrollment {
                display_name,
                external_id,
                reply,
            } => {
                let Some(device_id) = self.state.device_id else {
                    let _ = reply.send(Err(ConnectionError::DeviceUnknown));
                    return Ok(());
                };

                tracing::info!(conn = self.id, device = %device_id, external_id = %external_id, "Programmatic enrollment start");
                let result = self
                    .begin_enrollment(device_id, &display_name, &external_id)
                    .await;

                let notify = match (&result, &self.state.enrollment) {
                    (Ok(()), Some(enrollment)) => Some(Frame::new(
                        device_id.as_u32(),
                        Command::EnrollStart.code(),
                        reply_for(enrollment),
                    )),
                    _ => None,
                };

                let outcome = match result {
                    Ok(()) => self
                        .state
                        .enrollment
                        .as_ref()
                        .map(Enrollment::view)
                        .ok_or(ConnectionError::Closed),
                    Err(e) => Err(ConnectionError::InvalidPhase(e)),
                };
                let _ = reply.send(outcome);
                self.publish();

                if let Some(frame) = notify {
                    self.write_frame(&frame).await?;
                }
                Ok(())
            }
        }
    }
}

/// `[status, phase, reason]` for an enrollment that was not rejected.
fn reply_for(enrollment: &Enrollment) -> Bytes {
    enrollment_reply(
        ReplyStatus::for_phase(enrollment.phase),
        Some(enrollment.phase),
        enrollment.failure,
    )
}

fn summarize(id: ConnectionId, peer: &str, state: &ConnectionState) -> ConnectionSummary {
    ConnectionSummary {
        id,
        peer: peer.to_string(),
        device_id: state.device_id,
        connected_at: state.connected_at,
        last_activity_at: state.last_activity_at,
        enrollment: state.enrollment.as_ref().map(Enrollment::view),
    }
}
