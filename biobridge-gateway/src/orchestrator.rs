//! Enrollment orchestration.
//!
//! Drives the pure [`Enrollment`] state machine with upstream calls:
//! create identity, capture sample A, capture sample B, duplicate check on
//! sample A, commit both templates. Terminal outcomes with a known identity
//! are handed to the [`RecordSink`].

use std::sync::Arc;

use biobridge_core::command::IdentifyEventRequest;
use biobridge_core::{
    DeviceId, Enrollment, EnrollmentEvent, EnrollmentEventKind, EnrollmentPhase, EnrollmentRecord,
    FailureReason, InvalidPhaseTransition, Template,
};
use chrono::Utc;

use crate::client::UpstreamClient;
use crate::sink::RecordSink;
use crate::upstream::UpstreamError;

#[derive(Clone)]
pub struct Orchestrator {
    client: UpstreamClient,
    sink: Arc<dyn RecordSink>,
    default_quality: u8,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("client", &self.client)
            .field("default_quality", &self.default_quality)
            .finish()
    }
}

/// Map an upstream error to the failure reason for the step that hit it.
fn failure_for(error: &UpstreamError, step: FailureReason) -> FailureReason {
    if error.is_session_unavailable() {
        FailureReason::UpstreamUnavailable
    } else {
        step
    }
}

impl Orchestrator {
    pub fn new(client: UpstreamClient, sink: Arc<dyn RecordSink>, default_quality: u8) -> Self {
        Self {
            client,
            sink,
            default_quality,
        }
    }

    /// Create the upstream identity and open a new enrollment.
    ///
    /// Never fails: an upstream failure yields an enrollment already in
    /// `Failed`.
    pub async fn start(&self, device_id: DeviceId, display_name: &str, external_id: &str) -> Enrollment {
        match self.client.create_identity(display_name, external_id).await {
            Ok(identity_id) => {
                tracing::info!(
                    device = %device_id,
                    identity = %identity_id,
                    external_id,
                    "Enrollment started"
                );
                Enrollment::created(device_id, external_id, display_name, identity_id, Utc::now())
            }
            Err(e) => {
                let reason = failure_for(&e, FailureReason::IdentityCreateFailed);
                tracing::warn!(
                    device = %device_id,
                    external_id,
                    error = %e,
                    reason = %reason,
                    "Identity creation failed"
                );
                Enrollment::failed_to_start(device_id, external_id, display_name, reason, Utc::now())
            }
        }
    }

    /// The device reported a finger on the sensor: capture the next sample.
    ///
    /// Rejected without any upstream call unless the enrollment is waiting
    /// for a sample.
    pub async fn on_sample_delivered(
        &self,
        enrollment: &mut Enrollment,
        quality: Option<u8>,
    ) -> Result<(), InvalidPhaseTransition> {
        enrollment.ensure_accepts_sample()?;

        let quality = quality.unwrap_or(self.default_quality);
        enrollment.capture_threshold = Some(quality);

        match self.client.capture_sample(enrollment.device_id, quality).await {
            Ok(template) => self.on_sample_captured(enrollment, template).await,
            Err(e) => {
                tracing::warn!(device = %enrollment.device_id, error = %e, "Capture failed");
                let reason = failure_for(&e, FailureReason::CaptureFailed);
                self.fail(enrollment, reason).await
            }
        }
    }

    /// Store a captured template; after the second one run the duplicate
    /// check and commit.
    pub async fn on_sample_captured(
        &self,
        enrollment: &mut Enrollment,
        template: Template,
    ) -> Result<(), InvalidPhaseTransition> {
        tracing::debug!(
            device = %enrollment.device_id,
            phase = %enrollment.phase,
            bytes = template.len(),
            "Sample captured"
        );
        enrollment.apply(&EnrollmentEvent::new(EnrollmentEventKind::SampleCaptured { template }))?;

        if enrollment.phase == EnrollmentPhase::DuplicateChecking {
            self.check_and_commit(enrollment).await?;
        }
        Ok(())
    }

    async fn check_and_commit(&self, enrollment: &mut Enrollment) -> Result<(), InvalidPhaseTransition> {
        let (Some(sample_a), Some(sample_b), Some(identity_id)) = (
            enrollment.sample_a.clone(),
            enrollment.sample_b.clone(),
            enrollment.identity_id.clone(),
        ) else {
            return self.fail(enrollment, FailureReason::DuplicateCheckFailed).await;
        };

        match self.client.check_duplicate(&sample_a).await {
            Ok(true) => {
                tracing::warn!(identity = %identity_id, "Biometric already enrolled");
                enrollment.apply(&EnrollmentEvent::new(EnrollmentEventKind::DuplicateFound))?;
                self.emit(enrollment).await;
                return Ok(());
            }
            Ok(false) => {
                enrollment.apply(&EnrollmentEvent::new(EnrollmentEventKind::DuplicateCheckPassed))?;
            }
            Err(e) => {
                tracing::warn!(identity = %identity_id, error = %e, "Duplicate check failed");
                let reason = failure_for(&e, FailureReason::DuplicateCheckFailed);
                return self.fail(enrollment, reason).await;
            }
        }

        match self
            .client
            .commit_templates(&identity_id, &sample_a, &sample_b)
            .await
        {
            Ok(()) => {
                enrollment.apply(&EnrollmentEvent::new(EnrollmentEventKind::Committed))?;
                tracing::info!(
                    identity = %identity_id,
                    external_id = %enrollment.external_id,
                    "Enrollment completed"
                );
                self.emit(enrollment).await;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(identity = %identity_id, error = %e, "Template commit failed");
                let reason = failure_for(&e, FailureReason::CommitFailed);
                self.fail(enrollment, reason).await
            }
        }
    }

    async fn fail(&self, enrollment: &mut Enrollment, reason: FailureReason) -> Result<(), InvalidPhaseTransition> {
        enrollment.apply(&EnrollmentEvent::new(EnrollmentEventKind::Failed { reason }))?;
        self.emit(enrollment).await;
        Ok(())
    }

    /// A device identified a known identity on its own.
    pub async fn on_identify(&self, device_id: DeviceId, request: IdentifyEventRequest) {
        tracing::info!(device = %device_id, identity = %request.identity_id, "Identity checked in");
        let record = EnrollmentRecord::checked_in(request.identity_id, device_id, request.quality, Utc::now());
        self.store(&record).await;
    }

    async fn emit(&self, enrollment: &Enrollment) {
        if let Some(record) = EnrollmentRecord::from_enrollment(enrollment) {
            self.store(&record).await;
        }
    }

    async fn store(&self, record: &EnrollmentRecord) {
        if let Err(e) = self.sink.record(record).await {
            tracing::warn!(
                identity = %record.identity_id,
                outcome = record.outcome.as_str(),
                error = %e,
                "Failed to persist enrollment record"
            );
        }
    }
}
