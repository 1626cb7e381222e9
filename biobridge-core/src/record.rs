//! Records handed to the persistence collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::enrollment::{Enrollment, EnrollmentPhase, FailureReason};
use crate::identity::{DeviceId, IdentityId};

/// Outcome stored with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    /// Templates committed to a new identity.
    Completed,
    /// Enrollment stopped because the biometric was already enrolled.
    Duplicate,
    /// Enrollment stopped for any other reason.
    Failed,
    /// A device identified an existing identity.
    CheckedIn,
}

impl RecordOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Duplicate => "duplicate",
            Self::Failed => "failed",
            Self::CheckedIn => "checked_in",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(Self::Completed),
            "duplicate" => Some(Self::Duplicate),
            "failed" => Some(Self::Failed),
            "checked_in" => Some(Self::CheckedIn),
            _ => None,
        }
    }
}

/// One persisted outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    /// Unique record id.
    pub id: Uuid,

    pub identity_id: IdentityId,
    pub outcome: RecordOutcome,

    /// When the outcome was reached.
    pub ts: DateTime<Utc>,

    /// Match quality reported by the device. Only check-ins carry one.
    pub quality_score: Option<u8>,

    pub external_id: Option<String>,
    pub device_id: Option<DeviceId>,

    /// Failure reason for `failed`/`duplicate` outcomes.
    pub detail: Option<String>,
}

impl EnrollmentRecord {
    pub fn new(identity_id: IdentityId, outcome: RecordOutcome, ts: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity_id,
            outcome,
            ts,
            quality_score: None,
            external_id: None,
            device_id: None,
            detail: None,
        }
    }

    /// Record for a device-side identification (check-in).
    pub fn checked_in(
        identity_id: IdentityId,
        device_id: DeviceId,
        quality_score: Option<u8>,
        ts: DateTime<Utc>,
    ) -> Self {
        Self::new(identity_id, RecordOutcome::CheckedIn, ts)
            .with_device(device_id)
            .with_quality(quality_score)
    }

    /// Record for a terminal enrollment.
    ///
    /// Returns `None` while the enrollment is still active or when it never
    /// obtained an identity.
    pub fn from_enrollment(enrollment: &Enrollment) -> Option<Self> {
        let identity_id = enrollment.identity_id.clone()?;

        let outcome = match (enrollment.phase, enrollment.failure) {
            (EnrollmentPhase::Completed, _) => RecordOutcome::Completed,
            (EnrollmentPhase::Failed, Some(FailureReason::DuplicateBiometric)) => {
                RecordOutcome::Duplicate
            }
            (EnrollmentPhase::Failed, _) => RecordOutcome::Failed,
            _ => return None,
        };

        let ts = enrollment.ended_at.unwrap_or(enrollment.started_at);
        let mut record = Self::new(identity_id, outcome, ts).with_device(enrollment.device_id);
        record.external_id = Some(enrollment.external_id.clone());
        record.detail = enrollment.failure.map(|r| r.as_str().to_string());
        Some(record)
    }

    pub fn with_device(mut self, device_id: DeviceId) -> Self {
        self.device_id = Some(device_id);
        self
    }

    pub fn with_quality(mut self, quality_score: Option<u8>) -> Self {
        self.quality_score = quality_score;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrollment::{EnrollmentEvent, EnrollmentEventKind};
    use crate::identity::Template;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn enrollment_at_duplicate_check() -> Enrollment {
        let mut enrollment = Enrollment::created(
            DeviceId::new(7),
            "M-100",
            "Mario",
            IdentityId::new("bio-55"),
            ts("2024-01-15T10:00:00Z"),
        );
        enrollment.capture_threshold = Some(80);
        for bytes in [&b"A"[..], &b"B"[..]] {
            enrollment
                .apply(&EnrollmentEvent::new(EnrollmentEventKind::SampleCaptured {
                    template: Template::new(bytes),
                }))
                .unwrap();
        }
        enrollment
    }

    #[test]
    fn active_enrollment_has_no_record() {
        assert_eq!(
            EnrollmentRecord::from_enrollment(&enrollment_at_duplicate_check()),
            None
        );
    }

    #[test]
    fn completed_record() {
        let mut enrollment = enrollment_at_duplicate_check();
        enrollment
            .apply(&EnrollmentEvent::new(EnrollmentEventKind::DuplicateCheckPassed))
            .unwrap();
        enrollment
            .apply(&EnrollmentEvent::with_ts(
                EnrollmentEventKind::Committed,
                ts("2024-01-15T10:05:00Z"),
            ))
            .unwrap();

        let record = EnrollmentRecord::from_enrollment(&enrollment).unwrap();
        assert_eq!(record.identity_id, IdentityId::new("bio-55"));
        assert_eq!(record.outcome, RecordOutcome::Completed);
        assert_eq!(record.ts, ts("2024-01-15T10:05:00Z"));
        // The requested threshold is not a measured score.
        assert_eq!(record.quality_score, None);
        assert_eq!(record.external_id.as_deref(), Some("M-100"));
        assert_eq!(record.device_id, Some(DeviceId::new(7)));
        assert_eq!(record.detail, None);
    }

    #[test]
    fn duplicate_record() {
        let mut enrollment = enrollment_at_duplicate_check();
        enrollment
            .apply(&EnrollmentEvent::new(EnrollmentEventKind::DuplicateFound))
            .unwrap();

        let record = EnrollmentRecord::from_enrollment(&enrollment).unwrap();
        assert_eq!(record.outcome, RecordOutcome::Duplicate);
        assert_eq!(record.detail.as_deref(), Some("duplicate_biometric"));
    }

    #[test]
    fn failure_without_identity_has_no_record() {
        let enrollment = Enrollment::failed_to_start(
            DeviceId::new(7),
            "M-100",
            "Mario",
            FailureReason::IdentityCreateFailed,
            ts("2024-01-15T10:00:00Z"),
        );
        assert_eq!(EnrollmentRecord::from_enrollment(&enrollment), None);
    }

    #[test]
    fn outcome_strings_roundtrip() {
        for outcome in [
            RecordOutcome::Completed,
            RecordOutcome::Duplicate,
            RecordOutcome::Failed,
            RecordOutcome::CheckedIn,
        ] {
            assert_eq!(RecordOutcome::parse(outcome.as_str()), Some(outcome));
            let json = serde_json::to_string(&outcome).unwrap();
            assert_eq!(json, format!("\"{}\"", outcome.as_str()));
        }
    }

    #[test]
    fn checked_in_record() {
        let record = EnrollmentRecord::checked_in(
            IdentityId::new("bio-55"),
            DeviceId::new(9),
            Some(91),
            ts("2024-01-15T11:00:00Z"),
        );
        assert_eq!(record.outcome, RecordOutcome::CheckedIn);
        assert_eq!(record.device_id, Some(DeviceId::new(9)));
        assert_eq!(record.quality_score, Some(91));
        assert_eq!(record.external_id, None);
    }
}
