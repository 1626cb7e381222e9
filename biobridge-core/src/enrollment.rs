//! Enrollment workflow types and state machine.
//!
//! An enrollment walks one new identity through
//! create → sample A → sample B → duplicate check → commit. The transitions
//! are pure; the gateway performs the upstream calls and feeds their results
//! back in as [`EnrollmentEvent`]s.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{DeviceId, IdentityId, Template};

// ============================================================================
// Phases
// ============================================================================

/// Lifecycle phase of an enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentPhase {
    /// Identity created upstream, waiting for the first capture.
    AwaitingSampleA,
    /// First template stored, waiting for the second capture.
    AwaitingSampleB,
    /// Both templates stored, duplicate check in progress.
    DuplicateChecking,
    /// No duplicate found, templates being committed.
    Committing,
    /// Templates committed to the identity.
    Completed,
    /// Workflow ended without a commit. See [`FailureReason`].
    Failed,
}

impl EnrollmentPhase {
    /// Returns true if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if a sample-delivered notification is meaningful.
    pub fn accepts_sample(&self) -> bool {
        matches!(self, Self::AwaitingSampleA | Self::AwaitingSampleB)
    }

    /// Wire code used in reply payloads. `0` means "no enrollment".
    pub fn code(&self) -> u8 {
        match self {
            Self::AwaitingSampleA => 0x01,
            Self::AwaitingSampleB => 0x02,
            Self::DuplicateChecking => 0x03,
            Self::Committing => 0x04,
            Self::Completed => 0x05,
            Self::Failed => 0x06,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingSampleA => "awaiting_sample_a",
            Self::AwaitingSampleB => "awaiting_sample_b",
            Self::DuplicateChecking => "duplicate_checking",
            Self::Committing => "committing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for EnrollmentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an enrollment ended in [`EnrollmentPhase::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The upstream rejected or failed the identity creation.
    IdentityCreateFailed,
    /// A capture call failed.
    CaptureFailed,
    /// The captured biometric already belongs to another identity.
    DuplicateBiometric,
    /// The duplicate-check call itself failed.
    DuplicateCheckFailed,
    /// Storing the templates on the identity failed.
    CommitFailed,
    /// No upstream session could be obtained.
    UpstreamUnavailable,
}

impl FailureReason {
    /// Wire code used in reply payloads. `0` means "no failure".
    pub fn code(&self) -> u8 {
        match self {
            Self::IdentityCreateFailed => 0x01,
            Self::CaptureFailed => 0x02,
            Self::DuplicateBiometric => 0x03,
            Self::DuplicateCheckFailed => 0x04,
            Self::CommitFailed => 0x05,
            Self::UpstreamUnavailable => 0x06,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IdentityCreateFailed => "identity_create_failed",
            Self::CaptureFailed => "capture_failed",
            Self::DuplicateBiometric => "duplicate_biometric",
            Self::DuplicateCheckFailed => "duplicate_check_failed",
            Self::CommitFailed => "commit_failed",
            Self::UpstreamUnavailable => "upstream_unavailable",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Events
// ============================================================================

/// An enrollment event with its timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrollmentEvent {
    pub ts: DateTime<Utc>,
    pub kind: EnrollmentEventKind,
}

impl EnrollmentEvent {
    /// Create an event stamped with the current time.
    pub fn new(kind: EnrollmentEventKind) -> Self {
        Self { ts: Utc::now(), kind }
    }

    pub fn with_ts(kind: EnrollmentEventKind, ts: DateTime<Utc>) -> Self {
        Self { ts, kind }
    }
}

/// What happened to an enrollment.
#[derive(Debug, Clone, PartialEq)]
pub enum EnrollmentEventKind {
    /// A capture returned a template.
    /// Transition: AwaitingSampleA → AwaitingSampleB, AwaitingSampleB → DuplicateChecking
    SampleCaptured { template: Template },

    /// The duplicate check found no match.
    /// Transition: DuplicateChecking → Committing
    DuplicateCheckPassed,

    /// The duplicate check matched an existing identity.
    /// Transition: DuplicateChecking → Failed(DuplicateBiometric)
    DuplicateFound,

    /// The templates were stored upstream.
    /// Transition: Committing → Completed
    Committed,

    /// An upstream step failed.
    /// Transition: any non-terminal phase → Failed(reason)
    Failed { reason: FailureReason },
}

impl EnrollmentEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SampleCaptured { .. } => "SampleCaptured",
            Self::DuplicateCheckPassed => "DuplicateCheckPassed",
            Self::DuplicateFound => "DuplicateFound",
            Self::Committed => "Committed",
            Self::Failed { .. } => "Failed",
        }
    }
}

// ============================================================================
// Transition Errors
// ============================================================================

/// Error when an event does not fit the enrollment's current phase.
///
/// `from` is `None` when the connection has no enrollment at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid phase transition: cannot apply '{event}' {}: {reason}", describe_from(.from))]
pub struct InvalidPhaseTransition {
    pub from: Option<EnrollmentPhase>,
    pub event: &'static str,
    pub reason: String,
}

fn describe_from(from: &Option<EnrollmentPhase>) -> String {
    match from {
        Some(phase) => format!("to enrollment in phase '{}'", phase),
        None => "without an enrollment".to_string(),
    }
}

impl InvalidPhaseTransition {
    /// Rejection for a sample or event arriving while no enrollment exists.
    pub fn no_enrollment(event: &'static str) -> Self {
        Self {
            from: None,
            event,
            reason: "no enrollment has been started".into(),
        }
    }
}

// ============================================================================
// Enrollment
// ============================================================================

/// One enrollment workflow, owned by the connection that started it.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrollment {
    // ── Request ───────────────────────────────────────────────────────────
    pub device_id: DeviceId,
    pub external_id: String,
    pub display_name: String,

    // ── Progress ──────────────────────────────────────────────────────────
    /// Identity created upstream. `None` only if creation failed.
    pub identity_id: Option<IdentityId>,
    pub sample_a: Option<Template>,
    pub sample_b: Option<Template>,
    pub phase: EnrollmentPhase,
    pub failure: Option<FailureReason>,

    /// Capture quality threshold requested for the samples.
    pub capture_threshold: Option<u8>,

    // ── Timing ────────────────────────────────────────────────────────────
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Enrollment {
    /// An enrollment whose identity was created, awaiting the first sample.
    pub fn created(
        device_id: DeviceId,
        external_id: impl Into<String>,
        display_name: impl Into<String>,
        identity_id: IdentityId,
        ts: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id,
            external_id: external_id.into(),
            display_name: display_name.into(),
            identity_id: Some(identity_id),
            sample_a: None,
            sample_b: None,
            phase: EnrollmentPhase::AwaitingSampleA,
            failure: None,
            capture_threshold: None,
            started_at: ts,
            ended_at: None,
        }
    }

    /// An enrollment that never got an identity.
    pub fn failed_to_start(
        device_id: DeviceId,
        external_id: impl Into<String>,
        display_name: impl Into<String>,
        reason: FailureReason,
        ts: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id,
            external_id: external_id.into(),
            display_name: display_name.into(),
            identity_id: None,
            sample_a: None,
            sample_b: None,
            phase: EnrollmentPhase::Failed,
            failure: Some(reason),
            capture_threshold: None,
            started_at: ts,
            ended_at: Some(ts),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Check that a sample-delivered notification may trigger a capture.
    pub fn ensure_accepts_sample(&self) -> Result<(), InvalidPhaseTransition> {
        if self.phase.accepts_sample() {
            Ok(())
        } else {
            Err(InvalidPhaseTransition {
                from: Some(self.phase),
                event: "SampleDelivered",
                reason: "enrollment is not awaiting a sample".into(),
            })
        }
    }

    /// Apply an event, updating the phase.
    ///
    /// On error the enrollment is left untouched. Terminal phases reject
    /// every event.
    pub fn apply(&mut self, event: &EnrollmentEvent) -> Result<(), InvalidPhaseTransition> {
        let ts = event.ts;
        let name = event.kind.name();

        if self.phase.is_terminal() {
            return Err(InvalidPhaseTransition {
                from: Some(self.phase),
                event: name,
                reason: "enrollment has already ended".into(),
            });
        }

        match &event.kind {
            EnrollmentEventKind::SampleCaptured { template } => match self.phase {
                EnrollmentPhase::AwaitingSampleA => {
                    self.sample_a = Some(template.clone());
                    self.phase = EnrollmentPhase::AwaitingSampleB;
                }
                EnrollmentPhase::AwaitingSampleB => {
                    self.sample_b = Some(template.clone());
                    self.phase = EnrollmentPhase::DuplicateChecking;
                }
                _ => {
                    return Err(InvalidPhaseTransition {
                        from: Some(self.phase),
                        event: name,
                        reason: "enrollment is not awaiting a sample".into(),
                    });
                }
            },

            EnrollmentEventKind::DuplicateCheckPassed => {
                self.require(EnrollmentPhase::DuplicateChecking, name)?;
                self.phase = EnrollmentPhase::Committing;
            }

            EnrollmentEventKind::DuplicateFound => {
                self.require(EnrollmentPhase::DuplicateChecking, name)?;
                self.fail(FailureReason::DuplicateBiometric, ts);
            }

            EnrollmentEventKind::Committed => {
                self.require(EnrollmentPhase::Committing, name)?;
                self.phase = EnrollmentPhase::Completed;
                self.ended_at = Some(ts);
            }

            EnrollmentEventKind::Failed { reason } => {
                self.fail(*reason, ts);
            }
        }

        Ok(())
    }

    fn require(&self, phase: EnrollmentPhase, event: &'static str) -> Result<(), InvalidPhaseTransition> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(InvalidPhaseTransition {
                from: Some(self.phase),
                event,
                reason: format!("enrollment must be in phase '{}'", phase),
            })
        }
    }

    fn fail(&mut self, reason: FailureReason, ts: DateTime<Utc>) {
        self.phase = EnrollmentPhase::Failed;
        self.failure = Some(reason);
        self.ended_at = Some(ts);
    }

    /// Serializable summary without the template bytes.
    pub fn view(&self) -> EnrollmentView {
        EnrollmentView {
            device_id: self.device_id,
            external_id: self.external_id.clone(),
            display_name: self.display_name.clone(),
            identity_id: self.identity_id.clone(),
            phase: self.phase,
            failure: self.failure,
            has_sample_a: self.sample_a.is_some(),
            has_sample_b: self.sample_b.is_some(),
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }
}

/// Read-only enrollment summary for status queries and the control API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentView {
    pub device_id: DeviceId,
    pub external_id: String,
    pub display_name: String,
    pub identity_id: Option<IdentityId>,
    pub phase: EnrollmentPhase,
    pub failure: Option<FailureReason>,
    pub has_sample_a: bool,
    pub has_sample_b: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn event(kind: EnrollmentEventKind, timestamp: &str) -> EnrollmentEvent {
        EnrollmentEvent::with_ts(kind, ts(timestamp))
    }

    fn sample(bytes: &'static [u8]) -> EnrollmentEventKind {
        EnrollmentEventKind::SampleCaptured {
            template: Template::new(bytes),
        }
    }

    fn make_enrollment() -> Enrollment {
        Enrollment::created(
            DeviceId::new(7),
            "M-100",
            "Mario",
            IdentityId::new("bio-55"),
            ts("2024-01-15T10:00:00Z"),
        )
    }

    fn at_duplicate_check() -> Enrollment {
        let mut enrollment = make_enrollment();
        enrollment.apply(&event(sample(b"A"), "2024-01-15T10:00:01Z")).unwrap();
        enrollment.apply(&event(sample(b"B"), "2024-01-15T10:00:02Z")).unwrap();
        enrollment
    }

    // ── Happy Path ────────────────────────────────────────────────────────

    #[test]
    fn created_awaits_sample_a() {
        let enrollment = make_enrollment();
        assert_eq!(enrollment.phase, EnrollmentPhase::AwaitingSampleA);
        assert_eq!(enrollment.identity_id, Some(IdentityId::new("bio-55")));
        assert!(enrollment.ensure_accepts_sample().is_ok());
    }

    #[test]
    fn samples_fill_in_order() {
        let mut enrollment = make_enrollment();

        enrollment.apply(&event(sample(b"A"), "2024-01-15T10:00:01Z")).unwrap();
        assert_eq!(enrollment.phase, EnrollmentPhase::AwaitingSampleB);
        assert_eq!(enrollment.sample_a, Some(Template::new(&b"A"[..])));
        assert_eq!(enrollment.sample_b, None);

        enrollment.apply(&event(sample(b"B"), "2024-01-15T10:00:02Z")).unwrap();
        assert_eq!(enrollment.phase, EnrollmentPhase::DuplicateChecking);
        assert_eq!(enrollment.sample_b, Some(Template::new(&b"B"[..])));
    }

    #[test]
    fn full_workflow_completes() {
        let mut enrollment = at_duplicate_check();

        enrollment
            .apply(&event(EnrollmentEventKind::DuplicateCheckPassed, "2024-01-15T10:00:03Z"))
            .unwrap();
        assert_eq!(enrollment.phase, EnrollmentPhase::Committing);

        enrollment
            .apply(&event(EnrollmentEventKind::Committed, "2024-01-15T10:00:04Z"))
            .unwrap();
        assert_eq!(enrollment.phase, EnrollmentPhase::Completed);
        assert_eq!(enrollment.failure, None);
        assert_eq!(enrollment.ended_at, Some(ts("2024-01-15T10:00:04Z")));
    }

    // ── Failures ──────────────────────────────────────────────────────────

    #[test]
    fn duplicate_found_fails_without_commit() {
        let mut enrollment = at_duplicate_check();

        enrollment
            .apply(&event(EnrollmentEventKind::DuplicateFound, "2024-01-15T10:00:03Z"))
            .unwrap();
        assert_eq!(enrollment.phase, EnrollmentPhase::Failed);
        assert_eq!(enrollment.failure, Some(FailureReason::DuplicateBiometric));

        let err = enrollment
            .apply(&event(EnrollmentEventKind::Committed, "2024-01-15T10:00:04Z"))
            .unwrap_err();
        assert_eq!(err.from, Some(EnrollmentPhase::Failed));
    }

    #[test]
    fn failure_event_from_any_active_phase() {
        let mut enrollment = make_enrollment();
        enrollment
            .apply(&event(
                EnrollmentEventKind::Failed {
                    reason: FailureReason::CaptureFailed,
                },
                "2024-01-15T10:00:01Z",
            ))
            .unwrap();
        assert_eq!(enrollment.phase, EnrollmentPhase::Failed);
        assert_eq!(enrollment.failure, Some(FailureReason::CaptureFailed));
        assert_eq!(enrollment.ended_at, Some(ts("2024-01-15T10:00:01Z")));
    }

    #[test]
    fn failed_to_start_has_no_identity() {
        let enrollment = Enrollment::failed_to_start(
            DeviceId::new(7),
            "M-100",
            "Mario",
            FailureReason::IdentityCreateFailed,
            ts("2024-01-15T10:00:00Z"),
        );
        assert!(enrollment.is_terminal());
        assert_eq!(enrollment.identity_id, None);
        assert_eq!(enrollment.failure, Some(FailureReason::IdentityCreateFailed));
    }

    // ── Invalid Transitions ───────────────────────────────────────────────

    #[test]
    fn sample_after_completion_is_rejected_unchanged() {
        let mut enrollment = at_duplicate_check();
        enrollment
            .apply(&event(EnrollmentEventKind::DuplicateCheckPassed, "2024-01-15T10:00:03Z"))
            .unwrap();
        enrollment
            .apply(&event(EnrollmentEventKind::Committed, "2024-01-15T10:00:04Z"))
            .unwrap();
        let before = enrollment.clone();

        let err = enrollment
            .apply(&event(sample(b"C"), "2024-01-15T10:00:05Z"))
            .unwrap_err();
        assert_eq!(err.from, Some(EnrollmentPhase::Completed));
        assert_eq!(err.event, "SampleCaptured");
        assert_eq!(enrollment, before);
        assert!(enrollment.ensure_accepts_sample().is_err());
    }

    #[test]
    fn failure_event_cannot_reenter_terminal() {
        let mut enrollment = make_enrollment();
        enrollment
            .apply(&event(
                EnrollmentEventKind::Failed {
                    reason: FailureReason::CaptureFailed,
                },
                "2024-01-15T10:00:01Z",
            ))
            .unwrap();

        let err = enrollment
            .apply(&event(
                EnrollmentEventKind::Failed {
                    reason: FailureReason::CommitFailed,
                },
                "2024-01-15T10:00:02Z",
            ))
            .unwrap_err();
        assert_eq!(err.from, Some(EnrollmentPhase::Failed));
        assert_eq!(enrollment.failure, Some(FailureReason::CaptureFailed));
        assert_eq!(enrollment.ended_at, Some(ts("2024-01-15T10:00:01Z")));
    }

    #[test]
    fn commit_before_duplicate_check_is_rejected() {
        let mut enrollment = make_enrollment();
        let err = enrollment
            .apply(&event(EnrollmentEventKind::Committed, "2024-01-15T10:00:01Z"))
            .unwrap_err();
        assert_eq!(err.from, Some(EnrollmentPhase::AwaitingSampleA));
        assert_eq!(enrollment.phase, EnrollmentPhase::AwaitingSampleA);
    }

    #[test]
    fn sample_during_duplicate_check_is_rejected() {
        let mut enrollment = at_duplicate_check();
        assert!(enrollment.ensure_accepts_sample().is_err());
        assert!(enrollment
            .apply(&event(sample(b"C"), "2024-01-15T10:00:03Z"))
            .is_err());
        assert_eq!(enrollment.sample_b, Some(Template::new(&b"B"[..])));
    }

    #[test]
    fn error_message_names_phase() {
        let err = InvalidPhaseTransition::no_enrollment("SampleDelivered");
        assert_eq!(
            err.to_string(),
            "invalid phase transition: cannot apply 'SampleDelivered' without an enrollment: no enrollment has been started"
        );

        let mut enrollment = at_duplicate_check();
        let err = enrollment
            .apply(&event(EnrollmentEventKind::Committed, "2024-01-15T10:00:03Z"))
            .unwrap_err();
        assert!(err.to_string().contains("'duplicate_checking'"));
    }

    // ── Codes & Views ─────────────────────────────────────────────────────

    #[test]
    fn wire_codes_are_distinct_and_nonzero() {
        let phases = [
            EnrollmentPhase::AwaitingSampleA,
            EnrollmentPhase::AwaitingSampleB,
            EnrollmentPhase::DuplicateChecking,
            EnrollmentPhase::Committing,
            EnrollmentPhase::Completed,
            EnrollmentPhase::Failed,
        ];
        let mut codes: Vec<u8> = phases.iter().map(|p| p.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), phases.len());
        assert!(!codes.contains(&0));

        assert_eq!(FailureReason::DuplicateBiometric.code(), 0x03);
    }

    #[test]
    fn view_omits_templates() {
        let enrollment = at_duplicate_check();
        let view = enrollment.view();
        assert!(view.has_sample_a);
        assert!(view.has_sample_b);

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["phase"], "duplicate_checking");
        assert_eq!(json["identity_id"], "bio-55");
        assert!(json.get("sample_a").is_none());
    }
}
