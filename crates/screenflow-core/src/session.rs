//! The workflow session aggregate and its parts.
//!
//! A [`WorkflowSession`] is persisted as a whole; the engine is the only
//! writer. Methods here are pure queries and small helpers, all state
//! transitions live in the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identity::Participant;
use crate::ids::{ApprovalId, ParticipantId, PatientId, SessionId};
use crate::workflow::{
    ApprovalStatus, LockType, Priority, SessionStatus, StepStatus, WorkflowStep,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepComment {
    pub author: ParticipantId,
    pub author_name: String,
    pub text: String,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: WorkflowStep,
    pub status: StepStatus,
    pub assigned_to: Option<Participant>,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub requires_approval: bool,
    /// An approval was requested; the step completes once it is approved.
    #[serde(default)]
    pub pending_completion: bool,
    #[serde(default)]
    pub comments: Vec<StepComment>,
}

impl StepRecord {
    pub fn pending(step: WorkflowStep) -> Self {
        Self {
            step,
            status: StepStatus::Pending,
            assigned_to: None,
            data: Map::new(),
            started_at: None,
            completed_at: None,
            duration_secs: None,
            requires_approval: step.requires_approval(),
            pending_completion: false,
            comments: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub step: WorkflowStep,
    pub lock_type: LockType,
    pub reason: Option<String>,
    pub holder: Participant,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: ApprovalId,
    pub session_id: SessionId,
    pub step: WorkflowStep,
    pub requested_by: Participant,
    pub priority: Priority,
    pub payload: Value,
    pub status: ApprovalStatus,
    pub resolved_by: Option<Participant>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One end-to-end screening encounter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSession {
    pub session_id: SessionId,
    pub patient_id: PatientId,
    pub screening_type: String,
    pub current_step: WorkflowStep,
    pub overall_status: SessionStatus,
    pub workflow_steps: Vec<StepRecord>,
    pub active_participants: Vec<Participant>,
    pub all_participants: Vec<Participant>,
    pub lock: Option<LockRecord>,
    #[serde(default)]
    pub approvals: Vec<ApprovalRequest>,
    #[serde(default)]
    pub metadata: Value,
    /// Incremented by every committed mutation.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowSession {
    /// A fresh session with every canonical step pending.
    pub fn new(
        patient_id: PatientId,
        screening_type: impl Into<String>,
        initiator: Participant,
        metadata: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: SessionId::new(),
            patient_id,
            screening_type: screening_type.into(),
            current_step: WorkflowStep::Registration,
            overall_status: SessionStatus::Active,
            workflow_steps: WorkflowStep::ALL.into_iter().map(StepRecord::pending).collect(),
            active_participants: vec![initiator.clone()],
            all_participants: vec![initiator],
            lock: None,
            approvals: Vec::new(),
            metadata,
            version: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn step(&self, step: WorkflowStep) -> Option<&StepRecord> {
        self.workflow_steps.iter().find(|r| r.step == step)
    }

    pub fn step_mut(&mut self, step: WorkflowStep) -> Option<&mut StepRecord> {
        self.workflow_steps.iter_mut().find(|r| r.step == step)
    }

    pub fn is_terminal(&self) -> bool {
        self.overall_status.is_terminal()
    }

    /// First step, in canonical order, that is still pending or in progress.
    pub fn first_open_step(&self) -> Option<WorkflowStep> {
        WorkflowStep::ALL.into_iter().find(|s| {
            self.step(*s)
                .is_some_and(|record| record.status.is_open())
        })
    }

    /// The lock, if one is held and has not expired.
    pub fn active_lock(&self, now: DateTime<Utc>) -> Option<&LockRecord> {
        self.lock.as_ref().filter(|l| !l.is_expired(now))
    }

    /// The active lock when it is held by someone other than `actor`.
    pub fn locked_by_other(&self, actor: &ParticipantId, now: DateTime<Utc>) -> Option<&LockRecord> {
        self.active_lock(now).filter(|l| &l.holder.id != actor)
    }

    /// Read view with lazily-expired locks dropped. Never written back.
    pub fn effective(&self, now: DateTime<Utc>) -> WorkflowSession {
        let mut view = self.clone();
        if view.lock.as_ref().is_some_and(|l| l.is_expired(now)) {
            view.lock = None;
            if view.overall_status == SessionStatus::Locked {
                view.overall_status = SessionStatus::Active;
            }
        }
        view
    }

    pub fn approval(&self, id: &ApprovalId) -> Option<&ApprovalRequest> {
        self.approvals.iter().find(|a| &a.request_id == id)
    }

    pub fn approval_mut(&mut self, id: &ApprovalId) -> Option<&mut ApprovalRequest> {
        self.approvals.iter_mut().find(|a| &a.request_id == id)
    }

    pub fn has_approved_request(&self, step: WorkflowStep) -> bool {
        self.approvals
            .iter()
            .any(|a| a.step == step && a.status == ApprovalStatus::Approved)
    }

    pub fn pending_request_for(&self, step: WorkflowStep) -> Option<&ApprovalRequest> {
        self.approvals
            .iter()
            .find(|a| a.step == step && a.status == ApprovalStatus::Pending)
    }

    pub fn is_active_participant(&self, id: &ParticipantId) -> bool {
        self.active_participants.iter().any(|p| &p.id == id)
    }

    /// Mark `participant` active. Returns true if they were not active before.
    pub fn add_participant(&mut self, participant: &Participant) -> bool {
        if !self.all_participants.iter().any(|p| p.id == participant.id) {
            self.all_participants.push(participant.clone());
        }
        if self.is_active_participant(&participant.id) {
            return false;
        }
        self.active_participants.push(participant.clone());
        true
    }

    /// Returns true if the participant was active.
    pub fn remove_participant(&mut self, id: &ParticipantId) -> bool {
        let before = self.active_participants.len();
        self.active_participants.retain(|p| &p.id != id);
        before != self.active_participants.len()
    }

    /// Canonical JSON used for audit diffs: steps and approvals keyed by
    /// name/id, participants reduced to ids, bookkeeping fields omitted.
    pub fn audit_view(&self) -> Value {
        let steps: Map<String, Value> = self
            .workflow_steps
            .iter()
            .map(|r| {
                (
                    r.step.as_str().to_string(),
                    serde_json::to_value(r).unwrap_or(Value::Null),
                )
            })
            .collect();
        let approvals: Map<String, Value> = self
            .approvals
            .iter()
            .map(|a| {
                (
                    a.request_id.to_string(),
                    serde_json::to_value(a).unwrap_or(Value::Null),
                )
            })
            .collect();
        let ids = |ps: &[Participant]| -> Value {
            ps.iter().map(|p| Value::String(p.id.to_string())).collect()
        };

        serde_json::json!({
            "current_step": self.current_step,
            "overall_status": self.overall_status,
            "lock": self.lock,
            "steps": steps,
            "approvals": approvals,
            "active_participants": ids(&self.active_participants),
            "all_participants": ids(&self.all_participants),
            "metadata": self.metadata,
        })
    }

    /// Checks the structural invariants of the aggregate.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.workflow_steps.len() != WorkflowStep::ALL.len() {
            return Err(format!("expected 9 steps, found {}", self.workflow_steps.len()));
        }
        for (record, step) in self.workflow_steps.iter().zip(WorkflowStep::ALL) {
            if record.step != step {
                return Err(format!("step {} out of canonical order", record.step));
            }
            if record.step.requires_approval()
                && record.status == StepStatus::Completed
                && !self.has_approved_request(record.step)
            {
                return Err(format!("{} completed without approval", record.step));
            }
        }
        if !self.is_terminal() {
            match self.first_open_step() {
                Some(open) if open == self.current_step => {}
                other => {
                    return Err(format!(
                        "current_step {} but first open step is {other:?}",
                        self.current_step
                    ))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Role;
    use chrono::Duration;

    fn clerk() -> Participant {
        Participant::new("clerk-1", "Ama Mensah", Role::RegistrationClerk)
    }

    fn session() -> WorkflowSession {
        WorkflowSession::new(
            PatientId::from_raw("pat-1"),
            "hospital_mobile_unit",
            clerk(),
            serde_json::json!({}),
            Utc::now(),
        )
    }

    #[test]
    fn new_session_has_nine_pending_steps() {
        let s = session();
        assert_eq!(s.workflow_steps.len(), 9);
        assert!(s.workflow_steps.iter().all(|r| r.status == StepStatus::Pending));
        assert_eq!(s.current_step, WorkflowStep::Registration);
        assert_eq!(s.overall_status, SessionStatus::Active);
        assert_eq!(s.active_participants.len(), 1);
        assert!(s.check_invariants().is_ok());
    }

    #[test]
    fn approval_flags_follow_step() {
        let s = session();
        let flagged: Vec<_> = s
            .workflow_steps
            .iter()
            .filter(|r| r.requires_approval)
            .map(|r| r.step)
            .collect();
        assert_eq!(
            flagged,
            [
                WorkflowStep::DoctorDiagnosis,
                WorkflowStep::Prescription,
                WorkflowStep::FinalApproval
            ]
        );
    }

    #[test]
    fn effective_view_drops_expired_lock() {
        let mut s = session();
        let now = Utc::now();
        s.lock = Some(LockRecord {
            step: WorkflowStep::Registration,
            lock_type: LockType::Editing,
            reason: None,
            holder: clerk(),
            acquired_at: now - Duration::minutes(20),
            expires_at: now - Duration::minutes(5),
        });
        s.overall_status = SessionStatus::Locked;

        assert!(s.active_lock(now).is_none());
        let view = s.effective(now);
        assert!(view.lock.is_none());
        assert_eq!(view.overall_status, SessionStatus::Active);
        // Original untouched.
        assert!(s.lock.is_some());
    }

    #[test]
    fn locked_by_other_ignores_holder() {
        let mut s = session();
        let now = Utc::now();
        s.lock = Some(LockRecord {
            step: WorkflowStep::Registration,
            lock_type: LockType::Review,
            reason: Some("checking insurance".into()),
            holder: clerk(),
            acquired_at: now,
            expires_at: now + Duration::minutes(10),
        });
        assert!(s.locked_by_other(&ParticipantId::from_raw("clerk-1"), now).is_none());
        assert!(s.locked_by_other(&ParticipantId::from_raw("tech-1"), now).is_some());
    }

    #[test]
    fn participants_are_tracked_historically() {
        let mut s = session();
        let tech = Participant::new("tech-1", "Kofi", Role::Technician);
        assert!(s.add_participant(&tech));
        assert!(!s.add_participant(&tech));
        assert!(s.remove_participant(&tech.id));
        assert!(!s.remove_participant(&tech.id));
        assert_eq!(s.active_participants.len(), 1);
        assert_eq!(s.all_participants.len(), 2);
    }

    #[test]
    fn invariant_detects_stale_current_step() {
        let mut s = session();
        s.workflow_steps[0].status = StepStatus::Completed;
        assert!(s.check_invariants().is_err());
        s.current_step = WorkflowStep::InitialAssessment;
        assert!(s.check_invariants().is_ok());
    }

    #[test]
    fn audit_view_keys_steps_by_name() {
        let s = session();
        let view = s.audit_view();
        assert_eq!(view["steps"]["prescription"]["requires_approval"], true);
        assert_eq!(view["active_participants"][0], "clerk-1");
        assert!(view.get("version").is_none());
    }
}
