//! Pure state transitions of a workflow session.
//!
//! Each function validates an operation against the current session,
//! mutates it in place and describes what happened. Nothing here touches
//! the store or the event channel; a failed validation leaves the session
//! as it was apart from lazily-expired locks, which the caller discards.

use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use screenflow_core::activity::ActivityAction;
use screenflow_core::events::WorkflowEvent;
use screenflow_core::identity::Participant;
use screenflow_core::ids::ApprovalId;
use screenflow_core::session::{ApprovalRequest, LockRecord, StepComment, WorkflowSession};
use screenflow_core::workflow::{
    ApprovalDecision, ApprovalStatus, LockType, Priority, SessionStatus, StepStatus, WorkflowStep,
};
use screenflow_core::WorkflowError;

use crate::config::EngineConfig;
use crate::policy;

pub const MAX_PATCH_KEYS: usize = 200;
pub const MAX_TEXT_LEN: usize = 4000;

// `.` is reserved as the audit diff path separator.
static PATCH_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_-]{0,63}$").expect("patch key pattern is valid")
});

/// Body of a step update.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct StepUpdate {
    /// Per-key patch: a key replaces the stored value, `null` removes it.
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub complete_step: bool,
    #[serde(default, alias = "comments")]
    pub comment: Option<String>,
    /// Reject the update if the session moved past this version.
    #[serde(default)]
    pub expected_version: Option<i64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LockRequest {
    pub step: WorkflowStep,
    #[serde(default)]
    pub lock_type: LockType,
    #[serde(default)]
    pub reason: Option<String>,
    /// Falls back to the configured default.
    #[serde(default)]
    pub duration_minutes: Option<u32>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ApprovalSubmission {
    pub step: WorkflowStep,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: Priority,
}

/// A mutation routed to a session actor.
#[derive(Clone, Debug)]
pub enum Operation {
    UpdateStep {
        step: WorkflowStep,
        update: StepUpdate,
    },
    RequestLock(LockRequest),
    ReleaseLock,
    RequestApproval(ApprovalSubmission),
    ResolveApproval {
        request_id: ApprovalId,
        decision: ApprovalDecision,
        notes: Option<String>,
    },
    Cancel {
        reason: Option<String>,
    },
    Join,
    Leave,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::UpdateStep { .. } => "update_step",
            Self::RequestLock(_) => "request_lock",
            Self::ReleaseLock => "release_lock",
            Self::RequestApproval(_) => "request_approval",
            Self::ResolveApproval { .. } => "resolve_approval",
            Self::Cancel { .. } => "cancel_session",
            Self::Join => "join_session",
            Self::Leave => "leave_session",
        }
    }
}

/// What an applied operation did, minus the diff.
#[derive(Debug)]
pub struct Mutation {
    pub action: ActivityAction,
    pub step: Option<WorkflowStep>,
    pub comment: Option<String>,
    /// Events beyond the `session_update` / `session_activity_logged` pair.
    pub events: Vec<WorkflowEvent>,
    /// Approval created or resolved by this mutation.
    pub approval: Option<ApprovalId>,
}

impl Mutation {
    fn new(action: ActivityAction, step: Option<WorkflowStep>) -> Self {
        Self {
            action,
            step,
            comment: None,
            events: Vec::new(),
            approval: None,
        }
    }
}

/// Apply `op` to `session`. `Ok(None)` means the operation was a no-op
/// (e.g. joining twice) and nothing should be committed.
pub fn apply(
    session: &mut WorkflowSession,
    op: &Operation,
    actor: &Participant,
    now: DateTime<Utc>,
    config: &EngineConfig,
) -> Result<Option<Mutation>, WorkflowError> {
    let mutation = match op {
        Operation::UpdateStep { step, update } => update_step(session, *step, actor, update, now)?,
        Operation::RequestLock(req) => request_lock(session, actor, req, now, config)?,
        Operation::ReleaseLock => release_lock(session, actor, now)?,
        Operation::RequestApproval(sub) => request_approval(session, actor, sub, now)?,
        Operation::ResolveApproval {
            request_id,
            decision,
            notes,
        } => resolve_approval(session, actor, request_id, *decision, notes.as_deref(), now)?,
        Operation::Cancel { reason } => cancel(session, actor, reason.as_deref(), now)?,
        Operation::Join => match join(session, actor)? {
            Some(m) => m,
            None => return Ok(None),
        },
        Operation::Leave => match leave(session, actor)? {
            Some(m) => m,
            None => return Ok(None),
        },
    };
    refresh_status(session, now);
    Ok(Some(mutation))
}

// ── Guards ──────────────────────────────────────────────────────────────────

fn ensure_open(session: &WorkflowSession) -> Result<(), WorkflowError> {
    if session.is_terminal() {
        return Err(WorkflowError::Conflict(format!(
            "session {} is {}",
            session.session_id, session.overall_status
        )));
    }
    Ok(())
}

fn ensure_owner(actor: &Participant, step: WorkflowStep) -> Result<(), WorkflowError> {
    if !policy::can_work(actor.role, step) {
        return Err(WorkflowError::Authorization(format!(
            "role {} cannot work step {step}",
            actor.role
        )));
    }
    Ok(())
}

fn ensure_not_locked_by_other(
    session: &WorkflowSession,
    actor: &Participant,
    now: DateTime<Utc>,
) -> Result<(), WorkflowError> {
    if let Some(lock) = session.locked_by_other(&actor.id, now) {
        return Err(WorkflowError::Conflict(format!(
            "session is locked by {} until {}",
            lock.holder.name,
            lock.expires_at.to_rfc3339()
        )));
    }
    Ok(())
}

fn validate_text(field: &str, text: Option<&str>) -> Result<(), WorkflowError> {
    match text {
        Some(t) if t.chars().count() > MAX_TEXT_LEN => Err(WorkflowError::Validation(format!(
            "{field} exceeds {MAX_TEXT_LEN} characters"
        ))),
        _ => Ok(()),
    }
}

pub fn validate_patch(data: &Map<String, Value>) -> Result<(), WorkflowError> {
    if data.len() > MAX_PATCH_KEYS {
        return Err(WorkflowError::Validation(format!(
            "data patch has {} keys, at most {MAX_PATCH_KEYS} allowed",
            data.len()
        )));
    }
    if let Some(bad) = data.keys().find(|k| !PATCH_KEY.is_match(k)) {
        return Err(WorkflowError::Validation(format!("invalid data key: {bad:?}")));
    }
    Ok(())
}

/// Drop an expired lock. Returns true if one was dropped.
pub fn expire_lock(session: &mut WorkflowSession, now: DateTime<Utc>) -> bool {
    if session.lock.as_ref().is_some_and(|l| l.is_expired(now)) {
        session.lock = None;
        return true;
    }
    false
}

/// Keep `overall_status` consistent with the lock for open sessions.
fn refresh_status(session: &mut WorkflowSession, now: DateTime<Utc>) {
    if session.is_terminal() {
        return;
    }
    session.overall_status = if session.active_lock(now).is_some() {
        SessionStatus::Locked
    } else {
        SessionStatus::Active
    };
}

// ── Shared effects ──────────────────────────────────────────────────────────

fn start_step(session: &mut WorkflowSession, step: WorkflowStep, now: DateTime<Utc>) -> bool {
    match session.step_mut(step) {
        Some(record) if record.status == StepStatus::Pending => {
            record.status = StepStatus::InProgress;
            record.started_at = Some(now);
            true
        }
        _ => false,
    }
}

/// Mark `step` completed, advance `current_step` and close the session
/// after the last step. Returns the events describing the completion.
fn complete_step(
    session: &mut WorkflowSession,
    step: WorkflowStep,
    by: &Participant,
    now: DateTime<Utc>,
) -> Vec<WorkflowEvent> {
    let mut events = Vec::new();
    if let Some(record) = session.step_mut(step) {
        let started = *record.started_at.get_or_insert(now);
        record.status = StepStatus::Completed;
        record.completed_at = Some(now);
        record.duration_secs = Some((now - started).num_seconds().max(0));
        record.pending_completion = false;
    }

    let next = session.first_open_step();
    match next {
        Some(next) => session.current_step = next,
        None => {
            session.overall_status = SessionStatus::Completed;
            session.completed_at = Some(now);
        }
    }

    // A lock on a finished step (or a finished session) protects nothing.
    let release = session
        .lock
        .as_ref()
        .is_some_and(|l| l.step == step || next.is_none());
    if release {
        if let Some(lock) = session.lock.take() {
            events.push(WorkflowEvent::LockChanged {
                session_id: session.session_id.clone(),
                lock: None,
                changed_by: by.clone(),
                displaced_holder: (lock.holder.id != by.id).then(|| lock.holder.id.clone()),
            });
        }
    }

    events.insert(
        0,
        WorkflowEvent::StepCompleted {
            session_id: session.session_id.clone(),
            step,
            next_step: next,
            completed_by: by.clone(),
        },
    );
    events
}

// ── Operations ──────────────────────────────────────────────────────────────

fn update_step(
    session: &mut WorkflowSession,
    step: WorkflowStep,
    actor: &Participant,
    update: &StepUpdate,
    now: DateTime<Utc>,
) -> Result<Mutation, WorkflowError> {
    validate_patch(&update.data)?;
    validate_text("comment", update.comment.as_deref())?;
    ensure_open(session)?;
    ensure_owner(actor, step)?;

    if let Some(expected) = update.expected_version {
        if expected != session.version {
            return Err(WorkflowError::Conflict(format!(
                "session is at version {}, expected {expected}",
                session.version
            )));
        }
    }

    expire_lock(session, now);
    ensure_not_locked_by_other(session, actor, now)?;

    let status = session
        .step(step)
        .map(|r| r.status)
        .ok_or_else(|| WorkflowError::Internal(format!("session has no record for {step}")))?;
    if !status.is_open() {
        return Err(WorkflowError::Conflict(format!("step {step} is already closed")));
    }
    if update.complete_step {
        if step != session.current_step {
            return Err(WorkflowError::Conflict(format!(
                "cannot complete {step}: current step is {}",
                session.current_step
            )));
        }
        if step.requires_approval() && !session.has_approved_request(step) {
            return Err(WorkflowError::Conflict(format!(
                "step {step} requires an approved approval request"
            )));
        }
    }

    let started = start_step(session, step, now);
    if let Some(record) = session.step_mut(step) {
        for (key, value) in &update.data {
            if value.is_null() {
                let _ = record.data.remove(key);
            } else {
                let _ = record.data.insert(key.clone(), value.clone());
            }
        }
        record.assigned_to = Some(actor.clone());
        if let Some(text) = update.comment.as_deref().filter(|t| !t.trim().is_empty()) {
            record.comments.push(StepComment {
                author: actor.id.clone(),
                author_name: actor.name.clone(),
                text: text.to_string(),
                at: now,
            });
        }
    }
    let _ = session.add_participant(actor);

    let action = if update.complete_step {
        ActivityAction::Completed
    } else if started {
        ActivityAction::StepStarted
    } else {
        ActivityAction::StepUpdated
    };
    let mut mutation = Mutation::new(action, Some(step));
    mutation.comment = update.comment.clone();
    if update.complete_step {
        mutation.events = complete_step(session, step, actor, now);
    }
    Ok(mutation)
}

fn request_lock(
    session: &mut WorkflowSession,
    actor: &Participant,
    req: &LockRequest,
    now: DateTime<Utc>,
    config: &EngineConfig,
) -> Result<Mutation, WorkflowError> {
    let minutes = req.duration_minutes.unwrap_or(config.default_lock_minutes);
    if minutes == 0 || minutes > config.max_lock_minutes {
        return Err(WorkflowError::Validation(format!(
            "lock duration must be 1..={} minutes, got {minutes}",
            config.max_lock_minutes
        )));
    }
    validate_text("reason", req.reason.as_deref())?;
    ensure_open(session)?;
    if !actor.role.is_supervisor_class() {
        ensure_owner(actor, req.step)?;
    }

    expire_lock(session, now);
    if let Some(existing) = &session.lock {
        return Err(WorkflowError::Conflict(format!(
            "session already locked by {} on {}",
            existing.holder.name, existing.step
        )));
    }

    let lock = LockRecord {
        step: req.step,
        lock_type: req.lock_type,
        reason: req.reason.clone(),
        holder: actor.clone(),
        acquired_at: now,
        expires_at: now + Duration::minutes(i64::from(minutes)),
    };
    session.lock = Some(lock.clone());
    let _ = session.add_participant(actor);

    let mut mutation = Mutation::new(ActivityAction::LockAcquired, Some(req.step));
    mutation.comment = req.reason.clone();
    mutation.events.push(WorkflowEvent::LockChanged {
        session_id: session.session_id.clone(),
        lock: Some(lock),
        changed_by: actor.clone(),
        displaced_holder: None,
    });
    Ok(mutation)
}

fn release_lock(
    session: &mut WorkflowSession,
    actor: &Participant,
    now: DateTime<Utc>,
) -> Result<Mutation, WorkflowError> {
    ensure_open(session)?;
    expire_lock(session, now);

    let lock = session
        .lock
        .as_ref()
        .ok_or_else(|| WorkflowError::NotFound(format!("no active lock on session {}", session.session_id)))?;
    if lock.holder.id != actor.id && !actor.role.is_supervisor_class() {
        return Err(WorkflowError::Authorization(format!(
            "lock is held by {}",
            lock.holder.name
        )));
    }

    let step = lock.step;
    let holder = lock.holder.id.clone();
    session.lock = None;

    let mut mutation = Mutation::new(ActivityAction::LockReleased, Some(step));
    mutation.events.push(WorkflowEvent::LockChanged {
        session_id: session.session_id.clone(),
        lock: None,
        changed_by: actor.clone(),
        displaced_holder: (holder != actor.id).then_some(holder),
    });
    Ok(mutation)
}

fn request_approval(
    session: &mut WorkflowSession,
    actor: &Participant,
    sub: &ApprovalSubmission,
    now: DateTime<Utc>,
) -> Result<Mutation, WorkflowError> {
    let step = sub.step;
    if !step.requires_approval() {
        return Err(WorkflowError::Validation(format!("step {step} does not take approvals")));
    }
    ensure_open(session)?;
    ensure_owner(actor, step)?;
    expire_lock(session, now);
    ensure_not_locked_by_other(session, actor, now)?;

    if session.step(step).is_some_and(|r| !r.status.is_open()) {
        return Err(WorkflowError::Conflict(format!("step {step} is already closed")));
    }
    if let Some(pending) = session.pending_request_for(step) {
        return Err(WorkflowError::Conflict(format!(
            "approval {} is already pending for {step}",
            pending.request_id
        )));
    }

    let request = ApprovalRequest {
        request_id: ApprovalId::new(),
        session_id: session.session_id.clone(),
        step,
        requested_by: actor.clone(),
        priority: sub.priority,
        payload: sub.payload.clone(),
        status: ApprovalStatus::Pending,
        resolved_by: None,
        resolved_at: None,
        notes: None,
        created_at: now,
    };
    let request_id = request.request_id.clone();

    start_step(session, step, now);
    if let Some(record) = session.step_mut(step) {
        record.pending_completion = true;
        record.assigned_to = Some(actor.clone());
    }
    session.approvals.push(request.clone());
    let _ = session.add_participant(actor);

    let mut mutation = Mutation::new(ActivityAction::ApprovalRequested, Some(step));
    mutation.approval = Some(request_id);
    mutation.events.push(WorkflowEvent::ApprovalRequested {
        request: Box::new(request),
    });
    Ok(mutation)
}

fn resolve_approval(
    session: &mut WorkflowSession,
    actor: &Participant,
    request_id: &ApprovalId,
    decision: ApprovalDecision,
    notes: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Mutation, WorkflowError> {
    validate_text("notes", notes)?;
    let request = session
        .approval(request_id)
        .ok_or_else(|| WorkflowError::NotFound(format!("approval request {request_id}")))?;
    let step = request.step;
    ensure_open(session)?;
    if request.status != ApprovalStatus::Pending {
        return Err(WorkflowError::Conflict(format!(
            "approval request {request_id} is already resolved"
        )));
    }
    if !policy::can_approve(actor.role, step) {
        return Err(WorkflowError::Authorization(format!(
            "role {} cannot resolve approvals for {step}",
            actor.role
        )));
    }
    expire_lock(session, now);

    if let Some(request) = session.approval_mut(request_id) {
        request.status = decision.into();
        request.resolved_by = Some(actor.clone());
        request.resolved_at = Some(now);
        request.notes = notes.map(str::to_string);
    }
    let _ = session.add_participant(actor);

    let completes = decision == ApprovalDecision::Approved
        && step == session.current_step
        && session.step(step).is_some_and(|r| r.pending_completion);

    let mut events = Vec::new();
    match decision {
        ApprovalDecision::Approved if completes => {
            events = complete_step(session, step, actor, now);
        }
        ApprovalDecision::Approved => {}
        ApprovalDecision::Rejected => {
            if let Some(record) = session.step_mut(step) {
                record.pending_completion = false;
            }
        }
    }

    if let Some(resolved) = session.approval(request_id) {
        events.insert(
            0,
            WorkflowEvent::ApprovalResolved {
                request: Box::new(resolved.clone()),
            },
        );
    }

    let action = match decision {
        ApprovalDecision::Approved => ActivityAction::ApprovalApproved,
        ApprovalDecision::Rejected => ActivityAction::ApprovalRejected,
    };
    let mut mutation = Mutation::new(action, Some(step));
    mutation.comment = notes.map(str::to_string);
    mutation.events = events;
    mutation.approval = Some(request_id.clone());
    Ok(mutation)
}

fn cancel(
    session: &mut WorkflowSession,
    actor: &Participant,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Mutation, WorkflowError> {
    validate_text("reason", reason)?;
    ensure_open(session)?;
    if !actor.role.is_supervisor_class() {
        return Err(WorkflowError::Authorization(
            "only supervisors may cancel a session".into(),
        ));
    }

    for record in &mut session.workflow_steps {
        if record.status.is_open() {
            record.status = StepStatus::Rejected;
            record.pending_completion = false;
        }
    }
    for request in &mut session.approvals {
        if request.status == ApprovalStatus::Pending {
            request.status = ApprovalStatus::Rejected;
            request.resolved_by = Some(actor.clone());
            request.resolved_at = Some(now);
            request.notes = Some("session cancelled".to_string());
        }
    }

    let mut mutation = Mutation::new(ActivityAction::Cancelled, None);
    if let Some(lock) = session.lock.take() {
        if !lock.is_expired(now) {
            mutation.events.push(WorkflowEvent::LockChanged {
                session_id: session.session_id.clone(),
                lock: None,
                changed_by: actor.clone(),
                displaced_holder: (lock.holder.id != actor.id).then(|| lock.holder.id.clone()),
            });
        }
    }
    session.overall_status = SessionStatus::Cancelled;
    mutation.comment = reason.map(str::to_string);
    Ok(mutation)
}

fn join(session: &mut WorkflowSession, actor: &Participant) -> Result<Option<Mutation>, WorkflowError> {
    ensure_open(session)?;
    if !session.add_participant(actor) {
        return Ok(None);
    }
    let mut mutation = Mutation::new(ActivityAction::Joined, None);
    mutation.events.push(WorkflowEvent::UserJoined {
        session_id: session.session_id.clone(),
        participant: actor.clone(),
    });
    Ok(Some(mutation))
}

fn leave(session: &mut WorkflowSession, actor: &Participant) -> Result<Option<Mutation>, WorkflowError> {
    ensure_open(session)?;
    if !session.remove_participant(&actor.id) {
        return Ok(None);
    }
    let mut mutation = Mutation::new(ActivityAction::Left, None);
    mutation.events.push(WorkflowEvent::UserLeft {
        session_id: session.session_id.clone(),
        participant: actor.clone(),
    });
    Ok(Some(mutation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use screenflow_core::identity::Role;
    use screenflow_core::ids::PatientId;

    fn clerk() -> Participant {
        Participant::new("clerk-1", "Ama", Role::RegistrationClerk)
    }
    fn tech() -> Participant {
        Participant::new("tech-1", "Kofi", Role::Technician)
    }
    fn doctor() -> Participant {
        Participant::new("doc-1", "Dr. Osei", Role::Doctor)
    }
    fn supervisor() -> Participant {
        Participant::new("sup-1", "Abena", Role::Supervisor)
    }

    fn session(now: DateTime<Utc>) -> WorkflowSession {
        WorkflowSession::new(
            PatientId::from_raw("pat-1"),
            "hospital_mobile_unit",
            clerk(),
            Value::Null,
            now,
        )
    }

    fn run(
        s: &mut WorkflowSession,
        op: Operation,
        actor: &Participant,
        now: DateTime<Utc>,
    ) -> Result<Option<Mutation>, WorkflowError> {
        apply(s, &op, actor, now, &EngineConfig::default())
    }

    fn complete(step: WorkflowStep) -> Operation {
        Operation::UpdateStep {
            step,
            update: StepUpdate {
                complete_step: true,
                ..Default::default()
            },
        }
    }

    fn patch(step: WorkflowStep, data: Value) -> Operation {
        let Value::Object(data) = data else {
            panic!("patch must be an object")
        };
        Operation::UpdateStep {
            step,
            update: StepUpdate {
                data,
                ..Default::default()
            },
        }
    }

    /// Walk the session up to (not including) `target`.
    fn advance_to(s: &mut WorkflowSession, target: WorkflowStep, now: DateTime<Utc>) {
        while s.current_step != target {
            let step = s.current_step;
            let actor = match step {
                WorkflowStep::Registration => clerk(),
                WorkflowStep::DoctorDiagnosis | WorkflowStep::Prescription => doctor(),
                WorkflowStep::InitialAssessment
                | WorkflowStep::VisionTesting
                | WorkflowStep::AutoRefraction
                | WorkflowStep::ClinicalEvaluation => tech(),
                _ => supervisor(),
            };
            if step.requires_approval() {
                let m = run(
                    s,
                    Operation::RequestApproval(ApprovalSubmission {
                        step,
                        payload: Value::Null,
                        priority: Priority::Normal,
                    }),
                    &actor,
                    now,
                )
                .unwrap()
                .unwrap();
                run(
                    s,
                    Operation::ResolveApproval {
                        request_id: m.approval.unwrap(),
                        decision: ApprovalDecision::Approved,
                        notes: None,
                    },
                    &supervisor(),
                    now,
                )
                .unwrap();
            } else {
                run(s, complete(step), &actor, now).unwrap();
            }
        }
    }

    #[test]
    fn completing_registration_advances() {
        let now = Utc::now();
        let mut s = session(now);
        let m = run(&mut s, complete(WorkflowStep::Registration), &clerk(), now)
            .unwrap()
            .unwrap();
        assert_eq!(m.action, ActivityAction::Completed);
        assert_eq!(s.current_step, WorkflowStep::InitialAssessment);
        assert_eq!(s.step(WorkflowStep::Registration).unwrap().status, StepStatus::Completed);
        assert!(matches!(m.events[0], WorkflowEvent::StepCompleted { next_step: Some(WorkflowStep::InitialAssessment), .. }));
        s.check_invariants().unwrap();
    }

    #[test]
    fn second_completion_conflicts_without_advancing() {
        let now = Utc::now();
        let mut s = session(now);
        run(&mut s, complete(WorkflowStep::Registration), &clerk(), now).unwrap();
        let err = run(&mut s, complete(WorkflowStep::Registration), &clerk(), now).unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict(_)));
        assert_eq!(s.current_step, WorkflowStep::InitialAssessment);
    }

    #[test]
    fn first_patch_starts_step_then_updates() {
        let now = Utc::now();
        let mut s = session(now);
        let m = run(&mut s, patch(WorkflowStep::Registration, serde_json::json!({"name": "Yaw"})), &clerk(), now)
            .unwrap()
            .unwrap();
        assert_eq!(m.action, ActivityAction::StepStarted);
        let m = run(&mut s, patch(WorkflowStep::Registration, serde_json::json!({"age": 9})), &clerk(), now)
            .unwrap()
            .unwrap();
        assert_eq!(m.action, ActivityAction::StepUpdated);

        let record = s.step(WorkflowStep::Registration).unwrap();
        assert_eq!(record.status, StepStatus::InProgress);
        assert_eq!(record.data.get("name"), Some(&serde_json::json!("Yaw")));
        assert_eq!(record.data.get("age"), Some(&serde_json::json!(9)));
    }

    #[test]
    fn null_removes_key_and_absent_keys_survive() {
        let now = Utc::now();
        let mut s = session(now);
        run(&mut s, patch(WorkflowStep::Registration, serde_json::json!({"a": 1, "b": 2})), &clerk(), now).unwrap();
        run(&mut s, patch(WorkflowStep::Registration, serde_json::json!({"a": null, "c": 3})), &clerk(), now).unwrap();
        let data = &s.step(WorkflowStep::Registration).unwrap().data;
        assert!(!data.contains_key("a"));
        assert_eq!(data.get("b"), Some(&serde_json::json!(2)));
        assert_eq!(data.get("c"), Some(&serde_json::json!(3)));
    }

    #[test]
    fn wrong_role_is_unauthorized() {
        let now = Utc::now();
        let mut s = session(now);
        let err = run(&mut s, complete(WorkflowStep::Registration), &tech(), now).unwrap_err();
        assert!(matches!(err, WorkflowError::Authorization(_)));
    }

    #[test]
    fn only_current_step_can_complete() {
        let now = Utc::now();
        let mut s = session(now);
        let err = run(&mut s, complete(WorkflowStep::VisionTesting), &tech(), now).unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict(_)));

        // Working ahead without completing is fine.
        run(&mut s, patch(WorkflowStep::VisionTesting, serde_json::json!({"od": "20/20"})), &tech(), now).unwrap();
        assert_eq!(s.current_step, WorkflowStep::Registration);
        s.check_invariants().unwrap();
    }

    #[test]
    fn patch_validation() {
        let now = Utc::now();
        let mut s = session(now);
        let err = run(&mut s, patch(WorkflowStep::Registration, serde_json::json!({"9lives": 1})), &clerk(), now)
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));

        let big: Map<String, Value> = (0..=MAX_PATCH_KEYS).map(|i| (format!("k{i}"), Value::from(i))).collect();
        let err = run(&mut s, patch(WorkflowStep::Registration, Value::Object(big)), &clerk(), now).unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));

        let op = Operation::UpdateStep {
            step: WorkflowStep::Registration,
            update: StepUpdate {
                comment: Some("x".repeat(MAX_TEXT_LEN + 1)),
                ..Default::default()
            },
        };
        assert!(matches!(run(&mut s, op, &clerk(), now), Err(WorkflowError::Validation(_))));
    }

    #[test]
    fn stale_expected_version_conflicts() {
        let now = Utc::now();
        let mut s = session(now);
        s.version = 4;
        let op = Operation::UpdateStep {
            step: WorkflowStep::Registration,
            update: StepUpdate {
                expected_version: Some(3),
                ..Default::default()
            },
        };
        assert!(matches!(run(&mut s, op, &clerk(), now), Err(WorkflowError::Conflict(_))));
    }

    #[test]
    fn lock_blocks_others_but_not_holder() {
        let now = Utc::now();
        let mut s = session(now);
        advance_to(&mut s, WorkflowStep::DoctorDiagnosis, now);

        let lock = Operation::RequestLock(LockRequest {
            step: WorkflowStep::DoctorDiagnosis,
            lock_type: LockType::Editing,
            reason: Some("reviewing fundus images".into()),
            duration_minutes: None,
        });
        run(&mut s, lock.clone(), &doctor(), now).unwrap();
        assert_eq!(s.overall_status, SessionStatus::Locked);
        assert_eq!(
            s.lock.as_ref().unwrap().expires_at - now,
            Duration::minutes(30)
        );

        let other = Participant::new("doc-2", "Dr. Mensah", Role::Doctor);
        let op = patch(WorkflowStep::DoctorDiagnosis, serde_json::json!({"dx": "myopia"}));
        assert!(matches!(run(&mut s, op.clone(), &other, now), Err(WorkflowError::Conflict(_))));
        run(&mut s, op, &doctor(), now).unwrap();

        // Even the holder cannot stack a second lock.
        assert!(matches!(run(&mut s, lock, &doctor(), now), Err(WorkflowError::Conflict(_))));
    }

    #[test]
    fn lock_requires_a_role_on_the_step() {
        let now = Utc::now();
        let mut s = session(now);
        advance_to(&mut s, WorkflowStep::DoctorDiagnosis, now);
        let lock = Operation::RequestLock(LockRequest {
            step: WorkflowStep::DoctorDiagnosis,
            lock_type: LockType::Editing,
            reason: None,
            duration_minutes: Some(240),
        });

        for outsider in [clerk(), tech()] {
            assert!(matches!(
                run(&mut s, lock.clone(), &outsider, now),
                Err(WorkflowError::Authorization(_))
            ));
        }
        assert!(s.lock.is_none());
        run(&mut s, patch(WorkflowStep::DoctorDiagnosis, serde_json::json!({"dx": "myopia"})), &doctor(), now)
            .unwrap();

        let admin = Participant::new("root", "Admin", Role::Admin);
        run(&mut s, lock, &admin, now).unwrap();
        assert_eq!(s.lock.as_ref().unwrap().holder.id, admin.id);
    }

    #[test]
    fn expired_lock_is_cleared_by_next_mutation() {
        let now = Utc::now();
        let mut s = session(now);
        let lock = Operation::RequestLock(LockRequest {
            step: WorkflowStep::Registration,
            lock_type: LockType::Review,
            reason: None,
            duration_minutes: Some(5),
        });
        run(&mut s, lock, &supervisor(), now).unwrap();

        let later = now + Duration::minutes(6);
        run(&mut s, patch(WorkflowStep::Registration, serde_json::json!({"x": 1})), &clerk(), later).unwrap();
        assert!(s.lock.is_none());
        assert_eq!(s.overall_status, SessionStatus::Active);
    }

    #[test]
    fn lock_duration_bounds() {
        let now = Utc::now();
        let mut s = session(now);
        for minutes in [0, 241] {
            let op = Operation::RequestLock(LockRequest {
                step: WorkflowStep::Registration,
                lock_type: LockType::Editing,
                reason: None,
                duration_minutes: Some(minutes),
            });
            assert!(matches!(run(&mut s, op, &clerk(), now), Err(WorkflowError::Validation(_))));
        }
    }

    #[test]
    fn release_rules() {
        let now = Utc::now();
        let mut s = session(now);
        assert!(matches!(
            run(&mut s, Operation::ReleaseLock, &clerk(), now),
            Err(WorkflowError::NotFound(_))
        ));

        let lock = Operation::RequestLock(LockRequest {
            step: WorkflowStep::Registration,
            lock_type: LockType::Editing,
            reason: None,
            duration_minutes: Some(10),
        });
        run(&mut s, lock, &clerk(), now).unwrap();
        assert!(matches!(
            run(&mut s, Operation::ReleaseLock, &tech(), now),
            Err(WorkflowError::Authorization(_))
        ));

        let m = run(&mut s, Operation::ReleaseLock, &supervisor(), now).unwrap().unwrap();
        assert_eq!(m.action, ActivityAction::LockReleased);
        assert_eq!(m.events[0].direct_recipients(), vec![clerk().id]);
        assert_eq!(s.overall_status, SessionStatus::Active);
    }

    #[test]
    fn holder_completing_locked_step_releases_lock() {
        let now = Utc::now();
        let mut s = session(now);
        let lock = Operation::RequestLock(LockRequest {
            step: WorkflowStep::Registration,
            lock_type: LockType::Editing,
            reason: None,
            duration_minutes: None,
        });
        run(&mut s, lock, &clerk(), now).unwrap();
        let m = run(&mut s, complete(WorkflowStep::Registration), &clerk(), now).unwrap().unwrap();
        assert!(s.lock.is_none());
        assert_eq!(s.overall_status, SessionStatus::Active);
        assert!(m.events.iter().any(|e| matches!(e, WorkflowEvent::LockChanged { lock: None, .. })));
    }

    #[test]
    fn gated_step_needs_approval() {
        let now = Utc::now();
        let mut s = session(now);
        advance_to(&mut s, WorkflowStep::Prescription, now);

        let err = run(&mut s, complete(WorkflowStep::Prescription), &doctor(), now).unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict(_)));

        let m = run(
            &mut s,
            Operation::RequestApproval(ApprovalSubmission {
                step: WorkflowStep::Prescription,
                payload: serde_json::json!({"sphere": -1.5}),
                priority: Priority::High,
            }),
            &doctor(),
            now,
        )
        .unwrap()
        .unwrap();
        let request_id = m.approval.unwrap();
        let record = s.step(WorkflowStep::Prescription).unwrap();
        assert!(record.pending_completion);
        assert_eq!(record.status, StepStatus::InProgress);

        let m = run(
            &mut s,
            Operation::ResolveApproval {
                request_id,
                decision: ApprovalDecision::Approved,
                notes: Some("ok".into()),
            },
            &supervisor(),
            now,
        )
        .unwrap()
        .unwrap();
        assert_eq!(m.action, ActivityAction::ApprovalApproved);
        assert_eq!(s.current_step, WorkflowStep::QualityCheck);
        assert_eq!(s.step(WorkflowStep::Prescription).unwrap().status, StepStatus::Completed);
        assert_eq!(m.events[0].direct_recipients(), vec![doctor().id]);
        s.check_invariants().unwrap();
    }

    #[test]
    fn rejected_approval_keeps_step_in_progress() {
        let now = Utc::now();
        let mut s = session(now);
        advance_to(&mut s, WorkflowStep::DoctorDiagnosis, now);
        let m = run(
            &mut s,
            Operation::RequestApproval(ApprovalSubmission {
                step: WorkflowStep::DoctorDiagnosis,
                payload: Value::Null,
                priority: Priority::Normal,
            }),
            &doctor(),
            now,
        )
        .unwrap()
        .unwrap();
        let request_id = m.approval.unwrap();

        run(
            &mut s,
            Operation::ResolveApproval {
                request_id: request_id.clone(),
                decision: ApprovalDecision::Rejected,
                notes: Some("recheck IOP".into()),
            },
            &supervisor(),
            now,
        )
        .unwrap();
        let record = s.step(WorkflowStep::DoctorDiagnosis).unwrap();
        assert!(!record.pending_completion);
        assert_eq!(record.status, StepStatus::InProgress);

        // Resolving twice conflicts.
        let err = run(
            &mut s,
            Operation::ResolveApproval {
                request_id,
                decision: ApprovalDecision::Approved,
                notes: None,
            },
            &supervisor(),
            now,
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict(_)));
    }

    #[test]
    fn approval_request_rules() {
        let now = Utc::now();
        let mut s = session(now);
        let sub = |step| {
            Operation::RequestApproval(ApprovalSubmission {
                step,
                payload: Value::Null,
                priority: Priority::Low,
            })
        };
        assert!(matches!(
            run(&mut s, sub(WorkflowStep::VisionTesting), &tech(), now),
            Err(WorkflowError::Validation(_))
        ));
        assert!(matches!(
            run(&mut s, sub(WorkflowStep::Prescription), &tech(), now),
            Err(WorkflowError::Authorization(_))
        ));
        run(&mut s, sub(WorkflowStep::Prescription), &doctor(), now).unwrap();
        assert!(matches!(
            run(&mut s, sub(WorkflowStep::Prescription), &doctor(), now),
            Err(WorkflowError::Conflict(_))
        ));
    }

    #[test]
    fn approver_role_is_enforced() {
        let now = Utc::now();
        let mut s = session(now);
        advance_to(&mut s, WorkflowStep::FinalApproval, now);
        let m = run(
            &mut s,
            Operation::RequestApproval(ApprovalSubmission {
                step: WorkflowStep::FinalApproval,
                payload: Value::Null,
                priority: Priority::Normal,
            }),
            &supervisor(),
            now,
        )
        .unwrap()
        .unwrap();
        let err = run(
            &mut s,
            Operation::ResolveApproval {
                request_id: m.approval.clone().unwrap(),
                decision: ApprovalDecision::Approved,
                notes: None,
            },
            &doctor(),
            now,
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::Authorization(_)));
    }

    #[test]
    fn full_walk_completes_session() {
        let now = Utc::now();
        let mut s = session(now);
        advance_to(&mut s, WorkflowStep::FinalApproval, now);
        let m = run(
            &mut s,
            Operation::RequestApproval(ApprovalSubmission {
                step: WorkflowStep::FinalApproval,
                payload: Value::Null,
                priority: Priority::Normal,
            }),
            &supervisor(),
            now,
        )
        .unwrap()
        .unwrap();
        let admin = Participant::new("root", "Admin", Role::Admin);
        run(
            &mut s,
            Operation::ResolveApproval {
                request_id: m.approval.unwrap(),
                decision: ApprovalDecision::Approved,
                notes: None,
            },
            &admin,
            now,
        )
        .unwrap();

        assert_eq!(s.overall_status, SessionStatus::Completed);
        assert!(s.completed_at.is_some());
        assert!(s.workflow_steps.iter().all(|r| r.status == StepStatus::Completed));
        s.check_invariants().unwrap();

        let err = run(&mut s, Operation::Join, &tech(), now).unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict(_)));
    }

    #[test]
    fn cancel_rejects_open_steps() {
        let now = Utc::now();
        let mut s = session(now);
        run(&mut s, complete(WorkflowStep::Registration), &clerk(), now).unwrap();
        assert!(matches!(
            run(&mut s, Operation::Cancel { reason: None }, &doctor(), now),
            Err(WorkflowError::Authorization(_))
        ));

        let m = run(
            &mut s,
            Operation::Cancel { reason: Some("patient left".into()) },
            &supervisor(),
            now,
        )
        .unwrap()
        .unwrap();
        assert_eq!(m.action, ActivityAction::Cancelled);
        assert_eq!(s.overall_status, SessionStatus::Cancelled);
        assert_eq!(s.step(WorkflowStep::Registration).unwrap().status, StepStatus::Completed);
        assert!(s.workflow_steps[1..].iter().all(|r| r.status == StepStatus::Rejected));

        let err = run(&mut s, complete(WorkflowStep::InitialAssessment), &tech(), now).unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict(_)));

        // A closed session reports the conflict whatever the caller's role.
        let err = run(&mut s, complete(WorkflowStep::InitialAssessment), &clerk(), now).unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict(_)));
        let err = run(&mut s, Operation::Cancel { reason: None }, &doctor(), now).unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict(_)));
        let lock = Operation::RequestLock(LockRequest {
            step: WorkflowStep::Prescription,
            lock_type: LockType::Editing,
            reason: None,
            duration_minutes: None,
        });
        assert!(matches!(run(&mut s, lock, &clerk(), now), Err(WorkflowError::Conflict(_))));
    }

    #[test]
    fn join_and_leave_are_idempotent() {
        let now = Utc::now();
        let mut s = session(now);
        let m = run(&mut s, Operation::Join, &tech(), now).unwrap().unwrap();
        assert_eq!(m.action, ActivityAction::Joined);
        assert!(run(&mut s, Operation::Join, &tech(), now).unwrap().is_none());

        let m = run(&mut s, Operation::Leave, &tech(), now).unwrap().unwrap();
        assert_eq!(m.action, ActivityAction::Left);
        assert!(run(&mut s, Operation::Leave, &tech(), now).unwrap().is_none());
        assert!(s.all_participants.iter().any(|p| p.id == tech().id));
    }
}
