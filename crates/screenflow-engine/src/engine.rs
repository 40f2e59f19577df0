use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, instrument};

use screenflow_core::activity::{ActivityAction, ActivityLogEntry, ActivityQuery, NewActivity, Origin};
use screenflow_core::diff;
use screenflow_core::events::WorkflowEvent;
use screenflow_core::identity::Participant;
use screenflow_core::ids::{ApprovalId, PatientId, SessionId};
use screenflow_core::session::{ApprovalRequest, LockRecord, WorkflowSession};
use screenflow_core::workflow::{ApprovalDecision, WorkflowStep};
use screenflow_core::WorkflowError;
use screenflow_store::{ActivityRepo, Database, SessionFilter, SessionRepo, StoreError};

use crate::actor::{self, Command, Shared};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::directory::PatientDirectory;
use crate::policy;
use crate::transitions::{ApprovalSubmission, LockRequest, Operation, StepUpdate};

const MAX_SCREENING_TYPE_LEN: usize = 64;

/// Body of a session creation request.
#[derive(Clone, Debug, Deserialize)]
pub struct CreateSession {
    pub patient_id: PatientId,
    pub screening_type: String,
    #[serde(default)]
    pub metadata: Value,
    /// Only `registration` is accepted.
    #[serde(default)]
    pub initial_step: Option<WorkflowStep>,
}

/// Handle to the workflow engine. Cheap to clone.
#[derive(Clone)]
pub struct WorkflowEngine {
    shared: Arc<Shared>,
    activity: ActivityRepo,
    patients: Arc<dyn PatientDirectory>,
}

impl WorkflowEngine {
    pub fn new(db: Database, patients: Arc<dyn PatientDirectory>, config: EngineConfig) -> Self {
        Self::with_clock(db, patients, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        db: Database,
        patients: Arc<dyn PatientDirectory>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer);
        let shared = Arc::new(Shared {
            sessions: SessionRepo::new(db.clone()),
            clock,
            config,
            events,
            actors: DashMap::new(),
        });
        Self {
            shared,
            activity: ActivityRepo::new(db),
            patients,
        }
    }

    /// Committed events, in commit order per session.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.shared.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Number of session actors currently running.
    pub fn active_actor_count(&self) -> usize {
        self.shared.actors.iter().filter(|tx| !tx.is_closed()).count()
    }

    // ── Reads ───────────────────────────────────────────────────────────

    /// Last committed state, with an expired lock reported as absent.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn get_session(&self, session_id: &SessionId) -> Result<WorkflowSession, WorkflowError> {
        let session = self.shared.sessions.get(session_id)?;
        Ok(session.effective(self.shared.clock.now()))
    }

    pub async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<WorkflowSession>, WorkflowError> {
        let now = self.shared.clock.now();
        let sessions = self.shared.sessions.list(filter)?;
        Ok(sessions.into_iter().map(|s| s.effective(now)).collect())
    }

    #[instrument(skip(self, query), fields(session_id = %session_id))]
    pub async fn activity(
        &self,
        session_id: &SessionId,
        query: &ActivityQuery,
    ) -> Result<Vec<ActivityLogEntry>, WorkflowError> {
        let _ = self.shared.sessions.get(session_id)?;
        Ok(self.activity.list(session_id, query)?)
    }

    /// Sequence of the newest activity entry. Clients replay from here with
    /// `after_sequence` once they have resubscribed.
    pub async fn last_sequence(&self, session_id: &SessionId) -> Result<i64, WorkflowError> {
        let _ = self.shared.sessions.get(session_id)?;
        Ok(self.activity.latest_sequence(session_id)?)
    }

    // ── Mutations ───────────────────────────────────────────────────────

    #[instrument(skip_all, fields(patient_id = %req.patient_id, participant_id = %initiator.id))]
    pub async fn create_session(
        &self,
        req: CreateSession,
        initiator: &Participant,
        origin: Origin,
    ) -> Result<WorkflowSession, WorkflowError> {
        let screening_type = req.screening_type.trim();
        if screening_type.is_empty() || screening_type.chars().count() > MAX_SCREENING_TYPE_LEN {
            return Err(WorkflowError::Validation(format!(
                "screening_type must be 1..={MAX_SCREENING_TYPE_LEN} characters"
            )));
        }
        if !matches!(req.metadata, Value::Object(_) | Value::Null) {
            return Err(WorkflowError::Validation("metadata must be an object".into()));
        }
        if let Some(step) = req.initial_step.filter(|s| *s != WorkflowStep::Registration) {
            return Err(WorkflowError::Validation(format!(
                "sessions start at registration, not {step}"
            )));
        }
        if !self.patients.exists(&req.patient_id).await? {
            return Err(WorkflowError::NotFound(format!("patient {}", req.patient_id)));
        }
        if !policy::can_work(initiator.role, WorkflowStep::Registration) {
            return Err(WorkflowError::Authorization(format!(
                "role {} cannot register patients",
                initiator.role
            )));
        }
        // The unique index is the real guard; this gives a clearer message.
        if let Some(open) = self.shared.sessions.find_open_for_patient(&req.patient_id)? {
            return Err(WorkflowError::Conflict(format!(
                "patient {} already has open session {}",
                req.patient_id, open.session_id
            )));
        }

        let now = self.shared.clock.now();
        let metadata = match req.metadata {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        let mut session = WorkflowSession::new(
            req.patient_id,
            screening_type,
            initiator.clone(),
            metadata,
            now,
        );
        session.version = 1;

        let entry = NewActivity {
            session_id: session.session_id.clone(),
            step: Some(WorkflowStep::Registration),
            action: ActivityAction::Created,
            actor: initiator.clone(),
            timestamp: now,
            changes: diff::diff(&Value::Null, &session.audit_view()),
            comment: None,
            origin,
        };
        let logged = self.shared.sessions.insert(&session, entry)?;
        info!(session_id = %session.session_id, "session created");
        metrics::counter!("workflow_mutations_total", "action" => ActivityAction::Created.as_str())
            .increment(1);

        self.shared.publish([
            WorkflowEvent::SessionUpdated {
                session: Box::new(session.clone()),
            },
            WorkflowEvent::UserJoined {
                session_id: session.session_id.clone(),
                participant: initiator.clone(),
            },
            WorkflowEvent::ActivityLogged {
                entry: Box::new(logged),
            },
        ]);
        Ok(session)
    }

    pub async fn update_step(
        &self,
        session_id: &SessionId,
        step: WorkflowStep,
        actor: &Participant,
        update: StepUpdate,
        origin: Origin,
    ) -> Result<WorkflowSession, WorkflowError> {
        self.dispatch(session_id, actor, Operation::UpdateStep { step, update }, origin)
            .await
    }

    pub async fn request_lock(
        &self,
        session_id: &SessionId,
        actor: &Participant,
        req: LockRequest,
        origin: Origin,
    ) -> Result<LockRecord, WorkflowError> {
        let session = self
            .dispatch(session_id, actor, Operation::RequestLock(req), origin)
            .await?;
        session
            .lock
            .ok_or_else(|| WorkflowError::Internal("lock missing after commit".into()))
    }

    pub async fn release_lock(
        &self,
        session_id: &SessionId,
        actor: &Participant,
        origin: Origin,
    ) -> Result<WorkflowSession, WorkflowError> {
        self.dispatch(session_id, actor, Operation::ReleaseLock, origin).await
    }

    pub async fn request_approval(
        &self,
        session_id: &SessionId,
        actor: &Participant,
        submission: ApprovalSubmission,
        origin: Origin,
    ) -> Result<ApprovalRequest, WorkflowError> {
        let step = submission.step;
        let session = self
            .dispatch(session_id, actor, Operation::RequestApproval(submission), origin)
            .await?;
        session
            .pending_request_for(step)
            .cloned()
            .ok_or_else(|| WorkflowError::Internal("approval request missing after commit".into()))
    }

    pub async fn resolve_approval(
        &self,
        request_id: &ApprovalId,
        actor: &Participant,
        decision: ApprovalDecision,
        notes: Option<String>,
        origin: Origin,
    ) -> Result<ApprovalRequest, WorkflowError> {
        let session_id = match self.shared.sessions.session_for_approval(request_id) {
            Ok(id) => id,
            Err(StoreError::NotFound(_)) => {
                return Err(WorkflowError::NotFound(format!("approval request {request_id}")))
            }
            Err(e) => return Err(e.into()),
        };
        let op = Operation::ResolveApproval {
            request_id: request_id.clone(),
            decision,
            notes,
        };
        let session = self.dispatch(&session_id, actor, op, origin).await?;
        session
            .approval(request_id)
            .cloned()
            .ok_or_else(|| WorkflowError::Internal("approval request missing after commit".into()))
    }

    pub async fn cancel_session(
        &self,
        session_id: &SessionId,
        actor: &Participant,
        reason: Option<String>,
        origin: Origin,
    ) -> Result<WorkflowSession, WorkflowError> {
        self.dispatch(session_id, actor, Operation::Cancel { reason }, origin).await
    }

    pub async fn join_session(
        &self,
        session_id: &SessionId,
        actor: &Participant,
        origin: Origin,
    ) -> Result<WorkflowSession, WorkflowError> {
        self.dispatch(session_id, actor, Operation::Join, origin).await
    }

    pub async fn leave_session(
        &self,
        session_id: &SessionId,
        actor: &Participant,
        origin: Origin,
    ) -> Result<WorkflowSession, WorkflowError> {
        self.dispatch(session_id, actor, Operation::Leave, origin).await
    }

    /// Route `op` to the session's actor and wait for the outcome.
    async fn dispatch(
        &self,
        session_id: &SessionId,
        actor: &Participant,
        op: Operation,
        origin: Origin,
    ) -> Result<WorkflowSession, WorkflowError> {
        // Don't spawn actors for ids that were never created.
        if !self.shared.actors.contains_key(session_id) {
            let _ = self.shared.sessions.get(session_id)?;
        }

        let (reply, rx) = oneshot::channel();
        let mut cmd = Command {
            actor: actor.clone(),
            op,
            origin,
            reply,
        };
        for _ in 0..2 {
            let mailbox = actor::mailbox(&self.shared, session_id);
            match mailbox.send(cmd).await {
                Ok(()) => {
                    return rx.await.map_err(|_| {
                        WorkflowError::Internal("session actor dropped the request".into())
                    })?;
                }
                // The actor shut down between lookup and send.
                Err(returned) => {
                    debug!(session_id = %session_id, "session actor closed, respawning");
                    cmd = returned.0;
                }
            }
        }
        Err(WorkflowError::Internal(format!("session {session_id} actor unavailable")))
    }
}
