use serde::{Deserialize, Serialize};

use crate::activity::ActivityLogEntry;
use crate::identity::Participant;
use crate::ids::{ParticipantId, SessionId};
use crate::session::{ApprovalRequest, LockRecord, WorkflowSession};
use crate::workflow::WorkflowStep;

/// Domain events emitted by the engine after a mutation commits.
/// These are advisory; the committed session is the source of truth.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkflowEvent {
    #[serde(rename = "session_update")]
    SessionUpdated { session: Box<WorkflowSession> },

    #[serde(rename = "session_step_completed")]
    StepCompleted {
        session_id: SessionId,
        step: WorkflowStep,
        next_step: Option<WorkflowStep>,
        completed_by: Participant,
    },

    #[serde(rename = "session_activity_logged")]
    ActivityLogged { entry: Box<ActivityLogEntry> },

    #[serde(rename = "session_user_joined")]
    UserJoined {
        session_id: SessionId,
        participant: Participant,
    },

    #[serde(rename = "session_user_left")]
    UserLeft {
        session_id: SessionId,
        participant: Participant,
    },

    #[serde(rename = "session_lock_changed")]
    LockChanged {
        session_id: SessionId,
        lock: Option<LockRecord>,
        changed_by: Participant,
        /// Set when a lock was released by someone other than its holder.
        displaced_holder: Option<ParticipantId>,
    },

    #[serde(rename = "approval_requested")]
    ApprovalRequested { request: Box<ApprovalRequest> },

    #[serde(rename = "approval_resolved")]
    ApprovalResolved { request: Box<ApprovalRequest> },
}

impl WorkflowEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::SessionUpdated { session } => &session.session_id,
            Self::ActivityLogged { entry } => &entry.session_id,
            Self::ApprovalRequested { request } | Self::ApprovalResolved { request } => {
                &request.session_id
            }
            Self::StepCompleted { session_id, .. }
            | Self::UserJoined { session_id, .. }
            | Self::UserLeft { session_id, .. }
            | Self::LockChanged { session_id, .. } => session_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionUpdated { .. } => "session_update",
            Self::StepCompleted { .. } => "session_step_completed",
            Self::ActivityLogged { .. } => "session_activity_logged",
            Self::UserJoined { .. } => "session_user_joined",
            Self::UserLeft { .. } => "session_user_left",
            Self::LockChanged { .. } => "session_lock_changed",
            Self::ApprovalRequested { .. } => "approval_requested",
            Self::ApprovalResolved { .. } => "approval_resolved",
        }
    }

    /// Participants whose personal channel should also get this event.
    pub fn direct_recipients(&self) -> Vec<ParticipantId> {
        match self {
            Self::ApprovalResolved { request } => vec![request.requested_by.id.clone()],
            Self::LockChanged {
                displaced_holder: Some(holder),
                ..
            } => vec![holder.clone()],
            _ => Vec::new(),
        }
    }

    /// Event payload without the `type` tag.
    pub fn data(&self) -> serde_json::Value {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(mut map)) => {
                let _ = map.remove("type");
                serde_json::Value::Object(map)
            }
            _ => serde_json::Value::Null,
        }
    }
}
