//! Append-only audit entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diff::FieldChange;
use crate::identity::Participant;
use crate::ids::{ParticipantId, SessionId};
use crate::workflow::WorkflowStep;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    Created,
    Joined,
    Left,
    StepStarted,
    StepUpdated,
    Completed,
    LockAcquired,
    LockReleased,
    ApprovalRequested,
    ApprovalApproved,
    ApprovalRejected,
    Cancelled,
}

impl ActivityAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Joined => "joined",
            Self::Left => "left",
            Self::StepStarted => "step_started",
            Self::StepUpdated => "step_updated",
            Self::Completed => "completed",
            Self::LockAcquired => "lock_acquired",
            Self::LockReleased => "lock_released",
            Self::ApprovalRequested => "approval_requested",
            Self::ApprovalApproved => "approval_approved",
            Self::ApprovalRejected => "approval_rejected",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ActivityAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActivityAction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "joined" => Ok(Self::Joined),
            "left" => Ok(Self::Left),
            "step_started" => Ok(Self::StepStarted),
            "step_updated" => Ok(Self::StepUpdated),
            "completed" => Ok(Self::Completed),
            "lock_acquired" => Ok(Self::LockAcquired),
            "lock_released" => Ok(Self::LockReleased),
            "approval_requested" => Ok(Self::ApprovalRequested),
            "approval_approved" => Ok(Self::ApprovalApproved),
            "approval_rejected" => Ok(Self::ApprovalRejected),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown activity action: {other}")),
        }
    }
}

/// Where a mutation came from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// An entry before the store assigns its sequence number.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewActivity {
    pub session_id: SessionId,
    pub step: Option<WorkflowStep>,
    pub action: ActivityAction,
    pub actor: Participant,
    pub timestamp: DateTime<Utc>,
    pub changes: Vec<FieldChange>,
    pub comment: Option<String>,
    pub origin: Origin,
}

/// A committed, immutable audit entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub session_id: SessionId,
    /// Per-session, gap-free, starting at 1.
    pub sequence: i64,
    pub step: Option<WorkflowStep>,
    pub action: ActivityAction,
    pub actor: Participant,
    pub timestamp: DateTime<Utc>,
    pub changes: Vec<FieldChange>,
    pub comment: Option<String>,
    pub origin: Origin,
}

impl ActivityLogEntry {
    pub fn from_new(entry: NewActivity, sequence: i64) -> Self {
        Self {
            session_id: entry.session_id,
            sequence,
            step: entry.step,
            action: entry.action,
            actor: entry.actor,
            timestamp: entry.timestamp,
            changes: entry.changes,
            comment: entry.comment,
            origin: entry.origin,
        }
    }
}

pub const DEFAULT_ACTIVITY_LIMIT: u32 = 50;
pub const MAX_ACTIVITY_LIMIT: u32 = 500;

/// Filters for listing a session's audit trail.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ActivityQuery {
    pub step: Option<WorkflowStep>,
    pub action: Option<ActivityAction>,
    pub actor_id: Option<ParticipantId>,
    /// Only entries with a greater sequence (replay cursor).
    pub after_sequence: Option<i64>,
    pub limit: Option<u32>,
    /// Oldest first instead of the default newest first.
    #[serde(default)]
    pub ascending: bool,
}

impl ActivityQuery {
    pub fn effective_limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_ACTIVITY_LIMIT)
            .clamp(1, MAX_ACTIVITY_LIMIT)
    }
}
