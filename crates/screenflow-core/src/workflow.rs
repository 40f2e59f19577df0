//! Canonical workflow vocabulary: steps, statuses and their transitions.

use serde::{Deserialize, Serialize};

/// One phase of a screening encounter, in canonical order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStep {
    Registration,
    InitialAssessment,
    VisionTesting,
    AutoRefraction,
    ClinicalEvaluation,
    DoctorDiagnosis,
    Prescription,
    QualityCheck,
    FinalApproval,
}

impl WorkflowStep {
    pub const ALL: [WorkflowStep; 9] = [
        Self::Registration,
        Self::InitialAssessment,
        Self::VisionTesting,
        Self::AutoRefraction,
        Self::ClinicalEvaluation,
        Self::DoctorDiagnosis,
        Self::Prescription,
        Self::QualityCheck,
        Self::FinalApproval,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registration => "registration",
            Self::InitialAssessment => "initial_assessment",
            Self::VisionTesting => "vision_testing",
            Self::AutoRefraction => "auto_refraction",
            Self::ClinicalEvaluation => "clinical_evaluation",
            Self::DoctorDiagnosis => "doctor_diagnosis",
            Self::Prescription => "prescription",
            Self::QualityCheck => "quality_check",
            Self::FinalApproval => "final_approval",
        }
    }

    /// Position in the canonical order.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn next(self) -> Option<Self> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn is_last(self) -> bool {
        self.next().is_none()
    }

    /// Steps that cannot complete without an approved approval request.
    pub fn requires_approval(self) -> bool {
        matches!(
            self,
            Self::DoctorDiagnosis | Self::Prescription | Self::FinalApproval
        )
    }
}

impl std::fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStep {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| format!("unknown workflow step: {s}"))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Rejected,
}

impl StepStatus {
    /// Pending or in progress: the step can still be worked on.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    /// Status only moves forward; staying put is allowed.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        match (self, next) {
            (a, b) if a == b => a.is_open(),
            (Self::Pending, Self::InProgress | Self::Completed | Self::Rejected) => true,
            (Self::InProgress, Self::Completed | Self::Rejected) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Active,
    Locked,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Locked => write!(f, "locked"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "locked" => Ok(Self::Locked),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    #[default]
    Editing,
    Review,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

impl From<ApprovalDecision> for ApprovalStatus {
    fn from(d: ApprovalDecision) -> Self {
        match d {
            ApprovalDecision::Approved => Self::Approved,
            ApprovalDecision::Rejected => Self::Rejected,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_order_is_stable() {
        let names: Vec<&str> = WorkflowStep::ALL.iter().map(|s| s.as_str()).collect();
        assert_eq!(
            names,
            [
                "registration",
                "initial_assessment",
                "vision_testing",
                "auto_refraction",
                "clinical_evaluation",
                "doctor_diagnosis",
                "prescription",
                "quality_check",
                "final_approval",
            ]
        );
        for (i, step) in WorkflowStep::ALL.iter().enumerate() {
            assert_eq!(step.index(), i);
        }
    }

    #[test]
    fn next_walks_the_chain() {
        assert_eq!(WorkflowStep::Registration.next(), Some(WorkflowStep::InitialAssessment));
        assert_eq!(WorkflowStep::QualityCheck.next(), Some(WorkflowStep::FinalApproval));
        assert_eq!(WorkflowStep::FinalApproval.next(), None);
        assert!(WorkflowStep::FinalApproval.is_last());
    }

    #[test]
    fn approval_steps() {
        let gated: Vec<_> = WorkflowStep::ALL
            .into_iter()
            .filter(|s| s.requires_approval())
            .collect();
        assert_eq!(
            gated,
            [
                WorkflowStep::DoctorDiagnosis,
                WorkflowStep::Prescription,
                WorkflowStep::FinalApproval
            ]
        );
    }

    #[test]
    fn step_parse_matches_serde() {
        for step in WorkflowStep::ALL {
            let parsed: WorkflowStep = step.as_str().parse().unwrap();
            assert_eq!(parsed, step);
            let json = serde_json::to_string(&step).unwrap();
            assert_eq!(json, format!("\"{step}\""));
        }
        assert!("triage".parse::<WorkflowStep>().is_err());
    }

    #[test]
    fn status_moves_forward_only() {
        use StepStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(Pending.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Rejected));
        assert!(!Completed.can_transition_to(InProgress));
        assert!(!Completed.can_transition_to(Completed));
        assert!(!Rejected.can_transition_to(Pending));
        assert!(!InProgress.can_transition_to(Pending));
    }

    #[test]
    fn session_status_roundtrip() {
        for status in [
            SessionStatus::Active,
            SessionStatus::Locked,
            SessionStatus::Completed,
            SessionStatus::Cancelled,
        ] {
            let parsed: SessionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
        assert!(!SessionStatus::Locked.is_terminal());
    }

    #[test]
    fn decision_maps_to_status() {
        assert_eq!(ApprovalStatus::from(ApprovalDecision::Approved), ApprovalStatus::Approved);
        assert_eq!(ApprovalStatus::from(ApprovalDecision::Rejected), ApprovalStatus::Rejected);
    }
}
