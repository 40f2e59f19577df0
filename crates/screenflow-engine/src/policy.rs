//! Which roles may work or approve which steps. `admin` may do everything.

use screenflow_core::identity::Role;
use screenflow_core::workflow::WorkflowStep;

/// Roles allowed to update or complete `step`.
pub fn step_owners(step: WorkflowStep) -> &'static [Role] {
    use Role::*;
    use WorkflowStep::*;
    match step {
        Registration => &[RegistrationClerk, Supervisor],
        InitialAssessment | VisionTesting | AutoRefraction => &[Technician, Supervisor],
        ClinicalEvaluation => &[Technician, Doctor, Supervisor],
        DoctorDiagnosis | Prescription => &[Doctor, Supervisor],
        QualityCheck => &[Supervisor, Doctor],
        FinalApproval => &[Supervisor],
    }
}

pub fn can_work(role: Role, step: WorkflowStep) -> bool {
    role == Role::Admin || step_owners(step).contains(&role)
}

/// Roles allowed to resolve an approval request for `step`.
pub fn approvers(step: WorkflowStep) -> &'static [Role] {
    use Role::*;
    match step {
        WorkflowStep::DoctorDiagnosis | WorkflowStep::Prescription => &[Doctor, Supervisor],
        WorkflowStep::FinalApproval => &[Supervisor],
        _ => &[],
    }
}

pub fn can_approve(role: Role, step: WorkflowStep) -> bool {
    step.requires_approval() && (role == Role::Admin || approvers(step).contains(&role))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clerk_only_registers() {
        assert!(can_work(Role::RegistrationClerk, WorkflowStep::Registration));
        for step in &WorkflowStep::ALL[1..] {
            assert!(!can_work(Role::RegistrationClerk, *step), "{step}");
        }
    }

    #[test]
    fn admin_works_everything() {
        for step in WorkflowStep::ALL {
            assert!(can_work(Role::Admin, step));
        }
    }

    #[test]
    fn technician_and_doctor_share_clinical_evaluation() {
        assert!(can_work(Role::Technician, WorkflowStep::ClinicalEvaluation));
        assert!(can_work(Role::Doctor, WorkflowStep::ClinicalEvaluation));
        assert!(!can_work(Role::Technician, WorkflowStep::DoctorDiagnosis));
    }

    #[test]
    fn final_approval_is_supervisor_only() {
        assert!(can_work(Role::Supervisor, WorkflowStep::FinalApproval));
        assert!(!can_work(Role::Doctor, WorkflowStep::FinalApproval));
        assert!(can_approve(Role::Supervisor, WorkflowStep::FinalApproval));
        assert!(!can_approve(Role::Doctor, WorkflowStep::FinalApproval));
    }

    #[test]
    fn approvals_only_for_gated_steps() {
        assert!(can_approve(Role::Doctor, WorkflowStep::Prescription));
        assert!(!can_approve(Role::Technician, WorkflowStep::Prescription));
        assert!(!can_approve(Role::Admin, WorkflowStep::VisionTesting));
    }
}
