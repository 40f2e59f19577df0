use serde::{Deserialize, Serialize};

use crate::ids::ParticipantId;

/// Staff role as reported by the external permission lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    RegistrationClerk,
    Technician,
    Doctor,
    Supervisor,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RegistrationClerk => "registration_clerk",
            Self::Technician => "technician",
            Self::Doctor => "doctor",
            Self::Supervisor => "supervisor",
            Self::Admin => "admin",
        }
    }

    /// May release locks held by others and cancel sessions.
    pub fn is_supervisor_class(self) -> bool {
        matches!(self, Self::Supervisor | Self::Admin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registration_clerk" => Ok(Self::RegistrationClerk),
            "technician" => Ok(Self::Technician),
            "doctor" => Ok(Self::Doctor),
            "supervisor" => Ok(Self::Supervisor),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// An authenticated staff member acting on a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub role: Role,
}

impl Participant {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: Role) -> Self {
        Self {
            id: ParticipantId::from_raw(id),
            name: name.into(),
            role,
        }
    }
}
