use serde::{Deserialize, Serialize};

/// Static bearer tokens. Stand-in for the external identity service.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    pub tokens: Vec<TokenGrant>,
}

/// One token and the identity it resolves to.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenGrant {
    pub token: String,
    pub participant_id: String,
    pub name: String,
    /// `registration_clerk`, `technician`, `doctor`, `supervisor` or `admin`.
    pub role: String,
}

/// Seed for the in-memory patient directory.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PatientSettings {
    /// Patient ids the directory knows about.
    pub known: Vec<String>,
    /// Accept any patient id. Useful for demos without a patient registry.
    pub allow_unknown: bool,
}
