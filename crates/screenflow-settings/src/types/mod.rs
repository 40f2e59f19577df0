//! Settings type definitions.
//!
//! JSON field names are camelCase. Every type implements [`Default`] with
//! production values and carries `#[serde(default)]`, so partial files are
//! fine: missing fields keep their default.

mod access;
mod server;
mod workflow;

pub use access::*;
pub use server::*;
pub use workflow::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "workflow": { "maxLockMinutes": 60 },
///   "auth": { "tokens": [{ "token": "...", "participantId": "dr.osei",
///                          "name": "Dr. Osei", "role": "doctor" }] }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScreenflowSettings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub workflow: WorkflowSettings,
    pub presence: PresenceSettings,
    pub logging: LoggingSettings,
    pub auth: AuthSettings,
    pub patients: PatientSettings,
}

impl ScreenflowSettings {
    /// Cross-field checks that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let wf = &self.workflow;
        if wf.max_lock_minutes == 0 || wf.max_lock_minutes > MAX_LOCK_MINUTES_CEILING {
            return Err(SettingsError::InvalidValue(format!(
                "workflow.maxLockMinutes must be 1..={MAX_LOCK_MINUTES_CEILING}, got {}",
                wf.max_lock_minutes
            )));
        }
        if wf.default_lock_minutes == 0 || wf.default_lock_minutes > wf.max_lock_minutes {
            return Err(SettingsError::InvalidValue(format!(
                "workflow.defaultLockMinutes must be 1..={}, got {}",
                wf.max_lock_minutes, wf.default_lock_minutes
            )));
        }
        if wf.actor_mailbox == 0 {
            return Err(SettingsError::InvalidValue(
                "workflow.actorMailbox must be positive".into(),
            ));
        }
        if self.presence.sweep_interval_secs == 0 || self.presence.idle_timeout_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "presence intervals must be positive".into(),
            ));
        }
        for grant in &self.auth.tokens {
            if grant.token.trim().is_empty() {
                return Err(SettingsError::InvalidValue(format!(
                    "auth token for {} is empty",
                    grant.participant_id
                )));
            }
        }
        Ok(())
    }
}
