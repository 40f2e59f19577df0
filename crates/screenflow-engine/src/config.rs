use std::time::Duration;

use screenflow_settings::WorkflowSettings;

/// Engine tuning, usually derived from [`WorkflowSettings`].
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub default_lock_minutes: u32,
    pub max_lock_minutes: u32,
    /// Session actors exit after this long without a command.
    pub actor_idle: Duration,
    pub actor_mailbox: usize,
    pub event_buffer: usize,
    /// Reload-and-reapply attempts when another writer bumped the version.
    pub max_commit_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&WorkflowSettings::default())
    }
}

impl From<&WorkflowSettings> for EngineConfig {
    fn from(s: &WorkflowSettings) -> Self {
        Self {
            default_lock_minutes: s.default_lock_minutes,
            max_lock_minutes: s.max_lock_minutes,
            actor_idle: Duration::from_secs(s.actor_idle_secs),
            actor_mailbox: s.actor_mailbox.max(1),
            event_buffer: s.event_buffer.max(1),
            max_commit_attempts: 3,
        }
    }
}
