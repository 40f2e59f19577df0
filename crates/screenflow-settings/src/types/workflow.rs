use serde::{Deserialize, Serialize};

/// Hard upper bound on lock duration.
pub const MAX_LOCK_MINUTES_CEILING: u32 = 240;

/// Engine tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowSettings {
    /// Lock duration when the caller does not give one.
    pub default_lock_minutes: u32,
    /// Longest lock a caller may request.
    pub max_lock_minutes: u32,
    /// Session actors exit after this long without a command.
    pub actor_idle_secs: u64,
    /// Bounded command queue per session actor.
    pub actor_mailbox: usize,
    /// Capacity of the engine's event broadcast channel.
    pub event_buffer: usize,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            default_lock_minutes: 30,
            max_lock_minutes: MAX_LOCK_MINUTES_CEILING,
            actor_idle_secs: 300,
            actor_mailbox: 64,
            event_buffer: 1024,
        }
    }
}

/// Connection registry tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PresenceSettings {
    /// Connections silent for longer than this are evicted.
    pub idle_timeout_secs: u64,
    /// How often the idle sweep runs.
    pub sweep_interval_secs: u64,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 90,
            sweep_interval_secs: 30,
        }
    }
}
