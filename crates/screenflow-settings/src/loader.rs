//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{ScreenflowSettings, MAX_LOCK_MINUTES_CEILING};

/// `~/.screenflow`, the home of the settings file and relative data paths.
pub fn data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".screenflow")
}

/// Resolve the path to the settings file (`~/.screenflow/settings.json`).
pub fn settings_path() -> PathBuf {
    data_dir().join("settings.json")
}

/// Resolve a configured path: absolute paths pass through, relative ones
/// land under [`data_dir`].
pub fn resolve_data_path(raw: &str) -> PathBuf {
    let path = PathBuf::from(raw);
    if path.is_absolute() || raw == ":memory:" {
        path
    } else {
        data_dir().join(path)
    }
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ScreenflowSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides, then
/// validate the result.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ScreenflowSettings> {
    let mut settings = load_file_layer(path)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    settings.validate()?;
    Ok(settings)
}

/// Defaults merged with the file at `path`, without env overrides.
pub fn load_file_layer(path: &Path) -> Result<ScreenflowSettings> {
    let defaults = serde_json::to_value(ScreenflowSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `SCREENFLOW_*` overrides read through `lookup`.
///
/// Invalid values are ignored with a warning and the file/default value
/// stays in place.
pub fn apply_overrides(settings: &mut ScreenflowSettings, lookup: impl Fn(&str) -> Option<String>) {
    let string = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = string("SCREENFLOW_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = checked("SCREENFLOW_PORT", string("SCREENFLOW_PORT"), |v| {
        parse_u16_range(v, 0, 65535)
    }) {
        settings.server.port = v;
    }
    if let Some(v) = string("SCREENFLOW_DB_PATH") {
        settings.database.path = v;
    }
    if let Some(v) = string("SCREENFLOW_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = checked("SCREENFLOW_LOG_JSON", string("SCREENFLOW_LOG_JSON"), parse_bool) {
        settings.logging.json = v;
    }
    if let Some(v) = checked(
        "SCREENFLOW_MAX_LOCK_MINUTES",
        string("SCREENFLOW_MAX_LOCK_MINUTES"),
        |v| parse_u32_range(v, 1, MAX_LOCK_MINUTES_CEILING),
    ) {
        settings.workflow.max_lock_minutes = v;
        settings.workflow.default_lock_minutes = settings.workflow.default_lock_minutes.min(v);
    }
    if let Some(v) = checked(
        "SCREENFLOW_PRESENCE_IDLE_SECS",
        string("SCREENFLOW_PRESENCE_IDLE_SECS"),
        |v| parse_u64_range(v, 1, 86_400),
    ) {
        settings.presence.idle_timeout_secs = v;
    }
}

fn checked<T>(name: &str, raw: Option<String>, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let raw = raw?;
    let result = parse(&raw);
    if result.is_none() {
        tracing::warn!(key = name, value = %raw, "invalid env var, ignoring");
    }
    result
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
