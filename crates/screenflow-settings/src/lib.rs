//! # screenflow-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`ScreenflowSettings::default()`]
//! 2. **User file**: `~/.screenflow/settings.json` or an explicit path,
//!    deep-merged over the defaults
//! 3. **Environment variables**: `SCREENFLOW_*` overrides
//!
//! The binary applies CLI flags on top of the result.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    data_dir, deep_merge, load_settings, load_settings_from_path, resolve_data_path, settings_path,
};
pub use types::*;
