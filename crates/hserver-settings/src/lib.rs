//! # hserver-settings
//!
//! Configuration for the case pipeline, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults**: [`HserverSettings::default()`]
//! 2. **Settings file**: `$HSERVER_SETTINGS` or `~/.hserver/settings.json`
//! 3. **Environment variables**: `HSERVER_*` overrides
//!
//! There is no global settings instance. The binary loads a value once and
//! passes it to every component it constructs.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
