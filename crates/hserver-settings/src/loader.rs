//! Layered settings loading.
//!
//! Loading flow:
//! 1. Start with compiled [`HserverSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `HSERVER_*` environment overrides (highest priority)
//! 4. [`HserverSettings::validate`]
//!
//! The file is `$HSERVER_SETTINGS` when set, else `~/.hserver/settings.json`.

use std::fmt::Display;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::HserverSettings;

/// `$HSERVER_SETTINGS`, else `~/.hserver/settings.json`.
pub fn settings_path() -> PathBuf {
    env_string("HSERVER_SETTINGS").map_or_else(
        || {
            let home = env_string("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".hserver").join("settings.json")
        },
        PathBuf::from,
    )
}

/// Load from [`settings_path`].
pub fn load_settings() -> Result<HserverSettings> {
    load_settings_from_path(&settings_path())
}

/// Defaults, then the file at `path` if it exists, then the environment.
/// Malformed JSON or a combination rejected by
/// [`HserverSettings::validate`] is an error.
pub fn load_settings_from_path(path: &Path) -> Result<HserverSettings> {
    let mut settings = merge_file_over_defaults(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn merge_file_over_defaults(path: &Path) -> Result<HserverSettings> {
    let mut merged = serde_json::to_value(HserverSettings::default())?;
    match std::fs::read_to_string(path) {
        Ok(content) => {
            debug!(?path, "merging settings file over defaults");
            let overlay: Value =
                serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?;
            merged = deep_merge(merged, overlay);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(?path, "no settings file, using defaults");
        }
        Err(source) => {
            return Err(SettingsError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    }
    Ok(serde_json::from_value(merged)?)
}

/// Overlay `source` onto `target`. Objects merge key by key; anything else
/// in `source` replaces what was there, except `null`, which leaves the
/// target value alone.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay.into_iter().filter(|(_, v)| !v.is_null()) {
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                let _ = base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, replacement) => replacement,
    }
}

/// Apply `HSERVER_*` overrides. A value that does not parse or falls
/// outside its range is logged and skipped.
pub fn apply_env_overrides(settings: &mut HserverSettings) {
    let db = &mut settings.database;
    if let Some(v) = env_string("HSERVER_DB_PATH") {
        db.path = Some(v);
    }
    if let Some(v) = env_in_range("HSERVER_DB_POOL_SIZE", 1u32..=256) {
        db.pool_size = v;
    }

    let ledger = &mut settings.ledger;
    if let Some(v) = env_in_range("HSERVER_MAX_BALANCE", 0i64..=i64::MAX) {
        ledger.max_balance = Some(v);
    }
    if let Some(v) = env_in_range("HSERVER_SHORTAGE_THRESHOLD", 0i64..=1_000_000) {
        ledger.shortage_threshold = v;
    }

    let storage = &mut settings.storage;
    if let Some(v) = env_string("HSERVER_STORAGE_ROOT") {
        storage.root_dir = v;
    }
    if let Some(v) = env_in_range("HSERVER_STORAGE_TOTAL_BYTES", 1u64..=u64::MAX) {
        storage.total_capacity_bytes = v;
    }
    if let Some(v) = env_in_range("HSERVER_LOW_STORAGE_BYTES", 0u64..=u64::MAX) {
        storage.low_storage_threshold_bytes = v;
    }

    let upload = &mut settings.upload;
    if let Some(v) = env_string("HSERVER_SERVER_CODE") {
        upload.server_code = v;
    }
    if let Some(v) = env_in_range("HSERVER_HU_ID_START_INDEX", 0u64..=u64::MAX) {
        upload.hu_id_start_index = v;
    }
    if let Some(v) = env_in_range("HSERVER_JOB_TIMEOUT_MS", 1_000u64..=7 * 24 * 3_600_000) {
        upload.job_timeout_ms = v;
    }

    if let Some(v) = env_string("HSERVER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(raw) = env_string("HSERVER_LOG_JSON") {
        match parse_flag(&raw) {
            Some(v) => settings.logging.json = v,
            None => warn!(key = "HSERVER_LOG_JSON", value = %raw, "not a boolean, ignoring"),
        }
    }
}

/// `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`, any case.
pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse `raw` as a `T` inside `range`.
pub fn parse_in_range<T>(raw: &str, range: &RangeInclusive<T>) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    raw.trim().parse().ok().filter(|v| range.contains(v))
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_in_range<T>(name: &str, range: RangeInclusive<T>) -> Option<T>
where
    T: FromStr + PartialOrd + Display,
{
    let raw = env_string(name)?;
    let parsed = parse_in_range(&raw, &range);
    if parsed.is_none() {
        warn!(
            key = name,
            value = %raw,
            min = %range.start(),
            max = %range.end(),
            "env override out of range or malformed, ignoring"
        );
    }
    parsed
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
