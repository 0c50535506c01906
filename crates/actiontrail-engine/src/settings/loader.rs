//! Settings loading with deep merge and environment overrides.
//!
//! Loading flow:
//! 1. Start from [`AgentSettings::default()`]
//! 2. If a settings file exists, deep-merge its values over the defaults
//! 3. Apply `ACTIONTRAIL_*` environment overrides (highest priority)
//!
//! Null values in the file are skipped; arrays replace rather than append.

use std::path::Path;

use serde_json::Value;
use tracing::{debug, warn};

use actiontrail_core::errors::ConfigError;

use super::AgentSettings;

/// Load settings from `path` with environment overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<AgentSettings, ConfigError> {
    let defaults = serde_json::to_value(AgentSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading agent settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: AgentSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive merge: objects merge per key, everything else is replaced by
/// `source`, and nulls in `source` leave `target` alone.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

pub fn apply_env_overrides(settings: &mut AgentSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`. Empty and invalid values are ignored.
pub fn apply_overrides(settings: &mut AgentSettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("ACTIONTRAIL_APPLICATION_ID") {
        settings.application_id = v;
    }
    if let Some(v) = read("ACTIONTRAIL_SECRET") {
        settings.secret = Some(v);
    }
    if let Some(v) = read("ACTIONTRAIL_APP") {
        settings.app = Some(v);
    }
    if let Some(v) = read("ACTIONTRAIL_ENV") {
        settings.environment = v;
    }
    if let Some(v) = read("ACTIONTRAIL_URL") {
        settings.url = Some(v);
    }
    if let Some(v) = read("ACTIONTRAIL_COMPANY_ID") {
        settings.company_id = Some(v);
    }
    if let Some(v) = read("ACTIONTRAIL_HIGH_WATER_MARK") {
        match parse_usize_range(&v, 1, 10_000) {
            Some(n) => settings.stream.high_water_mark = n,
            None => warn!(key = "ACTIONTRAIL_HIGH_WATER_MARK", value = %v, "invalid usize env var, ignoring"),
        }
    }
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
