//! Built-in adapters.
//!
//! Each adapter is a [`Plugin`] keyed by the module names it instruments.
//! Hosts hand a module's [`Exports`](crate::hooks::Exports) to
//! [`Agent::load_module`](crate::Agent::load_module) and the matching
//! adapter wraps the members it knows about.

pub mod auth;
pub mod http;
pub mod record;
pub mod sql;

use std::sync::Arc;

use actiontrail_core::errors::PluginError;
use semver::{Version, VersionReq};

use crate::hooks::{Plugin, PluginRegistry};

pub use auth::AuthPlugin;
pub use http::{Extractor, FrameworkOptions, HttpPlugin, RequestView};
pub use record::RecordPlugin;
pub use sql::{DriverError, SqlPlugin};

/// Register every built-in adapter.
pub fn register_builtin(registry: &PluginRegistry) {
    let plugins: [Arc<dyn Plugin>; 4] = [
        Arc::new(HttpPlugin),
        Arc::new(SqlPlugin::default()),
        Arc::new(RecordPlugin),
        Arc::new(AuthPlugin),
    ];
    for plugin in plugins {
        registry.register(plugin);
    }
}

/// Parse a reported module version leniently: a leading `v` and any
/// pre-release or build suffix are dropped, and `2` or `0.32` are padded to
/// `2.0.0` and `0.32.0`.
pub fn parse_version(raw: &str) -> Option<Version> {
    let core = raw.trim().trim_start_matches('v');
    let core = core.split(['-', '+']).next()?;
    let padded = match core.split('.').count() {
        1 => format!("{core}.0.0"),
        2 => format!("{core}.0"),
        _ => core.to_owned(),
    };
    Version::parse(&padded).ok()
}

/// Parse `raw` and check it against `supported`, for use at the top of a
/// bootstrap.
pub fn check_version(supported: &VersionReq, module: &str, raw: &str) -> Result<Version, PluginError> {
    parse_version(raw)
        .filter(|v| supported.matches(v))
        .ok_or_else(|| PluginError::UnsupportedVersion {
            module: module.to_owned(),
            version: raw.to_owned(),
        })
}
