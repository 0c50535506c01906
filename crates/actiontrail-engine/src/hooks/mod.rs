//! Module instrumentation: replaceable members, the exports container handed
//! to plugins, and the plugin registry.

mod exports;
mod registry;
mod wrap;

pub use exports::Exports;
pub use registry::{Matcher, Plugin, PluginRegistry};
pub use wrap::{Hookable, Unwrap};
