//! axum integration: per-request operations and the `HTTP` action.
//!
//! [`instrument`] wraps every route of a router so each request runs as one
//! root operation and produces one action. Route-level [`force_track`] and
//! [`ignore`] layers override the agent's tracking filter.

pub mod control;
pub mod middleware;

pub use control::{force_track, ignore, TrackControl, TrackControlLayer, TrackMode, TrackedUser};
pub use middleware::{instrument, instrument_with, InstrumentOptions};
