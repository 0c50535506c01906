//! The actiontrail agent pipeline.
//!
//! Adapters instrument host modules through the [`hooks`] registry, record
//! detected mutations into the ambient [`context`], and hand action drafts to
//! the [`Agent`], which masks them in the [`builder`] and queues them on the
//! batching [`stream`] for delivery through a [`sink`].

pub mod agent;
pub mod builder;
pub mod context;
pub mod hooks;
pub mod normalize;
pub mod plugins;
pub mod settings;
pub mod sink;
pub mod stream;

pub use agent::{Agent, AgentBuilder};
pub use context::{run_once, Span, SpanData, SpanSeed};
pub use hooks::{Exports, Hookable, Plugin, Unwrap};
pub use plugins::{Extractor, FrameworkOptions, RequestView};
pub use settings::{load_settings_from_path, AgentSettings, TrackOptions};
pub use sink::{ActionSink, HttpSink, MemorySink, StorageSink};
pub use stream::{ActionStream, StreamError, StreamOptions, StreamStats, TryWriteError};
