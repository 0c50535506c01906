//! Ambient per-operation state.
//!
//! A [`Span`] is installed as a tokio task-local for the extent of a root
//! operation. Everything that runs inside that future (including across
//! `.await` points) sees the same span. Work handed to `tokio::spawn` or to a
//! plain callback leaves the task and must be bound explicitly with
//! [`spawn`], [`bind`] or [`WithContext::in_current_context`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::Either;
use parking_lot::Mutex;
use tokio::task::futures::TaskLocalFuture;
use tokio::task::JoinHandle;
use tracing::debug;

use actiontrail_core::{Change, TraceId};

tokio::task_local! {
    static CURRENT: Arc<Span>;
}

/// Seed data for a new span. Any field left `None` gets a fresh value.
#[derive(Clone, Debug, Default)]
pub struct SpanSeed {
    pub trace_id: Option<TraceId>,
    pub session_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
}

/// State of one root operation.
#[derive(Debug)]
pub struct Span {
    trace_id: TraceId,
    session_id: Option<String>,
    start_time: DateTime<Utc>,
    start_clock: Instant,
    changes: Mutex<Vec<Change>>,
    closed: AtomicBool,
}

/// Point-in-time copy of a span.
#[derive(Clone, Debug)]
pub struct SpanData {
    pub trace_id: TraceId,
    pub session_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub elapsed: Duration,
    pub changes: Vec<Change>,
}

impl Span {
    pub fn new(seed: SpanSeed) -> Self {
        Self {
            trace_id: seed.trace_id.unwrap_or_default(),
            session_id: seed.session_id,
            start_time: seed.start.unwrap_or_else(Utc::now),
            start_clock: Instant::now(),
            changes: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn trace_id(&self) -> &TraceId {
        &self.trace_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Start time as stored on actions.
    pub fn timestamp(&self) -> String {
        self.start_time.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Monotonic time since the span started.
    pub fn elapsed(&self) -> Duration {
        self.start_clock.elapsed()
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }

    /// Append a change. Changes recorded after [`Span::close`] are dropped.
    pub fn track_change(&self, change: Change) {
        if self.is_closed() {
            debug!(trace_id = %self.trace_id, model = %change.model, "change after span closed; dropped");
            return;
        }
        self.changes.lock().push(change);
    }

    pub fn changes(&self) -> Vec<Change> {
        self.changes.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Take the accumulated changes and stop accepting new ones.
    /// A second call returns an empty list.
    pub fn close(&self) -> Vec<Change> {
        self.closed.store(true, Ordering::Release);
        std::mem::take(&mut *self.changes.lock())
    }

    pub fn data(&self) -> SpanData {
        SpanData {
            trace_id: self.trace_id.clone(),
            session_id: self.session_id.clone(),
            start_time: self.start_time,
            elapsed: self.elapsed(),
            changes: self.changes(),
        }
    }
}

/// Run `body` inside a root operation.
///
/// If a span is already active the body runs in it unchanged, so nested
/// instrumentation never starts a second trace.
pub async fn run_once<F: Future>(seed: SpanSeed, body: F) -> F::Output {
    if current().is_some() {
        body.await
    } else {
        CURRENT.scope(Arc::new(Span::new(seed)), body).await
    }
}

/// Run `body` inside an explicitly supplied span.
pub async fn run_in<F: Future>(span: Arc<Span>, body: F) -> F::Output {
    CURRENT.scope(span, body).await
}

/// The active span, if any.
pub fn current() -> Option<Arc<Span>> {
    CURRENT.try_with(Arc::clone).ok()
}

/// Record a change on the active span. Without one, the change is dropped.
pub fn track_change(change: Change) {
    match current() {
        Some(span) => span.track_change(change),
        None => debug!(model = %change.model, "change outside any operation; dropped"),
    }
}

pub fn get_data() -> Option<SpanData> {
    current().map(|span| span.data())
}

pub fn trace_id() -> Option<TraceId> {
    current().map(|span| span.trace_id.clone())
}

/// `tokio::spawn` that carries the active span into the new task.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(future.in_current_context())
}

/// Capture the active span for a callback that will run elsewhere.
pub fn bind<F, R>(f: F) -> impl FnOnce() -> R
where
    F: FnOnce() -> R,
{
    let span = current();
    move || match span {
        Some(span) => CURRENT.sync_scope(span, f),
        None => f(),
    }
}

pub trait WithContext: Future + Sized {
    /// Run this future inside `span`.
    fn with_span(self, span: Arc<Span>) -> TaskLocalFuture<Arc<Span>, Self> {
        CURRENT.scope(span, self)
    }

    /// Run this future inside whatever span is active now, wherever it is
    /// eventually polled.
    fn in_current_context(self) -> Either<TaskLocalFuture<Arc<Span>, Self>, Self> {
        match current() {
            Some(span) => Either::Left(CURRENT.scope(span, self)),
            None => Either::Right(self),
        }
    }
}

impl<F: Future> WithContext for F {}
