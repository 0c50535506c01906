//! Batching delivery stream.
//!
//! Actions are serialized through a bounded MPSC channel to a single worker
//! task. The worker drains whatever has queued up (at most the high-water
//! mark) and hands it to the sink as one batch, so batches preserve write
//! order. A full channel makes writers wait instead of dropping.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use actiontrail_core::errors::DeliveryError;
use actiontrail_core::Action;

use crate::settings::StreamSettings;
use crate::sink::ActionSink;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("delivery stream closed")]
    Closed,
}

/// Outcome of [`ActionStream::try_write`] when the action was not queued.
#[derive(Debug)]
pub enum TryWriteError {
    /// Queue at its high-water mark; the action is handed back.
    Full(Box<Action>),
    Closed,
}

#[derive(Clone, Debug)]
pub struct StreamOptions {
    pub high_water_mark: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// Retry budget per batch, measured from the first attempt.
    pub max_retry_elapsed: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::from(&StreamSettings::default())
    }
}

impl From<&StreamSettings> for StreamOptions {
    fn from(settings: &StreamSettings) -> Self {
        Self {
            high_water_mark: settings.high_water_mark.max(1),
            max_retries: settings.max_retries,
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
            max_retry_delay: Duration::from_millis(settings.max_retry_delay_ms),
            max_retry_elapsed: Duration::from_millis(settings.max_retry_elapsed_ms),
        }
    }
}

/// Counters kept by the worker.
#[derive(Debug, Default)]
pub struct StreamStats {
    written: AtomicU64,
    delivered: AtomicU64,
    failed_batches: AtomicU64,
    dropped: AtomicU64,
}

impl StreamStats {
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failed_batches(&self) -> u64 {
        self.failed_batches.load(Ordering::Relaxed)
    }

    /// Actions lost with a failed batch.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

enum Command {
    Write(Box<Action>),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

pub struct ActionStream {
    tx: mpsc::Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<StreamStats>,
}

impl ActionStream {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn new(sink: Arc<dyn ActionSink>, options: StreamOptions) -> Self {
        let (tx, rx) = mpsc::channel(options.high_water_mark);
        let stats = Arc::new(StreamStats::default());
        let worker = tokio::spawn(stream_worker(rx, sink, options, Arc::clone(&stats)));
        Self {
            tx,
            worker: Mutex::new(Some(worker)),
            stats,
        }
    }

    /// Queue an action, waiting while the queue is at its high-water mark.
    pub async fn write(&self, action: Action) -> Result<(), StreamError> {
        self.tx
            .send(Command::Write(Box::new(action)))
            .await
            .map_err(|_| StreamError::Closed)?;
        self.stats.written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Queue an action without waiting.
    pub fn try_write(&self, action: Action) -> Result<(), TryWriteError> {
        match self.tx.try_send(Command::Write(Box::new(action))) {
            Ok(()) => {
                self.stats.written.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(Command::Write(action))) => Err(TryWriteError::Full(action)),
            Err(_) => Err(TryWriteError::Closed),
        }
    }

    /// Deliver everything written so far. Delivery failures are handled by
    /// the worker and do not surface here.
    pub async fn flush(&self) -> Result<(), StreamError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(reply_tx))
            .await
            .map_err(|_| StreamError::Closed)?;
        reply_rx.await.map_err(|_| StreamError::Closed)
    }

    /// Flush pending actions and stop the worker. Later writes fail with
    /// [`StreamError::Closed`].
    pub async fn close(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(reply_tx)).await.is_ok() {
            let _ = reply_rx.await;
        }
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "delivery worker exited abnormally");
            }
        }
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn stream_worker(
    mut rx: mpsc::Receiver<Command>,
    sink: Arc<dyn ActionSink>,
    options: StreamOptions,
    stats: Arc<StreamStats>,
) {
    let mut commands = Vec::with_capacity(options.high_water_mark);
    let mut pending: Vec<Action> = Vec::with_capacity(options.high_water_mark);

    loop {
        if rx.recv_many(&mut commands, options.high_water_mark).await == 0 {
            // Every handle dropped.
            deliver(&*sink, &mut pending, &options, &stats).await;
            return;
        }
        for command in commands.drain(..) {
            match command {
                Command::Write(action) => {
                    pending.push(*action);
                    if pending.len() >= options.high_water_mark {
                        deliver(&*sink, &mut pending, &options, &stats).await;
                    }
                }
                Command::Flush(reply) => {
                    deliver(&*sink, &mut pending, &options, &stats).await;
                    let _ = reply.send(());
                }
                Command::Shutdown(reply) => {
                    deliver(&*sink, &mut pending, &options, &stats).await;
                    rx.close();
                    let _ = reply.send(());
                    debug!(sink = sink.name(), "delivery worker stopped");
                    return;
                }
            }
        }
        deliver(&*sink, &mut pending, &options, &stats).await;
    }
}

/// Send `pending` as one batch, retrying transient failures. The batch is
/// dropped once retries run out.
async fn deliver(
    sink: &dyn ActionSink,
    pending: &mut Vec<Action>,
    options: &StreamOptions,
    stats: &StreamStats,
) {
    if pending.is_empty() {
        return;
    }
    let batch = std::mem::take(pending);
    let batch_size = batch.len();

    let started = tokio::time::Instant::now();
    let mut attempt = 0;
    loop {
        let outcome = AssertUnwindSafe(sink.deliver(&batch))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(DeliveryError::Rejected(format!("sink panicked: {}", panic_message(&*panic)))));
        match outcome {
            Ok(()) => {
                stats.delivered.fetch_add(batch_size as u64, Ordering::Relaxed);
                debug!(sink = sink.name(), batch_size, attempt, "batch flushed");
                return;
            }
            Err(e)
                if e.is_retryable()
                    && attempt < options.max_retries
                    && started.elapsed() + retry_delay(&e, options, attempt) <= options.max_retry_elapsed =>
            {
                let delay = retry_delay(&e, options, attempt);
                warn!(
                    sink = sink.name(),
                    batch_size,
                    attempt,
                    error_kind = e.error_kind(),
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "batch delivery failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                stats.failed_batches.fetch_add(1, Ordering::Relaxed);
                stats.dropped.fetch_add(batch_size as u64, Ordering::Relaxed);
                error!(
                    sink = sink.name(),
                    batch_size,
                    error_kind = e.error_kind(),
                    error = %e,
                    "batch delivery failed; batch dropped"
                );
                return;
            }
        }
    }
}

/// Server hint when present, else exponential backoff from the base delay.
/// Never longer than `max_retry_delay`.
fn retry_delay(error: &DeliveryError, options: &StreamOptions, attempt: u32) -> Duration {
    error
        .suggested_delay()
        .unwrap_or_else(|| options.retry_delay.saturating_mul(2u32.saturating_pow(attempt)))
        .min(options.max_retry_delay)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    fn action(n: usize) -> Action {
        Action::new("HTTP", "POST").with_object(format!("/items/{n}"))
    }

    fn options(high_water_mark: usize) -> StreamOptions {
        StreamOptions {
            high_water_mark,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn flush_delivers_in_write_order() {
        let sink = Arc::new(MemorySink::default());
        let stream = ActionStream::new(sink.clone(), options(10));
        for n in 0..3 {
            stream.write(action(n)).await.unwrap();
        }
        stream.flush().await.unwrap();

        let objects: Vec<_> = sink
            .actions()
            .into_iter()
            .map(|a| a.action.object.unwrap())
            .collect();
        assert_eq!(objects, vec!["/items/0", "/items/1", "/items/2"]);
        assert_eq!(stream.stats().delivered(), 3);
    }

    #[tokio::test]
    async fn batches_never_exceed_high_water_mark() {
        let sink = Arc::new(MemorySink::default());
        let stream = ActionStream::new(sink.clone(), options(2));
        for n in 0..5 {
            stream.write(action(n)).await.unwrap();
        }
        stream.flush().await.unwrap();

        let batches = sink.batches();
        assert!(batches.iter().all(|b| b.len() <= 2), "{batches:?}");
        assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 5);
    }

    #[tokio::test]
    async fn failing_sink_drops_batch_and_keeps_accepting() {
        let sink = Arc::new(MemorySink::failing());
        let stream = ActionStream::new(sink.clone(), options(10));
        for n in 0..3 {
            stream.write(action(n)).await.unwrap();
        }
        stream.flush().await.unwrap();
        assert_eq!(stream.stats().failed_batches(), 1);
        assert_eq!(stream.stats().dropped(), 3);

        sink.set_failing(false);
        stream.write(action(3)).await.unwrap();
        stream.flush().await.unwrap();
        assert_eq!(sink.actions().len(), 1);
    }

    struct Flaky {
        failures_left: AtomicU32,
        inner: MemorySink,
    }

    #[async_trait]
    impl ActionSink for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn deliver(&self, batch: &[Action]) -> Result<(), DeliveryError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(DeliveryError::Network("connection reset".into()));
            }
            self.inner.deliver(batch).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let sink = Arc::new(Flaky {
            failures_left: AtomicU32::new(2),
            inner: MemorySink::default(),
        });
        let stream = ActionStream::new(sink.clone(), options(10));
        stream.write(action(0)).await.unwrap();
        stream.flush().await.unwrap();

        assert_eq!(sink.inner.actions().len(), 1);
        assert_eq!(stream.stats().failed_batches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let sink = Arc::new(Flaky {
            failures_left: AtomicU32::new(10),
            inner: MemorySink::default(),
        });
        let stream = ActionStream::new(sink.clone(), options(10));
        stream.write(action(0)).await.unwrap();
        stream.flush().await.unwrap();

        assert!(sink.inner.actions().is_empty());
        assert_eq!(stream.stats().failed_batches(), 1);
        // one attempt plus two retries
        assert_eq!(sink.failures_left.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn close_flushes_and_rejects_later_writes() {
        let sink = Arc::new(MemorySink::default());
        let stream = ActionStream::new(sink.clone(), options(10));
        stream.write(action(0)).await.unwrap();
        stream.close().await;

        assert_eq!(sink.actions().len(), 1);
        assert!(stream.is_closed());
        assert!(matches!(stream.write(action(1)).await, Err(StreamError::Closed)));
    }

    #[test]
    fn backoff_doubles_unless_hinted() {
        let options = StreamOptions {
            retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(5),
            ..Default::default()
        };
        let network = DeliveryError::Network("x".into());
        assert_eq!(retry_delay(&network, &options, 0), Duration::from_millis(100));
        assert_eq!(retry_delay(&network, &options, 2), Duration::from_millis(400));
        let limited = DeliveryError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(retry_delay(&limited, &options, 3), Duration::from_secs(2));
    }

    #[test]
    fn delay_is_capped() {
        let options = StreamOptions {
            retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(1),
            ..Default::default()
        };
        let limited = DeliveryError::RateLimited {
            retry_after: Some(Duration::from_secs(3600)),
        };
        assert_eq!(retry_delay(&limited, &options, 0), Duration::from_secs(1));
        let network = DeliveryError::Network("x".into());
        assert_eq!(retry_delay(&network, &options, 20), Duration::from_secs(1));
    }

    struct RateLimited {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ActionSink for RateLimited {
        fn name(&self) -> &str {
            "rate-limited"
        }

        async fn deliver(&self, _batch: &[Action]) -> Result<(), DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(DeliveryError::RateLimited {
                retry_after: Some(Duration::from_secs(3600)),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn long_retry_after_does_not_stall_writers() {
        let sink = Arc::new(RateLimited { calls: AtomicU32::new(0) });
        let stream = ActionStream::new(sink.clone(), options(1));

        let writes = async {
            for n in 0..3 {
                stream.write(action(n)).await.unwrap();
            }
            stream.flush().await.unwrap();
        };
        tokio::time::timeout(Duration::from_secs(60), writes)
            .await
            .expect("writers blocked behind a rate-limited sink");
        assert_eq!(stream.stats().failed_batches(), 3);
        assert_eq!(stream.stats().dropped(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_bounds_time_per_batch() {
        let sink = Arc::new(RateLimited { calls: AtomicU32::new(0) });
        let stream = ActionStream::new(
            sink.clone(),
            StreamOptions {
                high_water_mark: 10,
                max_retries: 100,
                retry_delay: Duration::from_millis(250),
                max_retry_delay: Duration::from_secs(2),
                max_retry_elapsed: Duration::from_secs(5),
            },
        );
        let started = tokio::time::Instant::now();
        stream.write(action(0)).await.unwrap();
        stream.flush().await.unwrap();

        assert!(started.elapsed() <= Duration::from_secs(5));
        // first attempt, then waits of 2s and 2s before the budget runs out
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        assert_eq!(stream.stats().failed_batches(), 1);
    }

    struct Panicking {
        panicked: AtomicU32,
        inner: MemorySink,
    }

    #[async_trait]
    impl ActionSink for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn deliver(&self, batch: &[Action]) -> Result<(), DeliveryError> {
            if self.panicked.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("storage engine bug");
            }
            self.inner.deliver(batch).await
        }
    }

    #[tokio::test]
    async fn sink_panic_fails_the_batch_not_the_stream() {
        let sink = Arc::new(Panicking {
            panicked: AtomicU32::new(0),
            inner: MemorySink::default(),
        });
        let stream = ActionStream::new(sink.clone(), options(10));
        stream.write(action(0)).await.unwrap();
        stream.flush().await.unwrap();
        assert_eq!(stream.stats().failed_batches(), 1);

        stream.write(action(1)).await.unwrap();
        stream.flush().await.unwrap();
        assert!(!stream.is_closed());
        assert_eq!(sink.inner.actions().len(), 1);
    }

    #[tokio::test]
    async fn try_write_hands_back_when_full() {
        let (tx, _rx) = mpsc::channel(1);
        let stream = ActionStream {
            tx,
            worker: Mutex::new(None),
            stats: Arc::new(StreamStats::default()),
        };
        stream.try_write(action(0)).unwrap();
        match stream.try_write(action(1)) {
            Err(TryWriteError::Full(back)) => assert_eq!(back.action.object.as_deref(), Some("/items/1")),
            other => panic!("expected Full, got {other:?}"),
        }
        assert_eq!(stream.stats().written(), 1);
    }
}
