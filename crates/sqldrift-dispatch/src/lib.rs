//! Worker-pool dispatch for blocking database operations.
//!
//! A [`Dispatcher`] owns a bounded pool of worker threads fed by a bounded
//! job queue. Callers submit closures that perform blocking socket I/O and
//! get back a one-shot [`Completion`] (or a [`StreamHandle`] when the
//! operation produces rows incrementally). The caller's own thread never
//! blocks on the socket; it blocks, if at all, only on the handles it
//! chooses to wait on.
//!
//! Ordering guarantees:
//!
//! - A completion is delivered exactly once per submitted operation.
//! - Streamed rows arrive in the order the producer sent them, strictly
//!   before the final outcome.
//! - Operations submitted to the pool may run in parallel; serialization
//!   per connection is the caller's concern, not the pool's.
//!
//! Backpressure: the row channel is bounded, so a slow consumer blocks the
//! producing worker rather than buffering without limit.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use tracing::{debug, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Dispatcher tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Number of worker threads
    pub workers: usize,
    /// Capacity of the job queue; submit blocks when it is full
    pub queue_depth: usize,
    /// Capacity of each streaming row channel
    pub row_buffer: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 64,
            row_buffer: 64,
        }
    }
}

impl DispatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker thread count (minimum 1).
    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n.max(1);
        self
    }

    /// Set the job queue capacity.
    pub fn queue_depth(mut self, n: usize) -> Self {
        self.queue_depth = n.max(1);
        self
    }

    /// Set the per-stream row buffer capacity.
    pub fn row_buffer(mut self, n: usize) -> Self {
        self.row_buffer = n.max(1);
        self
    }
}

/// The worker exited without delivering a completion.
///
/// Seen only when the pool shuts down mid-operation or a worker panicked;
/// callers should treat it as a fatal dispatcher failure, not retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected;

impl std::fmt::Display for Disconnected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dispatcher dropped the operation before completing it")
    }
}

impl std::error::Error for Disconnected {}

/// One-shot handle for the outcome of a submitted operation.
pub struct Completion<T> {
    inner: CompletionInner<T>,
}

enum CompletionInner<T> {
    /// Resolved without touching the pool (fail-fast results)
    Ready(Option<T>),
    Pending(Receiver<T>),
}

impl<T> Completion<T> {
    /// A completion that is already resolved.
    pub fn ready(value: T) -> Self {
        Self {
            inner: CompletionInner::Ready(Some(value)),
        }
    }

    /// Block until the outcome is delivered.
    pub fn wait(self) -> Result<T, Disconnected> {
        match self.inner {
            CompletionInner::Ready(slot) => slot.ok_or(Disconnected),
            CompletionInner::Pending(rx) => rx.recv().map_err(|_| Disconnected),
        }
    }

    /// Block until the outcome is delivered or the timeout expires.
    ///
    /// Returns `None` on timeout; the operation keeps running and the
    /// completion stays valid.
    pub fn wait_timeout(&mut self, timeout: std::time::Duration) -> Option<Result<T, Disconnected>> {
        match &mut self.inner {
            CompletionInner::Ready(slot) => slot.take().map(Ok),
            CompletionInner::Pending(rx) => match rx.recv_timeout(timeout) {
                Ok(v) => Some(Ok(v)),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => Some(Err(Disconnected)),
            },
        }
    }

    /// Poll for the outcome without blocking.
    ///
    /// Returns `None` while the operation is still running.
    pub fn try_wait(&mut self) -> Option<Result<T, Disconnected>> {
        match &mut self.inner {
            CompletionInner::Ready(slot) => slot.take().map(Ok),
            CompletionInner::Pending(rx) => match rx.try_recv() {
                Ok(v) => Some(Ok(v)),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => Some(Err(Disconnected)),
            },
        }
    }
}

/// Shared cancellation flag for a streaming operation.
///
/// Cancellation is observed at row granularity: the producer checks the
/// token between rows, never mid-parse.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// The consumer stopped accepting rows (cancelled or went away).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

/// Producer-side handle for a row stream.
///
/// `send` blocks while the bounded row buffer is full, so a slow consumer
/// throttles the producing worker instead of growing a queue.
pub struct RowSender<R> {
    tx: Sender<R>,
    cancel: CancelToken,
}

impl<R> RowSender<R> {
    /// Deliver one row to the consumer, in order.
    ///
    /// Fails once the consumer cancelled or dropped its end; the producer
    /// should stop delivering and settle its underlying resource.
    pub fn send(&self, row: R) -> Result<(), SinkClosed> {
        if self.cancel.is_cancelled() {
            return Err(SinkClosed);
        }
        self.tx.send(row).map_err(|_| SinkClosed)
    }

    /// True once the consumer requested cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Consumer-side handle for a streaming operation.
///
/// Rows are pulled with [`next_row`](Self::next_row) (wire order); the
/// final outcome is collected with [`finish`](Self::finish), which first
/// drops the row channel so a producer blocked on a full buffer can unwind.
pub struct StreamHandle<R, T> {
    rows: Option<Receiver<R>>,
    done: Completion<T>,
    cancel: CancelToken,
}

impl<R, T> StreamHandle<R, T> {
    /// A stream with no rows whose outcome is already resolved
    /// (fail-fast results).
    pub fn ready(outcome: T) -> Self {
        Self {
            rows: None,
            done: Completion::ready(outcome),
            cancel: CancelToken::new(),
        }
    }

    /// Request cancellation; no further rows reach this handle.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A clonable token observing the same cancellation flag.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Pull the next row, blocking until one arrives or the stream ends.
    ///
    /// Returns `None` once the producer finished or cancellation was
    /// requested; after cancellation the row channel is dropped so the
    /// producer unblocks.
    pub fn next_row(&mut self) -> Option<R> {
        if self.cancel.is_cancelled() {
            self.rows = None;
            return None;
        }
        match self.rows.as_ref()?.recv() {
            Ok(row) => Some(row),
            Err(_) => {
                self.rows = None;
                None
            }
        }
    }

    /// Drop the row channel and wait for the final outcome.
    pub fn finish(mut self) -> Result<T, Disconnected> {
        self.rows = None;
        self.done.wait()
    }
}

/// A bounded pool of worker threads executing blocking operations.
///
/// Dropping the dispatcher closes the job queue and joins the workers;
/// jobs already queued still run to completion.
pub struct Dispatcher {
    job_tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    row_buffer: usize,
}

impl Dispatcher {
    /// Spawn the worker pool.
    pub fn new(config: DispatchConfig) -> Self {
        let (job_tx, job_rx) = bounded::<Job>(config.queue_depth);
        let mut workers = Vec::with_capacity(config.workers);
        for i in 0..config.workers {
            let rx = job_rx.clone();
            let builder = std::thread::Builder::new().name(format!("sqldrift-worker-{i}"));
            match builder.spawn(move || worker_loop(i, &rx)) {
                Ok(handle) => workers.push(handle),
                Err(e) => debug!(worker = i, error = %e, "failed to spawn worker thread"),
            }
        }
        debug!(workers = workers.len(), "dispatcher started");
        Self {
            job_tx: Some(job_tx),
            workers,
            row_buffer: config.row_buffer,
        }
    }

    /// Run `op` on a worker; the returned completion resolves exactly once.
    pub fn submit<T, F>(&self, op: F) -> Completion<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let job: Job = Box::new(move || {
            let _ = tx.send(op());
        });
        self.enqueue(job);
        Completion {
            inner: CompletionInner::Pending(rx),
        }
    }

    /// Run a row-producing `op` on a worker.
    ///
    /// The operation receives a [`RowSender`] whose sends fail once the
    /// consumer cancels or drops the handle; it must settle its resource
    /// and still return an outcome in that case.
    pub fn submit_streaming<R, T, F>(&self, op: F) -> StreamHandle<R, T>
    where
        R: Send + 'static,
        T: Send + 'static,
        F: FnOnce(RowSender<R>) -> T + Send + 'static,
    {
        let cancel = CancelToken::new();
        let (row_tx, row_rx) = bounded(self.row_buffer);
        let (done_tx, done_rx) = bounded(1);
        let sender = RowSender {
            tx: row_tx,
            cancel: cancel.clone(),
        };
        let job: Job = Box::new(move || {
            let outcome = op(sender);
            let _ = done_tx.send(outcome);
        });
        self.enqueue(job);
        StreamHandle {
            rows: Some(row_rx),
            done: Completion {
                inner: CompletionInner::Pending(done_rx),
            },
            cancel,
        }
    }

    fn enqueue(&self, job: Job) {
        if let Some(tx) = &self.job_tx {
            // Send fails only when every worker is gone; the dropped job
            // closes its completion channel, which surfaces Disconnected.
            let _ = tx.send(job);
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        drop(self.job_tx.take());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        debug!("dispatcher stopped");
    }
}

fn worker_loop(index: usize, rx: &Receiver<Job>) {
    trace!(worker = index, "worker online");
    while let Ok(job) = rx.recv() {
        job();
    }
    trace!(worker = index, "worker offline");
}
