//! Fixed-size pool of worker threads fed by one bounded queue.
//!
//! Each worker owns its own stage instance (its own model session), pulls a
//! batch from the shared queue, processes it without holding any lock, and
//! pushes one output per input to the shared result channel. Submission
//! never blocks: when the queue is full the item is skipped.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::detection::domain::face_detector::BackendError;
use crate::pipeline::pipeline_error::PipelineError;
use crate::pipeline::pipeline_logger::PipelineLogger;

/// Work done by one pool worker.
pub trait WorkerStage: Send + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Processes a batch, returning exactly one output per input in order.
    fn process(&mut self, batch: &[Self::Input]) -> Result<Vec<Self::Output>, BackendError>;

    /// Output emitted for an input whose batch failed.
    fn failure(input: &Self::Input, reason: &str) -> Self::Output;
}

/// Builds the stage for worker `index`; called again when a worker restarts.
pub type StageFactory<S> = Arc<dyn Fn(usize) -> Result<S, BackendError> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct PoolSettings {
    pub name: &'static str,
    pub workers: usize,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub poll_interval: Duration,
    pub shutdown_timeout: Duration,
    pub max_restarts: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submission {
    Accepted,
    /// Queue saturated; the item was dropped.
    Skipped,
    /// The pool is shut down.
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolHealth {
    Healthy,
    Degraded { alive: usize, total: usize },
    Exhausted,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub submitted: u64,
    pub skipped: u64,
    pub processed: u64,
    pub failed: u64,
    pub restarts: u64,
    pub alive_workers: usize,
    pub total_workers: usize,
    pub queued: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub joined: usize,
    /// Workers still busy at the deadline, left to finish on their own.
    pub detached: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    skipped: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    restarts: AtomicU64,
    alive: AtomicUsize,
}

struct WorkerContext<S: WorkerStage> {
    index: usize,
    settings: PoolSettings,
    factory: StageFactory<S>,
    input_rx: Receiver<S::Input>,
    output_tx: Sender<S::Output>,
    active: Arc<AtomicBool>,
    counters: Arc<Counters>,
    logger: Arc<dyn PipelineLogger>,
    exit_tx: Sender<usize>,
}

pub struct WorkerPool<S: WorkerStage> {
    settings: PoolSettings,
    input_tx: Sender<S::Input>,
    input_rx: Receiver<S::Input>,
    output_rx: Receiver<S::Output>,
    exit_rx: Receiver<usize>,
    active: Arc<AtomicBool>,
    counters: Arc<Counters>,
    handles: Vec<Option<JoinHandle<()>>>,
}

impl<S: WorkerStage> WorkerPool<S> {
    /// Builds one stage per worker on the calling thread, then starts the
    /// workers. Fails if any stage or thread cannot be created.
    pub fn spawn(
        settings: PoolSettings,
        factory: StageFactory<S>,
        logger: Arc<dyn PipelineLogger>,
    ) -> Result<Self, PipelineError> {
        let workers = settings.workers.max(1);
        let (input_tx, input_rx) = crossbeam_channel::bounded(settings.queue_capacity.max(1));
        // Drained by the orchestrator every cycle; inputs are already bounded.
        let (output_tx, output_rx) = crossbeam_channel::unbounded();
        let (exit_tx, exit_rx) = crossbeam_channel::unbounded();
        let active = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(Counters::default());

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let stage = match factory(index) {
                Ok(stage) => stage,
                Err(source) => {
                    active.store(false, Ordering::SeqCst);
                    return Err(PipelineError::Backend {
                        pool: settings.name,
                        source,
                    });
                }
            };
            let ctx = WorkerContext {
                index,
                settings: settings.clone(),
                factory: factory.clone(),
                input_rx: input_rx.clone(),
                output_tx: output_tx.clone(),
                active: active.clone(),
                counters: counters.clone(),
                logger: logger.clone(),
                exit_tx: exit_tx.clone(),
            };
            counters.alive.fetch_add(1, Ordering::SeqCst);
            let spawned = thread::Builder::new()
                .name(format!("{}-{index}", settings.name))
                .spawn(move || worker_loop(stage, ctx));
            match spawned {
                Ok(handle) => handles.push(Some(handle)),
                Err(source) => {
                    counters.alive.fetch_sub(1, Ordering::SeqCst);
                    active.store(false, Ordering::SeqCst);
                    return Err(PipelineError::Spawn {
                        pool: settings.name,
                        source,
                    });
                }
            }
        }
        log::debug!("Started {workers} {} worker(s)", settings.name);

        Ok(Self {
            settings,
            input_tx,
            input_rx,
            output_rx,
            exit_rx,
            active,
            counters,
            handles,
        })
    }

    /// Queues `item` without blocking.
    pub fn submit(&self, item: S::Input) -> Submission {
        if !self.active.load(Ordering::SeqCst) {
            return Submission::Closed;
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        match self.input_tx.try_send(item) {
            Ok(()) => Submission::Accepted,
            Err(TrySendError::Full(_)) => {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                Submission::Skipped
            }
            Err(TrySendError::Disconnected(_)) => Submission::Closed,
        }
    }

    pub fn try_recv(&self) -> Option<S::Output> {
        self.output_rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<S::Output> {
        self.output_rx.recv_timeout(timeout).ok()
    }

    pub fn drain(&self) -> Vec<S::Output> {
        self.output_rx.try_iter().collect()
    }

    /// Items queued and not yet picked up by a worker.
    pub fn pending(&self) -> usize {
        self.input_rx.len()
    }

    pub fn health(&self) -> PoolHealth {
        let total = self.handles.len();
        let alive = self.counters.alive.load(Ordering::SeqCst);
        if alive == 0 {
            PoolHealth::Exhausted
        } else if alive < total {
            PoolHealth::Degraded { alive, total }
        } else {
            PoolHealth::Healthy
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            restarts: self.counters.restarts.load(Ordering::Relaxed),
            alive_workers: self.counters.alive.load(Ordering::SeqCst),
            total_workers: self.handles.len(),
            queued: self.pending(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.settings.name
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stops the workers, waiting at most `shutdown_timeout` in total.
    ///
    /// Queued items are discarded. Workers that have not exited by the
    /// deadline are detached and finish their current batch on their own.
    pub fn shutdown(&mut self) -> ShutdownReport {
        if !self.active.swap(false, Ordering::SeqCst) {
            return ShutdownReport::default();
        }
        while self.input_rx.try_recv().is_ok() {}

        let deadline = Instant::now() + self.settings.shutdown_timeout;
        let mut report = ShutdownReport::default();
        let mut remaining = self.handles.iter().filter(|h| h.is_some()).count();
        while remaining > 0 {
            match self.exit_rx.recv_deadline(deadline) {
                Ok(index) => {
                    if let Some(handle) = self.handles.get_mut(index).and_then(Option::take) {
                        if handle.join().is_err() {
                            log::warn!("{} worker {index} panicked on exit", self.settings.name);
                        }
                        report.joined += 1;
                        remaining -= 1;
                    }
                }
                Err(_) => break,
            }
        }

        for (index, slot) in self.handles.iter_mut().enumerate() {
            if let Some(handle) = slot.take() {
                if handle.is_finished() {
                    let _ = handle.join();
                    report.joined += 1;
                } else {
                    log::warn!(
                        "{} worker {index} did not stop within {:?}, detaching",
                        self.settings.name,
                        self.settings.shutdown_timeout
                    );
                    report.detached += 1;
                }
            }
        }
        report
    }
}

impl<S: WorkerStage> Drop for WorkerPool<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<S: WorkerStage>(mut stage: S, ctx: WorkerContext<S>) {
    let name = ctx.settings.name;
    let mut restarts_left = ctx.settings.max_restarts;

    'work: while ctx.active.load(Ordering::SeqCst) {
        let batch = match collect_batch(&ctx) {
            Batch::Ready(batch) => batch,
            Batch::Idle => continue,
            Batch::Closed => break,
        };

        let start = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| stage.process(&batch)));
        ctx.logger
            .timing(name, start.elapsed().as_secs_f64() * 1000.0);

        match outcome {
            Ok(Ok(outputs)) => {
                ctx.counters
                    .processed
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                for output in outputs {
                    let _ = ctx.output_tx.send(output);
                }
            }
            Ok(Err(e)) => {
                log::warn!("{name} worker {} failed a batch of {}: {e}", ctx.index, batch.len());
                emit_failures::<S>(&ctx, &batch, &e.to_string());
            }
            Err(_) => {
                log::error!("{name} worker {} panicked", ctx.index);
                emit_failures::<S>(&ctx, &batch, "worker panicked");
                loop {
                    if restarts_left == 0 {
                        log::error!(
                            "{name} worker {} exhausted its restarts, stopping",
                            ctx.index
                        );
                        break 'work;
                    }
                    restarts_left -= 1;
                    ctx.counters.restarts.fetch_add(1, Ordering::Relaxed);
                    match (ctx.factory)(ctx.index) {
                        Ok(fresh) => {
                            stage = fresh;
                            log::info!("{name} worker {} restarted", ctx.index);
                            break;
                        }
                        Err(e) => log::warn!("{name} worker {} restart failed: {e}", ctx.index),
                    }
                }
            }
        }
    }

    ctx.counters.alive.fetch_sub(1, Ordering::SeqCst);
    let _ = ctx.exit_tx.send(ctx.index);
}

enum Batch<T> {
    Ready(Vec<T>),
    Idle,
    Closed,
}

/// Waits up to `poll_interval` for a first item, then keeps collecting for
/// up to `batch_timeout` or until the batch is full.
fn collect_batch<S: WorkerStage>(ctx: &WorkerContext<S>) -> Batch<S::Input> {
    let first = match ctx.input_rx.recv_timeout(ctx.settings.poll_interval) {
        Ok(item) => item,
        Err(RecvTimeoutError::Timeout) => return Batch::Idle,
        Err(RecvTimeoutError::Disconnected) => return Batch::Closed,
    };
    let batch_size = ctx.settings.batch_size.max(1);
    let mut batch = Vec::with_capacity(batch_size);
    batch.push(first);

    let deadline = Instant::now() + ctx.settings.batch_timeout;
    while batch.len() < batch_size {
        match ctx.input_rx.recv_deadline(deadline) {
            Ok(item) => batch.push(item),
            Err(_) => break,
        }
    }
    Batch::Ready(batch)
}

fn emit_failures<S: WorkerStage>(ctx: &WorkerContext<S>, batch: &[S::Input], reason: &str) {
    ctx.counters
        .failed
        .fetch_add(batch.len() as u64, Ordering::Relaxed);
    for input in batch {
        let _ = ctx.output_tx.send(S::failure(input, reason));
    }
}
