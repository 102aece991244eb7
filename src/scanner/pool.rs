//! Fixed-size worker pool draining a bounded queue.
//!
//! The producer (the caller's task) pulls units from a lazy iterator and
//! pushes them into a bounded channel. When the channel is full the producer
//! waits, which is the only backpressure in the system: at no point are more
//! than `workers + queue_capacity + 1` units alive at once, no matter how
//! large the target space is.
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;

use futures::future::join_all;
use log::{debug, warn};
use tokio::sync::{mpsc, watch, Mutex};

use super::aggregator::{ResultAggregator, ResultSink};
use super::cancel::Cancellation;

/// Lifecycle of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Constructed, nothing spawned yet.
    Idle,
    /// Producer is pushing, workers are consuming.
    Running,
    /// Producer is finished, workers are completing in-flight units.
    Draining,
    /// Every worker exited and the results are final.
    Done,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// `W` workers pulling from one bounded queue.
#[derive(Debug)]
pub struct WorkerPool {
    workers: NonZeroUsize,
    queue_capacity: NonZeroUsize,
    state: watch::Sender<PoolState>,
}

impl WorkerPool {
    /// A pool of `workers` workers whose queue holds as many units as there
    /// are workers.
    pub fn new(workers: NonZeroUsize) -> Self {
        let (state, _) = watch::channel(PoolState::Idle);
        Self {
            workers,
            queue_capacity: workers,
            state,
        }
    }

    /// Overrides the queue capacity.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Number of workers.
    pub const fn workers(&self) -> NonZeroUsize {
        self.workers
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PoolState {
        *self.state.borrow()
    }

    /// Follows state transitions; stays valid after the pool is consumed.
    pub fn watch_state(&self) -> watch::Receiver<PoolState> {
        self.state.subscribe()
    }

    fn transition(&self, next: PoolState) {
        let previous = self.state.send_replace(next);
        debug!("Worker pool {previous} -> {next}");
    }

    /// Feeds every unit to `work` on one of the workers and returns the
    /// outcomes `work` chose to keep, in no particular order.
    ///
    /// Returns only once the producer is finished, every worker has been
    /// joined and the collector has drained. If `cancel` fires, the producer
    /// stops, queued units are discarded, in-flight calls to `work` are
    /// dropped without an outcome, and whatever was already collected is
    /// returned.
    pub async fn run<I, F, Fut, R>(self, units: I, cancel: &Cancellation, work: F) -> Vec<R>
    where
        I: IntoIterator,
        I::Item: Send + 'static,
        F: Fn(I::Item) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<R>> + Send + 'static,
        R: Send + 'static,
    {
        let (queue_tx, queue_rx) = mpsc::channel(self.queue_capacity.get());
        let queue = Arc::new(Mutex::new(queue_rx));
        let work = Arc::new(work);
        let (aggregator, sink) = ResultAggregator::spawn();

        self.transition(PoolState::Running);
        let handles: Vec<_> = (0..self.workers.get())
            .map(|id| {
                tokio::spawn(worker(
                    id,
                    Arc::clone(&queue),
                    Arc::clone(&work),
                    sink.clone(),
                    cancel.clone(),
                ))
            })
            .collect();
        // Workers now hold the only sinks and receivers, so the collector
        // closes and the producer unblocks as soon as they are all gone.
        drop(sink);
        drop(queue);

        let produced = produce(units, &queue_tx, cancel).await;
        drop(queue_tx);
        self.transition(PoolState::Draining);
        debug!("Producer finished after {produced} units");

        let mut handled = 0;
        for joined in join_all(handles).await {
            match joined {
                Ok(count) => handled += count,
                Err(e) => warn!("Worker exited abnormally: {e}"),
            }
        }

        let results = aggregator.finish().await;
        self.transition(PoolState::Done);
        debug!(
            "Workers handled {handled} of {produced} units, {} results kept",
            results.len()
        );
        results
    }
}

async fn produce<I>(units: I, queue: &mpsc::Sender<I::Item>, cancel: &Cancellation) -> usize
where
    I: IntoIterator,
{
    let mut produced = 0;
    for unit in units {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            sent = queue.send(unit) => {
                if sent.is_err() {
                    break;
                }
                produced += 1;
            }
        }
    }
    produced
}

async fn worker<T, F, Fut, R>(
    id: usize,
    queue: Arc<Mutex<mpsc::Receiver<T>>>,
    work: Arc<F>,
    sink: ResultSink<R>,
    cancel: Cancellation,
) -> usize
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Option<R>>,
{
    let mut handled = 0;
    loop {
        let next = {
            let mut queue = queue.lock().await;
            tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                unit = queue.recv() => unit,
            }
        };
        let Some(unit) = next else {
            break;
        };
        handled += 1;

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            outcome = (*work)(unit) => outcome,
        };

        if let Some(result) = outcome {
            if !sink.push(result) {
                break;
            }
        }
    }
    debug!("Worker {id} exiting after {handled} units");
    handled
}
