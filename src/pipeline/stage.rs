use super::run::RunContext;
use super::{ErrorPolicy, StageError, Transform};
use futures::{Stream, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug, Default)]
pub(crate) struct StageCounters {
    processed: AtomicU64,
    failed: AtomicU64,
}

impl StageCounters {
    pub(crate) fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    pub(crate) fn failed(&self) -> u64 {
        self.failed.load(Ordering::Acquire)
    }
}

/// Applies the run's error policy to one failed item.
pub(crate) struct FailureSink {
    pub(crate) stage: Arc<str>,
    pub(crate) policy: ErrorPolicy,
    pub(crate) errors: Option<mpsc::UnboundedSender<StageError>>,
    pub(crate) first_failure: Arc<Mutex<Option<StageError>>>,
    pub(crate) cancel: CancellationToken,
}

impl FailureSink {
    /// Returns `false` when the worker must stop.
    fn record(&self, err: StageError) -> bool {
        match self.policy {
            ErrorPolicy::Drop => {
                warn!(stage = %self.stage, error = %err.source, "item dropped");
                true
            }
            ErrorPolicy::Report => {
                if let Some(errors) = &self.errors {
                    // A caller that stopped listening still gets the counters.
                    let _ = errors.send(err);
                }
                true
            }
            ErrorPolicy::Abort => {
                error!(stage = %self.stage, error = %err.source, "aborting pipeline");
                let mut first = self
                    .first_failure
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if first.is_none() {
                    *first = Some(err);
                }
                drop(first);
                self.cancel.cancel();
                false
            }
        }
    }
}

/// Spawn `concurrency` workers reading from `upstream` and return the queue
/// they write to. The queue closes once the last worker exits.
pub(crate) fn spawn_stage<In, Out>(
    index: usize,
    name: Arc<str>,
    concurrency: usize,
    transform: Arc<dyn Transform<In, Out>>,
    upstream: mpsc::Receiver<In>,
    ctx: &RunContext,
) -> mpsc::Receiver<Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    let (tx, rx) = mpsc::channel(ctx.queue_capacity);
    let upstream = Arc::new(tokio::sync::Mutex::new(upstream));
    let counters = Arc::clone(&ctx.counters[index]);

    for worker_id in 0..concurrency {
        let worker = Worker {
            stage: Arc::clone(&name),
            id: worker_id,
            transform: Arc::clone(&transform),
            upstream: Arc::clone(&upstream),
            tx: tx.clone(),
            counters: Arc::clone(&counters),
            sink: ctx.failure_sink(&name),
            cancel: ctx.cancel.clone(),
        };
        ctx.spawn(worker.run());
    }
    rx
}

struct Worker<In, Out> {
    stage: Arc<str>,
    id: usize,
    transform: Arc<dyn Transform<In, Out>>,
    upstream: Arc<tokio::sync::Mutex<mpsc::Receiver<In>>>,
    tx: mpsc::Sender<Out>,
    counters: Arc<StageCounters>,
    sink: FailureSink,
    cancel: CancellationToken,
}

impl<In, Out> Worker<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    async fn run(self) {
        let upstream = Arc::clone(&self.upstream);
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                item = async { upstream.lock().await.recv().await } => item,
            };
            let Some(item) = next else { break };

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.transform.apply(item) => result,
            };

            match result {
                Ok(out) => {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        sent = self.tx.send(out) => {
                            if sent.is_err() {
                                debug!(stage = %self.stage, "output dropped, cancelling run");
                                self.cancel.cancel();
                                break;
                            }
                        }
                    }
                    self.counters.processed.fetch_add(1, Ordering::AcqRel);
                }
                Err(source) => {
                    self.counters.failed.fetch_add(1, Ordering::AcqRel);
                    if !self.sink.record(StageError::new(&*self.stage, source)) {
                        break;
                    }
                }
            }
        }
        debug!(stage = %self.stage, worker = self.id, "worker exited");
    }
}

/// Push every item of `input` into the first queue.
pub(crate) async fn feed<S, I>(input: S, tx: mpsc::Sender<I>, cancel: CancellationToken)
where
    S: Stream<Item = I>,
{
    tokio::pin!(input);
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = input.next() => item,
        };
        let Some(item) = next else { break };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = tx.send(item) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}
