use super::stage::{FailureSink, StageCounters};
use super::{ErrorPolicy, PipelineConfig, StageError, StageSpec};
use crate::{Error, ErrorContext, Result};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub name: String,
    pub concurrency: usize,
    pub processed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub stages: Vec<StageReport>,
    /// Whether the run was cancelled (by the caller, by `Abort`, or because
    /// the output was dropped) rather than draining its input.
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

impl PipelineReport {
    pub fn total_failed(&self) -> u64 {
        self.stages.iter().map(|s| s.failed).sum()
    }

    /// Items that made it out of the last stage.
    pub fn emitted(&self) -> u64 {
        self.stages.last().map(|s| s.processed).unwrap_or(0)
    }
}

struct RunOutcome {
    report: PipelineReport,
    failure: Option<StageError>,
    panicked: usize,
}

/// Shared state of one run while its stages are being wired.
pub(crate) struct RunContext {
    pub(crate) run_id: String,
    pub(crate) cancel: CancellationToken,
    pub(crate) queue_capacity: usize,
    pub(crate) counters: Vec<Arc<StageCounters>>,
    specs: Vec<StageSpec>,
    policy: ErrorPolicy,
    errors_tx: mpsc::UnboundedSender<StageError>,
    errors_rx: mpsc::UnboundedReceiver<StageError>,
    first_failure: Arc<Mutex<Option<StageError>>>,
    runtime: Handle,
    span: tracing::Span,
    tasks: Mutex<JoinSet<()>>,
    started: Instant,
}

impl RunContext {
    pub(crate) fn new(
        config: &PipelineConfig,
        stages: &[StageSpec],
        cancel: CancellationToken,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            Error::runtime_with_context(
                "pipeline runs need a tokio runtime",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("pipeline"),
            )
        })?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("pipeline", run_id = %run_id);
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();

        info!(
            parent: &span,
            stages = stages.len(),
            queue_capacity = config.queue_capacity,
            policy = ?config.error_policy,
            "pipeline started"
        );

        Ok(Self {
            run_id,
            cancel,
            queue_capacity: config.queue_capacity,
            counters: stages
                .iter()
                .map(|_| Arc::new(StageCounters::default()))
                .collect(),
            specs: stages.to_vec(),
            policy: config.error_policy,
            errors_tx,
            errors_rx,
            first_failure: Arc::new(Mutex::new(None)),
            runtime,
            span,
            tasks: Mutex::new(JoinSet::new()),
            started: Instant::now(),
        })
    }

    /// Spawn a task that belongs to this run; the run waits for it.
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .spawn_on(task.instrument(self.span.clone()), &self.runtime);
    }

    pub(crate) fn failure_sink(&self, stage: &Arc<str>) -> FailureSink {
        let errors = match self.policy {
            ErrorPolicy::Report => Some(self.errors_tx.clone()),
            _ => None,
        };
        FailureSink {
            stage: Arc::clone(stage),
            policy: self.policy,
            errors,
            first_failure: Arc::clone(&self.first_failure),
            cancel: self.cancel.clone(),
        }
    }

    /// Hand every spawned task to a supervisor and return the caller's handle.
    pub(crate) fn into_run<O>(self, output: mpsc::Receiver<O>) -> PipelineRun<O> {
        let RunContext {
            run_id,
            cancel,
            counters,
            specs,
            errors_tx,
            errors_rx,
            first_failure,
            runtime,
            span,
            tasks,
            started,
            ..
        } = self;
        // Only worker clones keep the error channel open from here on.
        drop(errors_tx);
        let mut tasks = tasks.into_inner().unwrap_or_else(PoisonError::into_inner);

        let supervisor_cancel = cancel.clone();
        let supervisor = runtime.spawn(
            async move {
                let mut panicked = 0;
                // Tasks are reaped in completion order, so a panic is seen
                // while the feeder is still running.
                while let Some(joined) = tasks.join_next().await {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            panicked += 1;
                            error!("pipeline worker panicked");
                            // Survivors would otherwise wait on a stage that lost a worker.
                            supervisor_cancel.cancel();
                        }
                    }
                }

                let stages: Vec<StageReport> = specs
                    .into_iter()
                    .zip(counters.iter())
                    .map(|(spec, c)| StageReport {
                        name: spec.name,
                        concurrency: spec.concurrency,
                        processed: c.processed(),
                        failed: c.failed(),
                    })
                    .collect();
                let report = PipelineReport {
                    run_id,
                    stages,
                    cancelled: supervisor_cancel.is_cancelled(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                };
                info!(
                    emitted = report.emitted(),
                    failed = report.total_failed(),
                    cancelled = report.cancelled,
                    elapsed_ms = report.elapsed_ms,
                    "pipeline finished"
                );
                let failure = first_failure
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                RunOutcome {
                    report,
                    failure,
                    panicked,
                }
            }
            .instrument(span),
        );

        PipelineRun {
            output,
            errors: errors_rx,
            cancel,
            supervisor,
        }
    }
}

/// Handle to a running pipeline.
pub struct PipelineRun<O> {
    output: mpsc::Receiver<O>,
    errors: mpsc::UnboundedReceiver<StageError>,
    cancel: CancellationToken,
    supervisor: JoinHandle<RunOutcome>,
}

impl<O> PipelineRun<O> {
    /// Next output item; `None` once every worker has exited.
    pub async fn recv(&mut self) -> Option<O> {
        self.output.recv().await
    }

    /// Next reported failure under [`ErrorPolicy::Report`]; `None` once all
    /// workers have exited and every failure was taken.
    pub async fn next_error(&mut self) -> Option<StageError> {
        self.errors.recv().await
    }

    /// Failures reported so far, without waiting.
    pub fn drain_errors(&mut self) -> Vec<StageError> {
        let mut out = Vec::new();
        while let Ok(e) = self.errors.try_recv() {
            out.push(e);
        }
        out
    }

    /// Cancel this run only. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait for every worker to exit and return the report.
    ///
    /// Output not yet received is discarded; if items are still flowing, the
    /// run is cancelled once a last-stage worker finds the output gone.
    pub async fn wait(self) -> Result<PipelineReport> {
        let PipelineRun {
            output,
            errors,
            supervisor,
            ..
        } = self;
        drop(errors);
        drop(output);
        finish(supervisor).await
    }

    /// Receive every output item, then wait for the run to finish.
    ///
    /// Reported failures not yet taken are discarded.
    pub async fn collect(self) -> Result<(Vec<O>, PipelineReport)> {
        let PipelineRun {
            mut output,
            errors,
            supervisor,
            ..
        } = self;
        // Failures are only counted from here on.
        drop(errors);
        let mut items = Vec::new();
        while let Some(item) = output.recv().await {
            items.push(item);
        }
        let report = finish(supervisor).await?;
        Ok((items, report))
    }
}

async fn finish(supervisor: JoinHandle<RunOutcome>) -> Result<PipelineReport> {
    let outcome = supervisor.await.map_err(|e| {
        Error::runtime_with_context(
            "pipeline supervisor failed",
            ErrorContext::new()
                .with_details(e.to_string())
                .with_source("pipeline"),
        )
    })?;
    if let Some(failure) = outcome.failure {
        return Err(Error::Stage(failure));
    }
    if outcome.panicked > 0 {
        return Err(Error::runtime_with_context(
            "pipeline worker panicked",
            ErrorContext::new()
                .with_details(format!("{} worker(s)", outcome.panicked))
                .with_source("pipeline"),
        ));
    }
    Ok(outcome.report)
}
