//! 流水线处理模块：多阶段并发处理，阶段间使用有界队列实现背压。
//!
//! # Stage Pipeline
//!
//! A pipeline threads items through an ordered list of stages. Each stage is
//! a fixed pool of workers that read from one bounded queue, apply the stage
//! transform, and write to the next queue.
//!
//! ## Overview
//!
//! ```text
//! input ──▶ [queue] ──▶ stage A (n workers) ──▶ [queue] ──▶ stage B (m workers) ──▶ output
//! ```
//!
//! - **Back-pressure**: queues are bounded, so a slow stage blocks upstream
//!   workers instead of buffering without limit.
//! - **Cancellation**: every worker watches the run's cancellation token and
//!   exits promptly; no item is emitted after a worker observed it.
//! - **Orderly close**: the output closes only once every worker of every
//!   stage has exited.
//! - **Typed stages**: a stage may change the item type.
//!
//! ## Error policy
//!
//! | Policy | Failed item |
//! |--------|-------------|
//! | [`ErrorPolicy::Drop`] | Discarded, logged and counted |
//! | [`ErrorPolicy::Report`] | Delivered on [`PipelineRun::next_error`] |
//! | [`ErrorPolicy::Abort`] | Cancels the run; [`PipelineRun::wait`] returns the error |
//!
//! ## Example
//!
//! ```rust
//! use flowguard::pipeline::{BoxError, PipelineBuilder};
//! use flowguard::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> flowguard::Result<()> {
//! let pipeline = PipelineBuilder::<i64>::new()
//!     .add_stage("double", 2, |x: i64| async move { Ok::<_, BoxError>(x * 2) })
//!     .add_stage("increment", 1, |x: i64| async move { Ok::<_, BoxError>(x + 1) })
//!     .build()?;
//!
//! let run = pipeline.run_iter(vec![1, 2, 3, 4], &CancellationToken::new())?;
//! let (mut out, report) = run.collect().await?;
//! out.sort();
//! assert_eq!(out, vec![3, 5, 7, 9]);
//! assert_eq!(report.stages[0].processed, 4);
//! # Ok(())
//! # }
//! ```

mod run;
mod stage;


pub use run::{PipelineReport, PipelineRun, StageReport};

use crate::{Error, ErrorContext, Result};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use run::RunContext;

/// Boxed error returned by stage transforms.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Core transformer interface: one input item in, one output item or an error out.
#[async_trait::async_trait]
pub trait Transform<In, Out>: Send + Sync {
    async fn apply(&self, input: In) -> std::result::Result<Out, BoxError>;
}

/// Adapter turning an async closure into a [`Transform`].
struct FnTransform<F, E> {
    f: F,
    _error: PhantomData<fn() -> E>,
}

#[async_trait::async_trait]
impl<F, Fut, In, Out, E> Transform<In, Out> for FnTransform<F, E>
where
    F: Fn(In) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Out, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
    In: Send + 'static,
    Out: Send + 'static,
{
    async fn apply(&self, input: In) -> std::result::Result<Out, BoxError> {
        (self.f)(input).await.map_err(Into::into)
    }
}

/// A transform failure for one item.
#[derive(Debug)]
pub struct StageError {
    pub stage: String,
    pub source: BoxError,
}

impl StageError {
    pub fn new(stage: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            stage: stage.into(),
            source: source.into(),
        }
    }
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stage '{}' failed: {}", self.stage, self.source)
    }
}

impl std::error::Error for StageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// What happens to an item whose transform failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Discard the item; logged at `warn` and counted.
    #[default]
    Drop,
    /// Deliver the failure on the run's error channel and keep going.
    ///
    /// The channel is unbounded: failures queue on the [`PipelineRun`] until
    /// taken with [`PipelineRun::next_error`] or [`PipelineRun::drain_errors`].
    /// `wait` and `collect` discard whatever was not taken.
    Report,
    /// Cancel the whole run on the first failure.
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of every inter-stage queue.
    pub queue_capacity: usize,
    pub error_policy: ErrorPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            error_policy: ErrorPolicy::Drop,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub name: String,
    pub concurrency: usize,
}

/// Spawns the workers for every stage so far and returns the last queue.
type Wire<I, O> = Arc<dyn Fn(mpsc::Receiver<I>, &RunContext) -> mpsc::Receiver<O> + Send + Sync>;

/// Pipeline builder; each added stage moves the output type forward.
pub struct PipelineBuilder<I, O = I> {
    config: PipelineConfig,
    stages: Vec<StageSpec>,
    wire: Wire<I, O>,
}

impl<I: Send + 'static> PipelineBuilder<I, I> {
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            stages: Vec::new(),
            wire: Arc::new(|input, _ctx| input),
        }
    }
}

impl<I: Send + 'static> Default for PipelineBuilder<I, I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I, O> PipelineBuilder<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.config.error_policy = policy;
        self
    }

    /// Append a stage backed by an async closure.
    pub fn add_stage<N, F, Fut, E>(
        self,
        name: impl Into<String>,
        concurrency: usize,
        transform: F,
    ) -> PipelineBuilder<I, N>
    where
        N: Send + 'static,
        F: Fn(O) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<N, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.add_transform(
            name,
            concurrency,
            FnTransform {
                f: transform,
                _error: PhantomData,
            },
        )
    }

    /// Append a stage backed by a [`Transform`] implementation.
    pub fn add_transform<N, T>(
        self,
        name: impl Into<String>,
        concurrency: usize,
        transform: T,
    ) -> PipelineBuilder<I, N>
    where
        N: Send + 'static,
        T: Transform<O, N> + 'static,
    {
        let spec = StageSpec {
            name: name.into(),
            concurrency,
        };
        let index = self.stages.len();
        let stage_name: Arc<str> = Arc::from(spec.name.as_str());
        let transform: Arc<dyn Transform<O, N>> = Arc::new(transform);
        let upstream = self.wire;

        let wire: Wire<I, N> = Arc::new(move |input, ctx| {
            let queue = upstream(input, ctx);
            stage::spawn_stage(
                index,
                Arc::clone(&stage_name),
                concurrency,
                Arc::clone(&transform),
                queue,
                ctx,
            )
        });

        let mut stages = self.stages;
        stages.push(spec);
        PipelineBuilder {
            config: self.config,
            stages,
            wire,
        }
    }

    pub fn build(self) -> Result<Pipeline<I, O>> {
        if self.stages.is_empty() {
            return Err(Error::configuration_with_context(
                "pipeline needs at least one stage",
                ErrorContext::new()
                    .with_field_path("pipeline.stages")
                    .with_source("pipeline_builder"),
            ));
        }
        if self.config.queue_capacity == 0 {
            return Err(Error::configuration_with_context(
                "queue capacity must be positive",
                ErrorContext::new()
                    .with_field_path("pipeline.queue_capacity")
                    .with_source("pipeline_builder"),
            ));
        }
        if let Some((i, spec)) = self
            .stages
            .iter()
            .enumerate()
            .find(|(_, s)| s.concurrency == 0)
        {
            return Err(Error::configuration_with_context(
                format!("stage '{}' needs at least one worker", spec.name),
                ErrorContext::new()
                    .with_field_path(format!("pipeline.stages[{}].concurrency", i))
                    .with_source("pipeline_builder"),
            ));
        }
        Ok(Pipeline {
            config: self.config,
            stages: Arc::from(self.stages),
            wire: self.wire,
        })
    }
}

/// A validated pipeline. Cheap to clone; every call to `run*` starts an
/// independent run.
pub struct Pipeline<I, O> {
    config: PipelineConfig,
    stages: Arc<[StageSpec]>,
    wire: Wire<I, O>,
}

impl<I, O> Clone for Pipeline<I, O> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            stages: Arc::clone(&self.stages),
            wire: Arc::clone(&self.wire),
        }
    }
}

impl<I, O> std::fmt::Debug for Pipeline<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("stages", &self.stages)
            .finish_non_exhaustive()
    }
}

impl<I, O> Pipeline<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    /// Run over a caller-owned input queue. Workers of the first stage exit
    /// when the caller closes `input` (drops every sender) and it is drained,
    /// or when `cancel` fires.
    pub fn run(&self, input: mpsc::Receiver<I>, cancel: &CancellationToken) -> Result<PipelineRun<O>> {
        self.launch(cancel, |_ctx| input)
    }

    /// Run over any stream; the stream is consumed by a feeder task owned by
    /// the run.
    pub fn run_stream<S>(&self, input: S, cancel: &CancellationToken) -> Result<PipelineRun<O>>
    where
        S: Stream<Item = I> + Send + 'static,
    {
        self.launch(cancel, move |ctx| {
            let (tx, rx) = mpsc::channel(ctx.queue_capacity);
            ctx.spawn(stage::feed(input, tx, ctx.cancel.clone()));
            rx
        })
    }

    pub fn run_iter<It>(&self, items: It, cancel: &CancellationToken) -> Result<PipelineRun<O>>
    where
        It: IntoIterator<Item = I>,
        It::IntoIter: Send + 'static,
    {
        self.run_stream(futures::stream::iter(items), cancel)
    }

    fn launch(
        &self,
        cancel: &CancellationToken,
        input: impl FnOnce(&RunContext) -> mpsc::Receiver<I>,
    ) -> Result<PipelineRun<O>> {
        let ctx = RunContext::new(&self.config, &self.stages, cancel.child_token())?;
        let input = input(&ctx);
        let output = (self.wire)(input, &ctx);
        Ok(ctx.into_run(output))
    }
}
