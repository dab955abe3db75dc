//! flowguard-demo: 演示许可池、按键锁、限流、熔断与流水线的组合使用
//!
//! Usage:
//!   flowguard-demo [config.yaml|config.json]
//!
//! Pushes a batch of jobs through a two-stage pipeline whose second stage
//! calls a flaky "downstream" behind a [`Gate`], then prints the run report
//! and the gate signals as JSON. Set `RUST_LOG=debug` for per-item logs.

use anyhow::Context;
use flowguard::pipeline::BoxError;
use flowguard::{
    CancellationToken, ErrorPolicy, Gate, KeyedLock, PipelineBuilder, ToolkitConfig,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const DEFAULT_CONFIG: &str = r#"
permit_pool:
  capacity: 4
rate_limiter:
  rps: 200.0
  burst: 20
  initial_tokens: 20
circuit_breaker:
  failure_threshold: 5
  cooldown_ms: 50
  half_open_max_probes: 1
pipeline:
  queue_capacity: 16
  error_policy: drop
"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .with_target(false)
        .try_init();

    let config = match std::env::args().nth(1) {
        Some(path) if path == "--help" || path == "-h" => {
            println!("usage: flowguard-demo [config.yaml|config.json]");
            return Ok(());
        }
        Some(path) => ToolkitConfig::from_file(&path)
            .with_context(|| format!("failed to load config from {}", path))?,
        None => ToolkitConfig::from_yaml_str(DEFAULT_CONFIG)?,
    };

    let gate = Gate::from_config(&config)?;
    let accounts: KeyedLock<u64> = KeyedLock::new();
    let calls = Arc::new(AtomicU64::new(0));

    let downstream_gate = gate.clone();
    let downstream_calls = Arc::clone(&calls);
    let pipeline = PipelineBuilder::<u64>::new()
        .with_config(config.pipeline.clone().unwrap_or_default())
        .add_stage("serialize_per_account", 4, move |job: u64| {
            let accounts = accounts.clone();
            async move {
                // Jobs for the same account never overlap.
                let _held = accounts.lock(job % 3).await;
                tokio::time::sleep(Duration::from_millis(2)).await;
                Ok::<_, BoxError>(job)
            }
        })
        .add_stage("call_downstream", 4, move |job: u64| {
            let gate = downstream_gate.clone();
            let calls = Arc::clone(&downstream_calls);
            async move {
                let token = CancellationToken::new();
                gate.run(
                    || async {
                        let n = calls.fetch_add(1, Ordering::Relaxed);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        if n % 7 == 3 {
                            Err(format!("downstream rejected job {}", job))
                        } else {
                            Ok(job * 10)
                        }
                    },
                    &token,
                )
                .await
                .map_err(|e| BoxError::from(e.to_string()))
            }
        })
        .build()?;

    if pipeline.config().error_policy != ErrorPolicy::Drop {
        info!(policy = ?pipeline.config().error_policy, "non-default error policy");
    }

    let run = pipeline.run_iter(0..100u64, &CancellationToken::new())?;
    let (out, report) = run.collect().await?;
    info!(emitted = out.len(), "demo finished");

    println!("{}", serde_json::to_string_pretty(&report)?);
    println!("{}", serde_json::to_string_pretty(&gate.signals())?);

    if let Some(limiter) = gate.rate_limiter() {
        limiter.shutdown().await;
    }
    Ok(())
}
