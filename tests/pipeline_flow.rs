use flowguard::pipeline::{BoxError, PipelineBuilder};
use flowguard::{CancellationToken, Gate, PermitPool, ToolkitConfig};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_double_then_increment() {
    let pipeline = PipelineBuilder::<i64>::new()
        .add_stage("double", 2, |x: i64| async move { Ok::<_, BoxError>(x * 2) })
        .add_stage("increment", 1, |x: i64| async move { Ok::<_, BoxError>(x + 1) })
        .build()
        .unwrap();

    let (out, report) = pipeline
        .run_iter(vec![1, 2, 3, 4], &CancellationToken::new())
        .unwrap()
        .collect()
        .await
        .unwrap();

    assert_eq!(out.len(), 4);
    let set: HashSet<i64> = out.into_iter().collect();
    assert_eq!(set, HashSet::from([3, 5, 7, 9]));
    assert_eq!(report.emitted(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_stops_all_workers_promptly() {
    let cancelled = Arc::new(AtomicBool::new(false));
    let late = Arc::new(AtomicUsize::new(0));

    let flag = Arc::clone(&cancelled);
    let late_items = Arc::clone(&late);
    let pipeline = PipelineBuilder::<u64>::new()
        .queue_capacity(4)
        .add_stage("tick", 3, |x: u64| async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            Ok::<_, BoxError>(x)
        })
        .add_stage("observe", 3, move |x: u64| {
            let flag = Arc::clone(&flag);
            let late_items = Arc::clone(&late_items);
            async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                if flag.load(Ordering::SeqCst) {
                    late_items.fetch_add(1, Ordering::SeqCst);
                }
                Ok::<_, BoxError>(x)
            }
        })
        .build()
        .unwrap();

    let token = CancellationToken::new();
    let mut run = pipeline
        .run_stream(tokio_stream::iter(0u64..), &token)
        .unwrap();
    for _ in 0..10 {
        assert!(run.recv().await.is_some());
    }

    cancelled.store(true, Ordering::SeqCst);
    token.cancel();

    let report = tokio::time::timeout(Duration::from_secs(2), async {
        while run.recv().await.is_some() {}
        run.wait().await
    })
    .await
    .expect("workers did not exit in time")
    .unwrap();

    assert!(report.cancelled);
    // Workers mid-transform when the flag flipped may finish that item, but
    // none of them may emit it.
    assert!(late.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn test_channel_input_and_stream_output() {
    let pipeline = PipelineBuilder::<String>::new()
        .add_stage("upper", 2, |s: String| async move { Ok::<_, BoxError>(s.to_uppercase()) })
        .build()
        .unwrap();

    let (tx, rx) = mpsc::channel(8);
    let mut run = pipeline.run(rx, &CancellationToken::new()).unwrap();
    for word in ["alpha", "beta", "gamma"] {
        tx.send(word.to_string()).await.unwrap();
    }
    drop(tx);

    let mut out = Vec::new();
    while let Some(word) = run.recv().await {
        out.push(word);
    }
    out.sort();
    assert_eq!(out, vec!["ALPHA", "BETA", "GAMMA"]);
}

#[tokio::test]
async fn test_receiver_stream_feeds_pipeline() {
    let pipeline = PipelineBuilder::<u32>::new()
        .add_stage("square", 2, |x: u32| async move { Ok::<_, BoxError>(x * x) })
        .build()
        .unwrap();

    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        for i in 1..=5u32 {
            let _ = tx.send(i).await;
        }
    });
    let input = ReceiverStream::new(rx).filter(|x| x % 2 == 1);

    let (mut out, _) = pipeline
        .run_stream(input, &CancellationToken::new())
        .unwrap()
        .collect()
        .await
        .unwrap();
    out.sort();
    assert_eq!(out, vec![1, 9, 25]);
}

#[tokio::test]
async fn test_gated_stage_from_yaml_config() {
    let config = ToolkitConfig::from_yaml_str(
        r#"
permit_pool:
  capacity: 2
circuit_breaker:
  failure_threshold: 100
pipeline:
  queue_capacity: 4
  error_policy: report
"#,
    )
    .unwrap();
    let gate = Gate::from_config(&config).unwrap();
    let pool: PermitPool = gate.permit_pool().cloned().unwrap();

    let peak = Arc::new(AtomicUsize::new(0));
    let stage_gate = gate.clone();
    let stage_peak = Arc::clone(&peak);
    let pipeline = PipelineBuilder::<u32>::new()
        .with_config(config.pipeline.clone().unwrap())
        .add_stage("guarded", 6, move |x: u32| {
            let gate = stage_gate.clone();
            let peak = Arc::clone(&stage_peak);
            let pool = pool.clone();
            async move {
                gate.run(
                    || async {
                        peak.fetch_max(pool.outstanding(), Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        if x == 13 {
                            Err(format!("unlucky {}", x))
                        } else {
                            Ok(x)
                        }
                    },
                    &CancellationToken::new(),
                )
                .await
                .map_err(|e| BoxError::from(e.to_string()))
            }
        })
        .build()
        .unwrap();

    let mut run = pipeline
        .run_iter(0..20u32, &CancellationToken::new())
        .unwrap();
    let mut out = Vec::new();
    while let Some(x) = run.recv().await {
        out.push(x);
    }
    let errors = run.drain_errors();
    let report = run.wait().await.unwrap();

    assert_eq!(out.len(), 19);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].to_string().contains("unlucky 13"));
    assert_eq!(report.stages[0].failed, 1);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(gate.signals().is_ready());
}
