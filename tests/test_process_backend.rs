use concurrent_pipeline::{
    Collector, Completion, ErrorPolicy, PipelineBuilder, PipelineConfig, SinkSpec, SourceSpec,
    StageSpec, WorkerCommand,
};
use std::time::Duration;

const CAPACITY: usize = 2;
const WORKERS: usize = 2;

fn worker_config(error_policy: ErrorPolicy) -> PipelineConfig {
    PipelineConfig {
        error_policy,
        worker: Some(WorkerCommand::new(env!("CARGO_BIN_EXE_stage-worker"))),
        ..PipelineConfig::default()
    }
}

#[test]
fn test_remote_doubling() {
    let out = Collector::<i64>::new();
    let summary = PipelineBuilder::with_config(
        worker_config(ErrorPolicy::Abort),
        SourceSpec::iter("numbers", 0..20i64),
    )
    .stage(StageSpec::remote("double", "double"), 4)
    .sink(SinkSpec::collect("out", out.clone()), 4)
    .build()
    .unwrap()
    .start()
    .unwrap()
    .wait_timeout(Duration::from_secs(60))
    .unwrap();

    assert_eq!(out.take(), (0..20).map(|n| n * 2).collect::<Vec<i64>>());
    let stage = summary.stage("double").unwrap();
    assert_eq!(stage.metrics.processed, 20);
    assert_eq!(stage.metrics.end_markers, 1);
}

#[test]
fn test_remote_fan_out() {
    let out = Collector::<u64>::new();
    let summary = PipelineBuilder::with_config(
        worker_config(ErrorPolicy::Abort),
        SourceSpec::iter("numbers", 0..60u64),
    )
    .stage(StageSpec::remote("sum", "sum_below").workers(3), 8)
    .then(StageSpec::map("shift", |n: u64| Ok(n + 1)))
    .sink(SinkSpec::collect("out", out.clone()), 8)
    .build()
    .unwrap()
    .start()
    .unwrap()
    .wait_timeout(Duration::from_secs(60))
    .unwrap();

    let mut items = out.take();
    items.sort_unstable();
    let mut expected: Vec<u64> = (0..60u64).map(|n| (0..n).sum::<u64>() + 1).collect();
    expected.sort_unstable();
    assert_eq!(items, expected);
    assert_eq!(summary.stage("sum").unwrap().metrics.end_markers, 3);
}

#[test]
fn test_remote_abort() {
    let out = Collector::<i64>::new();
    let completion = PipelineBuilder::with_config(
        worker_config(ErrorPolicy::Abort),
        SourceSpec::iter("numbers", 0..20i64),
    )
    .stage(StageSpec::remote("checked", "checked_double"), 2)
    .sink(SinkSpec::collect("out", out.clone()), 2)
    .build()
    .unwrap()
    .start()
    .unwrap()
    .await_completion(Some(Duration::from_secs(60)));

    match completion {
        Completion::StageFailure { error, .. } => {
            assert_eq!(error.stage_name, "checked");
            assert!(error.item_context.contains("item #7"));
            assert_eq!(error.cause, "refusing 7");
        }
        other => panic!("unexpected completion {other:?}"),
    }
    assert!(out.len() < 20);
}

#[test]
fn test_remote_skip() {
    let out = Collector::<i64>::new();
    let summary = PipelineBuilder::with_config(
        worker_config(ErrorPolicy::Skip),
        SourceSpec::iter("numbers", 0..20i64),
    )
    .stage(StageSpec::remote("checked", "checked_double"), 4)
    .sink(SinkSpec::collect("out", out.clone()), 4)
    .build()
    .unwrap()
    .start()
    .unwrap()
    .wait_timeout(Duration::from_secs(60))
    .unwrap();

    assert_eq!(out.len(), 19);
    assert_eq!(summary.stage("checked").unwrap().metrics.skipped, 1);
}

#[test]
fn test_unknown_transform_fails_stage() {
    let completion = PipelineBuilder::with_config(
        worker_config(ErrorPolicy::Abort),
        SourceSpec::iter("numbers", 0..5i64),
    )
    .stage(StageSpec::remote("mystery", "no_such_transform"), 2)
    .sink(SinkSpec::collect("out", Collector::<i64>::new()), 2)
    .build()
    .unwrap()
    .start()
    .unwrap()
    .await_completion(Some(Duration::from_secs(60)));

    match completion {
        Completion::StageFailure { error, .. } => {
            assert_eq!(error.stage_name, "mystery");
            assert!(error.cause.contains("unknown transform"));
        }
        other => panic!("unexpected completion {other:?}"),
    }
}

#[test]
fn test_remote_overflow_fails_with_item_context() {
    let completion = PipelineBuilder::with_config(
        worker_config(ErrorPolicy::Abort),
        SourceSpec::iter("numbers", [1i64, i64::MAX, 3]),
    )
    .stage(StageSpec::remote("double", "double"), 2)
    .sink(SinkSpec::collect("out", Collector::<i64>::new()), 2)
    .build()
    .unwrap()
    .start()
    .unwrap()
    .await_completion(Some(Duration::from_secs(60)));

    match completion {
        Completion::StageFailure { error, .. } => {
            assert_eq!(error.stage_name, "double");
            assert!(error.item_context.contains("item #1"));
            assert!(error.cause.contains("overflows"));
        }
        other => panic!("unexpected completion {other:?}"),
    }
}

#[test]
fn test_remote_cancel() {
    let mut running = PipelineBuilder::with_config(
        worker_config(ErrorPolicy::Abort),
        SourceSpec::iter("ticks", 0i64..),
    )
    .stage(StageSpec::remote("double", "double").workers(WORKERS), CAPACITY)
    .sink(
        SinkSpec::for_each("slow", |_: i64| {
            std::thread::sleep(Duration::from_millis(1));
            Ok(())
        }),
        CAPACITY,
    )
    .build()
    .unwrap()
    .start()
    .unwrap();

    std::thread::sleep(Duration::from_millis(300));
    running.cancel();

    let summary = match running.await_completion(Some(Duration::from_secs(10))) {
        Completion::Cancelled(summary) => summary,
        other => panic!("unexpected completion {other:?}"),
    };

    // In flight: the handoff buffer plus, per worker, one item waiting for
    // credit and a full credit window inside the pipes.
    let emitted = summary.stage("ticks").unwrap().metrics.processed;
    let remote = &summary.stage("double").unwrap().metrics;
    let answered = remote.processed + remote.skipped;
    let bound = (CAPACITY + WORKERS * (CAPACITY + 1)) as u64;
    assert!(emitted > 0);
    assert!(
        emitted - answered <= bound,
        "{emitted} emitted but only {answered} answered"
    );
}
