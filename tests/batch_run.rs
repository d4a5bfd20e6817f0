//! Integration tests driving real processes through the public API.
//!
//! Each test hands a spec set to `Batch` and exercises the full path:
//! graph validation, scheduling, `/bin/sh` execution, output collection,
//! aggregation and sinks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde_json::json;
use tempfile::TempDir;
use tokio::time::timeout;
use tokio_stream::StreamExt;

use jobfarm::aggregate::Aggregator;
use jobfarm::collect::{CollectedResult, Collector, JsonOutput, KeyValueOutput};
use jobfarm::params;
use jobfarm::sink::{CsvSink, JsonLinesSink, MemorySink, ResultSink};
use jobfarm::spec::RetryPolicy;
use jobfarm::{Batch, BatchConfig, FailureReason, JobId, JobSpec};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Run a test body under the global timeout, with tracing wired to RUST_LOG
/// so hung scenarios can be diagnosed.
async fn with_timeout<F: std::future::Future>(body: F) -> F::Output {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
    timeout(TEST_TIMEOUT, body).await.expect("test timed out")
}

/// Helper: a shell job with no dependencies.
fn sh(id: &str, script: &str) -> JobSpec {
    JobSpec::builder(id, "/bin/sh")
        .arg("-c")
        .arg(script)
        .build()
        .unwrap()
}

/// Helper: a shell job depending on `deps`.
fn sh_after(id: &str, script: &str, deps: &[&str]) -> JobSpec {
    let mut builder = JobSpec::builder(id, "/bin/sh").arg("-c").arg(script);
    for dep in deps {
        builder = builder.depends_on(*dep);
    }
    builder.build().unwrap()
}

fn find<'a>(results: &'a [CollectedResult], id: &str) -> &'a CollectedResult {
    results
        .iter()
        .find(|c| c.result.id.as_str() == id)
        .unwrap_or_else(|| panic!("no result for {id}"))
}

// ── Scheduling ──────────────────────────────────────────────────────

#[tokio::test]
async fn three_job_graph_reports_three_successes() {
    with_timeout(async {
        let specs = vec![
            sh("a", "true"),
            sh("b", "true"),
            sh_after("c", "true", &["a", "b"]),
        ];
        let report = Batch::new(specs, BatchConfig::default())
            .unwrap()
            .run()
            .await;

        assert!(report.success());
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.aggregate.overall.succeeded, 3);
        assert_eq!(report.aggregate.overall.failed, 0);
        assert_eq!(report.aggregate.overall.skipped, 0);
    })
    .await;
}

#[tokio::test]
async fn failed_dependency_skips_dependent_after_retries() {
    with_timeout(async {
        let mut flaky = sh("a", "exit 1");
        flaky.retry = Some(RetryPolicy::attempts(2));
        let specs = vec![flaky, sh_after("b", "true", &["a"])];

        let sink = Arc::new(MemorySink::new());
        let report = Batch::new(specs, BatchConfig::default())
            .unwrap()
            .with_sink(Arc::clone(&sink) as Arc<dyn ResultSink>)
            .run()
            .await;

        assert!(!report.success());
        assert_eq!(report.failed, vec![JobId::from("a")]);
        assert_eq!(report.skipped, vec![JobId::from("b")]);

        let results = sink.results();
        let a = find(&results, "a");
        assert_eq!(a.result.attempts, 2);
        assert!(matches!(
            a.result.reason,
            Some(FailureReason::ExitCode { code: 1 })
        ));
        let b = find(&results, "b");
        assert_eq!(b.result.attempts, 0);
        assert!(matches!(
            b.result.reason,
            Some(FailureReason::DependencyFailed { ref dependency }) if dependency.as_str() == "a"
        ));
    })
    .await;
}

#[tokio::test]
async fn timeout_kills_the_process_and_fails_the_job() {
    with_timeout(async {
        let spec = JobSpec::builder("slow", "/bin/sh")
            .arg("-c")
            .arg("sleep 5")
            .timeout(Duration::from_millis(100))
            .build()
            .unwrap();

        let started = Instant::now();
        let report = Batch::new(vec![spec], BatchConfig::default())
            .unwrap()
            .run()
            .await;

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(report.failed, vec![JobId::from("slow")]);
    })
    .await;
}

#[tokio::test]
async fn nonzero_success_codes_are_honoured() {
    with_timeout(async {
        let spec = JobSpec::builder("wrapper", "/bin/sh")
            .arg("-c")
            .arg("exit 42")
            .success_codes([0, 42])
            .build()
            .unwrap();

        let report = Batch::new(vec![spec], BatchConfig::default())
            .unwrap()
            .run()
            .await;
        assert!(report.success());
        assert_eq!(report.succeeded, 1);
    })
    .await;
}

#[tokio::test]
async fn results_stream_during_the_run() {
    with_timeout(async {
        let specs = vec![sh("a", "true"), sh("b", "sleep 1")];
        let mut handle = Batch::new(specs, BatchConfig::default()).unwrap().start();

        // The fast job's result arrives while the slow one still runs.
        let first = handle.results().next().await.unwrap();
        assert_eq!(first.result.id.as_str(), "a");

        let report = handle.finish().await;
        assert_eq!(report.succeeded, 2);
    })
    .await;
}

#[tokio::test]
async fn cancellation_curtails_the_batch() {
    with_timeout(async {
        let specs = (0..4)
            .map(|i| sh(&format!("j{i}"), "sleep 3"))
            .collect::<Vec<_>>();
        let config = BatchConfig {
            max_workers: 2,
            ..Default::default()
        };

        let started = Instant::now();
        let handle = Batch::new(specs, config).unwrap().start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
        let report = handle.finish().await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(report.cancelled);
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.skipped.len(), 4);
    })
    .await;
}

#[tokio::test]
async fn empty_batch_reports_cleanly() {
    with_timeout(async {
        let report = Batch::new(Vec::new(), BatchConfig::default())
            .unwrap()
            .run()
            .await;
        assert!(report.success());
        assert_eq!(report.total, 0);
        assert_eq!(report.aggregate.total, 0);
    })
    .await;
}

// ── Parameters ──────────────────────────────────────────────────────

#[tokio::test]
async fn parameter_matrix_runs_every_instance() {
    with_timeout(async {
        let mut axes = IndexMap::new();
        axes.insert("algo".to_string(), vec![json!("lru"), json!("fifo")]);
        axes.insert("n".to_string(), vec![json!(1), json!(2)]);

        let specs = JobSpec::builder("bench-{algo}-{n}", "/bin/sh")
            .arg("-c")
            .arg("printf 'n_used=%s\\n' {n}")
            .instantiate(params::matrix(&axes))
            .unwrap();
        assert_eq!(specs.len(), 4);

        let report = Batch::new(specs, BatchConfig::default())
            .unwrap()
            .with_collector(Collector::new(KeyValueOutput))
            .with_aggregator(Aggregator::grouped_by(["algo"]))
            .run()
            .await;

        assert!(report.success());
        assert_eq!(report.succeeded, 4);
        assert_eq!(report.aggregate.groups.len(), 2);
        let lru = &report.aggregate.groups["algo=lru"];
        assert_eq!(lru.succeeded, 2);
        // n_used sums the rendered {n} values 1 and 2.
        assert_eq!(lru.fields["n_used"].sum, 3.0);
    })
    .await;
}

#[tokio::test]
async fn environment_and_stdin_reach_the_child() {
    with_timeout(async {
        let spec = JobSpec::builder("greet", "/bin/sh")
            .arg("-c")
            .arg(r#"printf '%s %s' "$GREETING" "$(cat)""#)
            .env_set("GREETING", "hello")
            .stdin_inline("world")
            .build()
            .unwrap();

        let sink = Arc::new(MemorySink::new());
        let report = Batch::new(vec![spec], BatchConfig::default())
            .unwrap()
            .with_sink(Arc::clone(&sink) as Arc<dyn ResultSink>)
            .run()
            .await;

        assert!(report.success());
        let results = sink.results();
        assert_eq!(find(&results, "greet").result.stdout.text, "hello world");
    })
    .await;
}

// ── Collection and sinks ────────────────────────────────────────────

#[tokio::test]
async fn json_output_flows_into_the_aggregate() {
    with_timeout(async {
        let specs = vec![
            sh("fast", r#"echo '{{"elapsed": 1.5}}'"#),
            sh("slow", r#"echo '{{"elapsed": 2.5}}'"#),
        ];
        let report = Batch::new(specs, BatchConfig::default())
            .unwrap()
            .with_collector(Collector::new(JsonOutput))
            .run()
            .await;

        assert!(report.success());
        let elapsed = &report.aggregate.overall.fields["elapsed"];
        assert_eq!(elapsed.count, 2);
        assert_eq!(elapsed.sum, 4.0);
        assert_eq!(elapsed.min, 1.5);
        assert_eq!(elapsed.max, 2.5);
    })
    .await;
}

#[tokio::test]
async fn malformed_output_fails_the_job_not_the_batch() {
    with_timeout(async {
        let specs = vec![sh("good", r#"echo '{{"v": 1}}'"#), sh("bad", "echo nope")];
        let report = Batch::new(specs, BatchConfig::default())
            .unwrap()
            .with_collector(Collector::new(JsonOutput))
            .run()
            .await;

        assert!(!report.success());
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, vec![JobId::from("bad")]);
    })
    .await;
}

#[tokio::test]
async fn file_sinks_record_the_run() {
    with_timeout(async {
        let dir = TempDir::new().unwrap();
        let jsonl_path = dir.path().join("results.jsonl");
        let csv_path = dir.path().join("results.csv");

        let jsonl = Arc::new(JsonLinesSink::create(&jsonl_path).await.unwrap());
        let csv = Arc::new(
            CsvSink::create(&csv_path, ["n"], ["n_used"]).await.unwrap(),
        );

        let specs = JobSpec::builder("run-{n}", "/bin/sh")
            .arg("-c")
            .arg("printf 'n_used=%s\\n' {n}")
            .instantiate([
                params::ParamSet::from_iter([("n".to_string(), json!(1))]),
                params::ParamSet::from_iter([("n".to_string(), json!(2))]),
            ])
            .unwrap();

        let report = Batch::new(specs, BatchConfig::default())
            .unwrap()
            .with_collector(Collector::new(KeyValueOutput))
            .with_sink(jsonl as Arc<dyn ResultSink>)
            .with_sink(csv as Arc<dyn ResultSink>)
            .run()
            .await;
        assert!(report.success());
        assert_eq!(report.sink_errors, 0);

        let jsonl_text = std::fs::read_to_string(&jsonl_path).unwrap();
        assert_eq!(jsonl_text.lines().count(), 2);
        let first: CollectedResult = serde_json::from_str(jsonl_text.lines().next().unwrap()).unwrap();
        assert!(first.result.is_success());

        let csv_text = std::fs::read_to_string(&csv_path).unwrap();
        let lines: Vec<_> = csv_text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "job,state,exit_code,attempts,duration_ms,reason,n,n_used");
        assert!(lines.iter().any(|l| l.starts_with("run-1,succeeded,0,1,")));
    })
    .await;
}
