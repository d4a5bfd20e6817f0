//! Batch façade: one entry point wiring the graph, scheduler, collector,
//! aggregator and sinks together.
//!
//! ```no_run
//! use jobfarm::{Batch, BatchConfig, JobSpec};
//!
//! # async fn demo() -> jobfarm::Result<()> {
//! let specs = vec![
//!     JobSpec::builder("prepare", "/usr/bin/make").arg("data").build()?,
//!     JobSpec::builder("measure", "./bench")
//!         .depends_on("prepare")
//!         .build()?,
//! ];
//! let report = Batch::new(specs, BatchConfig::default())?.run().await;
//! assert!(report.success());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::aggregate::{AggregateState, Aggregator};
use crate::cancel::CancelSignal;
use crate::collect::{CollectedResult, Collector};
use crate::config::BatchConfig;
use crate::error::Result;
use crate::graph::JobGraph;
use crate::result::JobResult;
use crate::runner::{OsProcessRunner, ProcessRunner};
use crate::scheduler::Scheduler;
use crate::sink::ResultSink;
use crate::spec::{JobId, JobSpec};
use crate::state::JobState;

/// A validated batch, ready to start.
///
/// Construction builds and checks the dependency graph; a batch that exists
/// is guaranteed to be runnable. Collaborators default to an OS process
/// runner, a raw-stdout collector, an ungrouped aggregator and no sinks.
pub struct Batch {
    graph: Arc<JobGraph>,
    config: BatchConfig,
    runner: Arc<dyn ProcessRunner>,
    collector: Collector,
    aggregator: Aggregator,
    sinks: Vec<Arc<dyn ResultSink>>,
    cancel: CancelSignal,
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("graph", &self.graph)
            .field("config", &self.config)
            .field("sinks", &self.sinks.len())
            .finish_non_exhaustive()
    }
}

impl Batch {
    /// Validate `specs` and `config` and build the dependency graph.
    pub fn new(specs: Vec<JobSpec>, config: BatchConfig) -> Result<Self> {
        config.validate()?;
        let graph = Arc::new(JobGraph::build(specs)?);
        let runner = Arc::new(OsProcessRunner::new(config.max_capture_bytes));
        Ok(Self {
            graph,
            config,
            runner,
            collector: Collector::default(),
            aggregator: Aggregator::new(),
            sinks: Vec::new(),
            cancel: CancelSignal::new(),
        })
    }

    /// Replace the process runner.
    pub fn with_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Replace the output collector.
    pub fn with_collector(mut self, collector: Collector) -> Self {
        self.collector = collector;
        self
    }

    /// Replace the aggregator.
    pub fn with_aggregator(mut self, aggregator: Aggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// Add a result sink. Sinks receive results in completion order.
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// The validated dependency graph.
    pub fn graph(&self) -> &JobGraph {
        &self.graph
    }

    /// Signal handle for cancelling the batch, usable before and after start.
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Start the batch in the background and return a handle to it.
    pub fn start(self) -> BatchHandle {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let (results_tx, results_rx) = mpsc::channel(self.config.channel_capacity);
        let (out_tx, out_rx) = mpsc::channel(self.config.channel_capacity);
        let (report_tx, report_rx) = oneshot::channel();

        let scheduler = Scheduler::new(
            Arc::clone(&self.graph),
            Arc::clone(&self.runner),
            self.config.clone(),
            self.cancel.clone(),
        );
        let aggregator = Arc::new(self.aggregator);

        let driver = BatchDriver {
            run_id,
            started_at,
            total: self.graph.len(),
            collector: self.collector,
            aggregator: Arc::clone(&aggregator),
            sinks: self.sinks,
            cancel: self.cancel.clone(),
        };
        tokio::spawn(async move {
            let scheduler_task = tokio::spawn(scheduler.run(results_tx));
            let report = driver.drive(results_rx, out_tx).await;
            if let Err(e) = scheduler_task.await {
                error!(error = %e, "scheduler task failed");
            }
            let _ = report_tx.send(report);
        });

        BatchHandle {
            run_id,
            started_at,
            cancel: self.cancel,
            aggregator,
            results: ReceiverStream::new(out_rx),
            report: report_rx,
        }
    }

    /// Run the batch to completion and return its report.
    pub async fn run(self) -> BatchReport {
        self.start().finish().await
    }
}

/// Consumes scheduler results: collect, aggregate, sink, forward.
struct BatchDriver {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    total: usize,
    collector: Collector,
    aggregator: Arc<Aggregator>,
    sinks: Vec<Arc<dyn ResultSink>>,
    cancel: CancelSignal,
}

impl BatchDriver {
    async fn drive(
        self,
        mut results_rx: mpsc::Receiver<JobResult>,
        out_tx: mpsc::Sender<CollectedResult>,
    ) -> BatchReport {
        info!(run = %self.run_id, jobs = self.total, "batch run started");

        let mut succeeded = 0usize;
        let mut failed = Vec::new();
        let mut skipped = Vec::new();
        let mut sink_errors = 0usize;

        while let Some(result) = results_rx.recv().await {
            let collected = self.collector.collect(result);
            self.aggregator.merge(&collected);

            match collected.result.state {
                JobState::Succeeded => succeeded += 1,
                JobState::Failed => failed.push(collected.result.id.clone()),
                JobState::Skipped => skipped.push(collected.result.id.clone()),
                _ => {}
            }

            for sink in &self.sinks {
                if let Err(error) = sink.write(&collected).await {
                    warn!(job = %collected.result.id, %error, "sink write failed");
                    sink_errors += 1;
                }
            }

            // A dropped stream consumer is fine; sinks and the aggregator
            // already have this result.
            let _ = out_tx.send(collected).await;
        }

        for sink in &self.sinks {
            if let Err(error) = sink.finish().await {
                warn!(%error, "sink finish failed");
                sink_errors += 1;
            }
        }

        let report = BatchReport {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            total: self.total,
            succeeded,
            failed,
            skipped,
            cancelled: self.cancel.is_cancelled(),
            sink_errors,
            aggregate: self.aggregator.snapshot(),
        };
        info!(
            run = %report.run_id,
            succeeded = report.succeeded,
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            cancelled = report.cancelled,
            "batch run finished"
        );
        report
    }
}

/// Handle onto a running batch.
pub struct BatchHandle {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    cancel: CancelSignal,
    aggregator: Arc<Aggregator>,
    results: ReceiverStream<CollectedResult>,
    report: oneshot::Receiver<BatchReport>,
}

impl BatchHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Request cancellation. Unstarted jobs are skipped, running processes
    /// killed. Safe to call more than once.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Clonable cancel signal, e.g. to wire up a ctrl-c handler.
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Live stream of collected results, in completion order. Consuming it
    /// is optional; unconsumed results are dropped at `finish`.
    pub fn results(&mut self) -> &mut ReceiverStream<CollectedResult> {
        &mut self.results
    }

    /// Aggregate over everything collected so far.
    pub fn aggregate(&self) -> AggregateState {
        self.aggregator.snapshot()
    }

    /// Wait for the batch to finish and return its report.
    pub async fn finish(mut self) -> BatchReport {
        while self.results.next().await.is_some() {}
        match self.report.await {
            Ok(report) => report,
            // Only reachable if the driver task panicked.
            Err(_) => {
                error!(run = %self.run_id, "batch driver ended without a report");
                BatchReport {
                    run_id: self.run_id,
                    started_at: self.started_at,
                    finished_at: Utc::now(),
                    total: 0,
                    succeeded: 0,
                    failed: Vec::new(),
                    skipped: Vec::new(),
                    cancelled: self.cancel.is_cancelled(),
                    sink_errors: 0,
                    aggregate: self.aggregator.snapshot(),
                }
            }
        }
    }
}

/// Final account of one batch run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Jobs in the batch.
    pub total: usize,
    pub succeeded: usize,
    /// Jobs that exhausted their attempts, in completion order.
    pub failed: Vec<JobId>,
    /// Jobs that never ran, in completion order.
    pub skipped: Vec<JobId>,
    pub cancelled: bool,
    /// Sink write and flush failures observed during the run.
    pub sink_errors: usize,
    pub aggregate: AggregateState,
}

impl BatchReport {
    /// A batch succeeds exactly when no job ended `Failed`. Skipped jobs do
    /// not fail the batch; check [`BatchReport::cancelled`] and
    /// [`BatchReport::skipped`] to tell a clean run from a curtailed one.
    pub fn success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn wall_time(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}
