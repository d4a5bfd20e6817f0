//! Dependency-aware batch scheduling.
//!
//! One scheduler task owns the entire mutable state table and is its only
//! writer. Attempts run as spawned tasks, at most `max_workers` at a time,
//! and report back over an event channel. Flow:
//!   ready queue -> claim (Ready -> Running) -> spawn attempt
//!   -> AttemptDone -> succeed / retry / fail
//!   -> terminal results unlock dependents or skip them transitively.
//!
//! Dispatch order is deterministic: the ready queue is seeded and refilled
//! in spec-set insertion order. Completion order among concurrent jobs is
//! not.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cancel::CancelSignal;
use crate::config::BatchConfig;
use crate::graph::JobGraph;
use crate::result::{FailureReason, JobResult};
use crate::runner::{ProcessEnd, ProcessOutcome, ProcessRunner};
use crate::spec::ResolvedCommand;
use crate::state::JobState;

/// What an attempt task reports back.
enum AttemptOutcome {
    /// The runner produced an outcome (which may still be a failure).
    Finished(ProcessOutcome),
    /// The command could not be run at all.
    NotRun(String),
}

enum SchedulerEvent {
    AttemptDone { job: usize, outcome: AttemptOutcome },
    RetryDue { job: usize },
}

/// Per-job bookkeeping. Owned by the scheduler task, never shared.
struct JobEntry {
    state: JobState,
    /// Dependencies that have not succeeded yet.
    waiting_on: usize,
    /// Attempts started so far.
    attempts: u32,
}

/// Drives a [`JobGraph`] to completion against a [`ProcessRunner`].
pub struct Scheduler {
    graph: Arc<JobGraph>,
    runner: Arc<dyn ProcessRunner>,
    config: BatchConfig,
    cancel: CancelSignal,
}

impl Scheduler {
    pub fn new(
        graph: Arc<JobGraph>,
        runner: Arc<dyn ProcessRunner>,
        config: BatchConfig,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            graph,
            runner,
            config,
            cancel,
        }
    }

    /// Run every job to a terminal state, emitting exactly one [`JobResult`]
    /// per job on `results`. Returns once nothing is pending, ready or
    /// running. The results sender drops on return, closing the stream.
    pub async fn run(self, results: mpsc::Sender<JobResult>) {
        let Self {
            graph,
            runner,
            config,
            cancel,
        } = self;

        let n = graph.len();
        let (events_tx, mut events_rx) = mpsc::channel(config.channel_capacity);

        // Commands resolve identically on every attempt, so render them once.
        // Graph validation makes failure here unreachable in practice.
        let resolved = (0..n)
            .map(|i| graph.spec_at(i).resolve(&config).map_err(|e| e.to_string()))
            .collect();
        let entries = (0..n)
            .map(|i| JobEntry {
                state: JobState::Pending,
                waiting_on: graph.dependency_indices(i).len(),
                attempts: 0,
            })
            .collect();

        let mut run = BatchRun {
            graph,
            runner,
            config,
            cancel: cancel.clone(),
            entries,
            resolved,
            ready: VecDeque::new(),
            running: 0,
            terminal: 0,
            cancelling: false,
            events_tx,
            results,
        };

        for i in run.graph.initial_ready_indices() {
            run.set_state(i, JobState::Ready);
            run.ready.push_back(i);
        }

        info!(jobs = n, workers = run.config.max_workers, "batch scheduling started");

        while run.terminal < n {
            run.dispatch().await;
            if run.terminal >= n {
                break;
            }

            tokio::select! {
                Some(event) = events_rx.recv() => match event {
                    SchedulerEvent::AttemptDone { job, outcome } => {
                        run.on_attempt_done(job, outcome).await;
                    }
                    SchedulerEvent::RetryDue { job } => {
                        run.on_retry_due(job);
                    }
                },
                _ = cancel.cancelled(), if !run.cancelling => {
                    run.sweep_cancelled().await;
                }
            }
        }

        info!(jobs = n, "batch scheduling finished");
    }
}

/// Loop state of one batch execution.
struct BatchRun {
    graph: Arc<JobGraph>,
    runner: Arc<dyn ProcessRunner>,
    config: BatchConfig,
    cancel: CancelSignal,
    entries: Vec<JobEntry>,
    /// Pre-rendered commands; errors surface as spawn failures at claim time.
    resolved: Vec<Result<ResolvedCommand, String>>,
    ready: VecDeque<usize>,
    running: usize,
    terminal: usize,
    cancelling: bool,
    events_tx: mpsc::Sender<SchedulerEvent>,
    results: mpsc::Sender<JobResult>,
}

impl BatchRun {
    /// Claim ready jobs up to the worker bound, in queue order.
    async fn dispatch(&mut self) {
        while !self.cancelling
            && !self.cancel.is_cancelled()
            && self.running < self.config.max_workers
        {
            let Some(job) = self.ready.pop_front() else {
                break;
            };
            // Stale entries: skip sweeps leave queued indices behind.
            if self.entries[job].state != JobState::Ready {
                continue;
            }

            self.set_state(job, JobState::Running);
            self.entries[job].attempts += 1;

            match self.resolved[job].clone() {
                Ok(cmd) => {
                    self.running += 1;
                    self.spawn_attempt(job, cmd);
                }
                Err(message) => {
                    self.fail_attempt(job, FailureReason::SpawnFailed { message }, None)
                        .await;
                }
            }
        }
    }

    fn spawn_attempt(&self, job: usize, cmd: ResolvedCommand) {
        let runner = Arc::clone(&self.runner);
        let cancel = self.cancel.clone();
        let events = self.events_tx.clone();
        let id = self.graph.id_at(job).clone();
        let attempt = self.entries[job].attempts;

        tokio::spawn(async move {
            debug!(job = %id, program = %cmd.program, attempt, "attempt started");
            let outcome = match runner.run(&cmd, &cancel).await {
                Ok(po) => AttemptOutcome::Finished(po),
                Err(e) => AttemptOutcome::NotRun(e.to_string()),
            };
            if events
                .send(SchedulerEvent::AttemptDone { job, outcome })
                .await
                .is_err()
            {
                warn!(job = %id, "scheduler stopped before attempt completion");
            }
        });
    }

    async fn on_attempt_done(&mut self, job: usize, outcome: AttemptOutcome) {
        self.running -= 1;

        match outcome {
            AttemptOutcome::Finished(po) => match po.ended {
                ProcessEnd::Cancelled => self.finish_cancelled(job, po).await,
                ProcessEnd::TimedOut => {
                    self.fail_attempt(job, FailureReason::Timeout, Some(po)).await;
                }
                ProcessEnd::Completed => {
                    let accepted = po
                        .exit_code
                        .is_some_and(|code| self.graph.spec_at(job).success_codes.contains(&code));
                    if accepted {
                        self.succeed(job, po).await;
                    } else {
                        let reason = match po.exit_code {
                            Some(code) => FailureReason::ExitCode { code },
                            None => FailureReason::Signal,
                        };
                        self.fail_attempt(job, reason, Some(po)).await;
                    }
                }
            },
            AttemptOutcome::NotRun(message) => {
                self.fail_attempt(job, FailureReason::SpawnFailed { message }, None)
                    .await;
            }
        }
    }

    fn on_retry_due(&mut self, job: usize) {
        // The cancel sweep may have skipped the job while its timer ran.
        if self.entries[job].state != JobState::Pending {
            return;
        }
        self.set_state(job, JobState::Ready);
        self.ready.push_back(job);
    }

    async fn succeed(&mut self, job: usize, po: ProcessOutcome) {
        let entry = &self.entries[job];
        info!(
            job = %self.graph.id_at(job),
            attempts = entry.attempts,
            duration = ?po.duration,
            "job succeeded"
        );
        let attempts = entry.attempts;
        self.set_state(job, JobState::Succeeded);
        self.terminal += 1;

        let result = JobResult {
            id: self.graph.id_at(job).clone(),
            state: JobState::Succeeded,
            exit_code: po.exit_code,
            stdout: po.stdout,
            stderr: po.stderr,
            attempts,
            duration: po.duration,
            reason: None,
            finished_at: chrono::Utc::now(),
            params: self.graph.spec_at(job).params.clone(),
        };
        self.emit(result).await;
        self.unlock_dependents(job);
    }

    /// A failed attempt either goes back for retry or seals the job.
    async fn fail_attempt(
        &mut self,
        job: usize,
        reason: FailureReason,
        po: Option<ProcessOutcome>,
    ) {
        let policy = self.graph.spec_at(job).effective_retry(&self.config);
        let attempts = self.entries[job].attempts;

        if !self.cancelling && attempts < policy.max_attempts {
            let delay = policy.delay_after(attempts);
            warn!(
                job = %self.graph.id_at(job),
                attempt = attempts,
                max_attempts = policy.max_attempts,
                %reason,
                backoff = ?delay,
                "attempt failed, will retry"
            );
            self.set_state(job, JobState::Pending);
            if delay.is_zero() {
                self.set_state(job, JobState::Ready);
                self.ready.push_back(job);
            } else {
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(SchedulerEvent::RetryDue { job }).await;
                });
            }
            return;
        }

        warn!(
            job = %self.graph.id_at(job),
            attempts,
            %reason,
            "job failed"
        );
        self.set_state(job, JobState::Failed);
        self.terminal += 1;

        let (exit_code, stdout, stderr, duration) = match po {
            Some(po) => (po.exit_code, po.stdout, po.stderr, po.duration),
            None => (None, Default::default(), Default::default(), Default::default()),
        };
        let result = JobResult {
            id: self.graph.id_at(job).clone(),
            state: JobState::Failed,
            exit_code,
            stdout,
            stderr,
            attempts,
            duration,
            reason: Some(reason),
            finished_at: chrono::Utc::now(),
            params: self.graph.spec_at(job).params.clone(),
        };
        self.emit(result).await;
        self.skip_dependents(job).await;
    }

    /// In-flight job killed by cancellation: terminal `Skipped`, with
    /// whatever output it produced before the kill.
    async fn finish_cancelled(&mut self, job: usize, po: ProcessOutcome) {
        let attempts = self.entries[job].attempts;
        debug!(job = %self.graph.id_at(job), "in-flight job cancelled");
        self.set_state(job, JobState::Skipped);
        self.terminal += 1;

        let result = JobResult {
            id: self.graph.id_at(job).clone(),
            state: JobState::Skipped,
            exit_code: None,
            stdout: po.stdout,
            stderr: po.stderr,
            attempts,
            duration: po.duration,
            reason: Some(FailureReason::Cancelled),
            finished_at: chrono::Utc::now(),
            params: self.graph.spec_at(job).params.clone(),
        };
        self.emit(result).await;
        self.skip_dependents(job).await;
    }

    /// A dependency succeeded: dependents with no remaining dependencies
    /// become ready, in spec-set insertion order.
    fn unlock_dependents(&mut self, job: usize) {
        let graph = Arc::clone(&self.graph);
        for &d in graph.dependent_indices(job) {
            let entry = &mut self.entries[d];
            entry.waiting_on -= 1;
            if entry.waiting_on == 0 && entry.state == JobState::Pending && !self.cancelling {
                self.set_state(d, JobState::Ready);
                self.ready.push_back(d);
            }
        }
    }

    /// Transitively skip everything downstream of a failed or skipped job.
    async fn skip_dependents(&mut self, from: usize) {
        let graph = Arc::clone(&self.graph);
        let mut queue: VecDeque<(usize, usize)> = graph
            .dependent_indices(from)
            .iter()
            .map(|&d| (from, d))
            .collect();

        while let Some((cause, job)) = queue.pop_front() {
            if !matches!(
                self.entries[job].state,
                JobState::Pending | JobState::Ready
            ) {
                continue;
            }
            debug!(
                job = %graph.id_at(job),
                cause = %graph.id_at(cause),
                "job skipped"
            );
            self.set_state(job, JobState::Skipped);
            self.terminal += 1;

            let result = JobResult::skipped(
                graph.id_at(job).clone(),
                graph.spec_at(job).params.clone(),
                FailureReason::DependencyFailed {
                    dependency: graph.id_at(cause).clone(),
                },
            );
            self.emit(result).await;

            for &d in graph.dependent_indices(job) {
                queue.push_back((job, d));
            }
        }
    }

    /// Cancellation: every job that has not started ends `Skipped` now.
    /// Running jobs finish on their own terms; the runner kills them.
    async fn sweep_cancelled(&mut self) {
        self.cancelling = true;
        warn!("cancellation requested, skipping all unstarted jobs");

        let graph = Arc::clone(&self.graph);
        for job in 0..graph.len() {
            if !matches!(
                self.entries[job].state,
                JobState::Pending | JobState::Ready
            ) {
                continue;
            }
            self.set_state(job, JobState::Skipped);
            self.terminal += 1;
            let mut result = JobResult::skipped(
                graph.id_at(job).clone(),
                graph.spec_at(job).params.clone(),
                FailureReason::Cancelled,
            );
            // A job swept while waiting out a retry backoff has run before.
            result.attempts = self.entries[job].attempts;
            self.emit(result).await;
        }
        self.ready.clear();
    }

    async fn emit(&self, result: JobResult) {
        if self.results.send(result).await.is_err() {
            warn!("result channel closed, dropping result");
        }
    }

    fn set_state(&mut self, job: usize, to: JobState) {
        let from = self.entries[job].state;
        debug_assert!(
            from.can_transition_to(to),
            "illegal transition {from} -> {to}"
        );
        debug!(job = %self.graph.id_at(job), %from, %to, "job state");
        self.entries[job].state = to;
    }
}
