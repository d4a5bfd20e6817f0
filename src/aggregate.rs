//! Streaming result aggregation.
//!
//! The aggregator folds collected results into running accumulations as the
//! batch progresses; nothing is buffered. The merge is commutative and
//! associative (counts, sums, minima, maxima), so arrival order never
//! changes the final state. Skipped jobs are counted but excluded from every
//! numeric accumulation.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::collect::CollectedResult;
use crate::params::display_value;
use crate::state::JobState;

/// Running statistics over one numeric output field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NumericStats {
    pub count: u64,
    pub sum: f64,
    /// Meaningful only when `count > 0`.
    pub min: f64,
    /// Meaningful only when `count > 0`.
    pub max: f64,
}

impl NumericStats {
    fn observe(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            if value < self.min {
                self.min = value;
            }
            if value > self.max {
                self.max = value;
            }
        }
        self.count += 1;
        self.sum += value;
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Running statistics over the durations of jobs that actually ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DurationStats {
    pub count: u64,
    pub total: Duration,
    /// Meaningful only when `count > 0`.
    pub min: Duration,
    /// Meaningful only when `count > 0`.
    pub max: Duration,
}

impl DurationStats {
    fn observe(&mut self, duration: Duration) {
        if self.count == 0 {
            self.min = duration;
            self.max = duration;
        } else {
            if duration < self.min {
                self.min = duration;
            }
            if duration > self.max {
                self.max = duration;
            }
        }
        self.count += 1;
        self.total += duration;
    }

    pub fn mean(&self) -> Option<Duration> {
        (self.count > 0).then(|| self.total / self.count as u32)
    }
}

/// Accumulation over one slice of results (the whole batch, or one group).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tally {
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Attempts started across all folded results.
    pub attempts: u64,
    /// Durations of jobs that ran (succeeded or failed).
    pub duration: DurationStats,
    /// Per-field statistics over parsed output; numeric fields only.
    pub fields: BTreeMap<String, NumericStats>,
}

impl Tally {
    fn fold(&mut self, collected: &CollectedResult) {
        let result = &collected.result;
        match result.state {
            JobState::Succeeded => self.succeeded += 1,
            JobState::Failed => self.failed += 1,
            JobState::Skipped => self.skipped += 1,
            // Non-terminal states never reach the aggregator.
            _ => {}
        }
        self.attempts += u64::from(result.attempts);
        if result.state != JobState::Skipped {
            self.duration.observe(result.duration);
        }
        if let Some(record) = &collected.data {
            for (key, value) in record {
                if let Some(number) = value.as_f64() {
                    self.fields.entry(key.clone()).or_default().observe(number);
                }
            }
        }
    }
}

/// Point-in-time view of the accumulated reduction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateState {
    /// Results folded so far.
    pub total: u64,
    pub overall: Tally,
    /// Sub-tallies keyed by the rendered group-key combination, present when
    /// the aggregator was configured with group keys.
    pub groups: BTreeMap<String, Tally>,
}

/// Folds collected results into an [`AggregateState`].
///
/// `merge` is called from the collection pipeline; `snapshot` may be called
/// from anywhere at any time and sees a consistent state.
#[derive(Debug, Default)]
pub struct Aggregator {
    group_keys: Vec<String>,
    state: Mutex<AggregateState>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Additionally keep one sub-tally per distinct combination of the given
    /// parameter keys.
    pub fn grouped_by<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            group_keys: keys.into_iter().map(Into::into).collect(),
            state: Mutex::new(AggregateState::default()),
        }
    }

    /// Fold one result into the accumulation.
    pub fn merge(&self, collected: &CollectedResult) {
        let mut state = self.lock();
        state.total += 1;
        state.overall.fold(collected);
        if !self.group_keys.is_empty() {
            let key = self.group_key(collected);
            state.groups.entry(key).or_default().fold(collected);
        }
        debug!(job = %collected.result.id, total = state.total, "result aggregated");
    }

    /// Consistent point-in-time copy of the accumulation.
    pub fn snapshot(&self) -> AggregateState {
        self.lock().clone()
    }

    /// Consume the aggregator after the stream is exhausted.
    pub fn finalize(self) -> AggregateState {
        self.state
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn group_key(&self, collected: &CollectedResult) -> String {
        let params = &collected.result.params;
        self.group_keys
            .iter()
            .map(|key| {
                let value = params
                    .get(key)
                    .map(display_value)
                    .unwrap_or_default();
                format!("{key}={value}")
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    fn lock(&self) -> MutexGuard<'_, AggregateState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
