//! Job specifications and the builder that authors them.
//!
//! A [`JobSpec`] is an immutable, declarative description of one unit of
//! work: a command template plus parameter bindings, dependency ids, and the
//! policies (timeout, retries, environment, stdin) that govern execution.
//! Specs validate fully at authoring time so a batch never starts with a
//! template that cannot render.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::BatchConfig;
use crate::error::SpecError;
use crate::params::{self, ParamSet};

/// Identifier of a job, unique within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Retry policy: total attempt budget plus the backoff between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, counting the first. Must be at least 1.
    pub max_attempts: u32,
    /// Delay scheme between a failed attempt and the next.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_attempts` total attempts and no backoff.
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::None,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Delay before the next attempt, given how many attempts have failed so far.
    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        self.backoff.delay(failed_attempts)
    }
}

/// Backoff scheme between retry attempts.
///
/// Declarative so it serializes with the spec; jitter draws from the thread
/// RNG at delay time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately.
    None,
    /// Constant delay between attempts.
    Fixed { delay: Duration },
    /// `initial * multiplier^(n-1)` before the n-th retry, capped at `max`.
    /// With `jitter`, up to 25% is shaved off to de-synchronize herds.
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
        jitter: bool,
    },
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    /// Exponential backoff doubling from `initial` up to `max`, with jitter.
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self::Exponential {
            initial,
            multiplier: 2.0,
            max,
            jitter: true,
        }
    }

    /// Delay before the next attempt after `failed_attempts` failures (>= 1).
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial,
                multiplier,
                max,
                jitter,
            } => {
                let exp = failed_attempts.saturating_sub(1).min(30) as i32;
                let raw = initial.as_secs_f64() * multiplier.powi(exp);
                let capped = raw.min(max.as_secs_f64());
                let secs = if *jitter {
                    capped * (1.0 - rand::thread_rng().gen_range(0.0..0.25))
                } else {
                    capped
                };
                Duration::from_secs_f64(secs.max(0.0))
            }
        }
    }
}

/// Which parent environment variables the child process inherits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnvInherit {
    /// Inherit the full parent environment.
    #[default]
    All,
    /// Start from an empty environment.
    None,
    /// Inherit only the named variables.
    Allow(Vec<String>),
    /// Inherit all but the named variables.
    Deny(Vec<String>),
}

/// How the child's environment is constructed: an inherit mode, templated
/// overrides applied on top, and variables removed last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EnvSpec {
    pub inherit: EnvInherit,
    /// Variables set (or overridden) for the child; values are templates.
    pub set: Vec<(String, String)>,
    /// Variables removed even when inherited.
    pub unset: Vec<String>,
}

/// Source of the child's stdin. Paths and inline text are templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StdinSpec {
    /// Feed the rendered text directly.
    Inline(String),
    /// Stream the file at the rendered path.
    File(String),
}

/// Immutable description of one unit of work.
///
/// Fields holding command text are templates over [`JobSpec::params`];
/// rendering happens at [`JobSpec::resolve`] time, once per attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique identifier within the batch.
    pub id: JobId,
    /// Program (template).
    pub program: String,
    /// Arguments (templates), in order.
    pub args: Vec<String>,
    /// Parameter bindings the templates render against.
    #[serde(default)]
    pub params: ParamSet,
    /// Ids of jobs that must succeed before this one runs, in declaration order.
    #[serde(default)]
    pub depends_on: Vec<JobId>,
    /// Environment construction for the child.
    #[serde(default)]
    pub env: EnvSpec,
    /// Working directory (template).
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Stdin source.
    #[serde(default)]
    pub stdin: Option<StdinSpec>,
    /// Exit codes treated as success.
    #[serde(default = "default_success_codes")]
    pub success_codes: Vec<i32>,
    /// Per-attempt timeout; falls back to the batch default when unset.
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Retry policy; falls back to the batch default when unset.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

fn default_success_codes() -> Vec<i32> {
    vec![0]
}

/// A fully rendered command, ready for the process runner.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Environment with override values already rendered.
    pub env: EnvSpec,
    pub working_dir: Option<String>,
    pub stdin: Option<StdinSpec>,
    /// Effective per-attempt timeout.
    pub timeout: Duration,
}

impl JobSpec {
    /// Start building a spec. `id` and `program` are templates.
    pub fn builder(id: impl Into<String>, program: impl Into<String>) -> JobSpecBuilder {
        JobSpecBuilder::new(id, program)
    }

    /// Check every invariant and render every template once.
    ///
    /// A spec that passes here cannot fail to resolve later.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.id.as_str().is_empty() {
            return Err(SpecError::EmptyId);
        }
        if self.program.is_empty() {
            return Err(SpecError::EmptyProgram {
                id: self.id.clone(),
            });
        }
        if let Some(retry) = &self.retry {
            if retry.max_attempts == 0 {
                return Err(SpecError::ZeroAttempts);
            }
        }
        self.render_all().map(|_| ())
    }

    /// Render all templates into a [`ResolvedCommand`], taking unset timeout
    /// from the batch configuration.
    pub fn resolve(&self, config: &BatchConfig) -> Result<ResolvedCommand, SpecError> {
        let mut cmd = self.render_all()?;
        cmd.timeout = self.timeout.unwrap_or(config.default_timeout);
        Ok(cmd)
    }

    /// Effective retry policy under the batch configuration.
    pub fn effective_retry(&self, config: &BatchConfig) -> RetryPolicy {
        self.retry.clone().unwrap_or_else(|| config.default_retry.clone())
    }

    fn render_all(&self) -> Result<ResolvedCommand, SpecError> {
        let program = params::render(&self.program, &self.params)?;
        let args = self
            .args
            .iter()
            .map(|a| params::render(a, &self.params))
            .collect::<Result<Vec<_>, _>>()?;
        let set = self
            .env
            .set
            .iter()
            .map(|(k, v)| Ok((k.clone(), params::render(v, &self.params)?)))
            .collect::<Result<Vec<_>, SpecError>>()?;
        let working_dir = self
            .working_dir
            .as_deref()
            .map(|d| params::render(d, &self.params))
            .transpose()?;
        let stdin = match &self.stdin {
            Some(StdinSpec::Inline(text)) => {
                Some(StdinSpec::Inline(params::render(text, &self.params)?))
            }
            Some(StdinSpec::File(path)) => {
                Some(StdinSpec::File(params::render(path, &self.params)?))
            }
            None => None,
        };

        Ok(ResolvedCommand {
            program,
            args,
            env: EnvSpec {
                inherit: self.env.inherit.clone(),
                set,
                unset: self.env.unset.clone(),
            },
            working_dir,
            stdin,
            timeout: self.timeout.unwrap_or(Duration::ZERO),
        })
    }
}

/// Builder for [`JobSpec`] values.
///
/// `build` produces a single spec from the bound parameters; `instantiate`
/// stamps one spec per [`ParamSet`], rendering the id template against each
/// set (ids must come out unique).
#[derive(Debug, Clone)]
pub struct JobSpecBuilder {
    id: String,
    program: String,
    args: Vec<String>,
    params: ParamSet,
    depends_on: Vec<JobId>,
    env: EnvSpec,
    working_dir: Option<String>,
    stdin: Option<StdinSpec>,
    success_codes: Vec<i32>,
    timeout: Option<Duration>,
    retry: Option<RetryPolicy>,
}

impl JobSpecBuilder {
    pub fn new(id: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            program: program.into(),
            args: Vec::new(),
            params: ParamSet::new(),
            depends_on: Vec::new(),
            env: EnvSpec::default(),
            working_dir: None,
            stdin: None,
            success_codes: default_success_codes(),
            timeout: None,
            retry: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Declare a dependency. Duplicate declarations collapse to one.
    pub fn depends_on(mut self, id: impl Into<JobId>) -> Self {
        let id = id.into();
        if !self.depends_on.contains(&id) {
            self.depends_on.push(id);
        }
        self
    }

    pub fn env_inherit(mut self, inherit: EnvInherit) -> Self {
        self.env.inherit = inherit;
        self
    }

    /// Set an environment variable; the value is a template.
    pub fn env_set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.set.push((key.into(), value.into()));
        self
    }

    pub fn env_unset(mut self, key: impl Into<String>) -> Self {
        self.env.unset.push(key.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn stdin_inline(mut self, text: impl Into<String>) -> Self {
        self.stdin = Some(StdinSpec::Inline(text.into()));
        self
    }

    pub fn stdin_file(mut self, path: impl Into<String>) -> Self {
        self.stdin = Some(StdinSpec::File(path.into()));
        self
    }

    pub fn success_codes<I>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = i32>,
    {
        self.success_codes = codes.into_iter().collect();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Build a single validated spec from the parameters bound so far.
    pub fn build(self) -> Result<JobSpec, SpecError> {
        let params = self.params.clone();
        self.build_with(params)
    }

    /// Stamp one validated spec per parameter set.
    ///
    /// Builder-level parameters act as a base layer; each set's bindings are
    /// laid over them. The id template must render to a distinct id per set.
    pub fn instantiate<I>(&self, sets: I) -> Result<Vec<JobSpec>, SpecError>
    where
        I: IntoIterator<Item = ParamSet>,
    {
        let mut specs: Vec<JobSpec> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for set in sets {
            let mut merged = self.params.clone();
            merged.extend(set);
            let spec = self.clone().build_with(merged)?;
            if !seen.insert(spec.id.clone()) {
                return Err(SpecError::DuplicateInstance { id: spec.id });
            }
            specs.push(spec);
        }
        Ok(specs)
    }

    fn build_with(self, params: ParamSet) -> Result<JobSpec, SpecError> {
        let id = JobId::new(params::render(&self.id, &params)?);
        let spec = JobSpec {
            id,
            program: self.program,
            args: self.args,
            params,
            depends_on: self.depends_on,
            env: self.env,
            working_dir: self.working_dir,
            stdin: self.stdin,
            success_codes: self.success_codes,
            timeout: self.timeout,
            retry: self.retry,
        };
        spec.validate()?;
        Ok(spec)
    }
}
