//! Dependency graph over a batch of job specs.
//!
//! Built once per batch and read-only afterwards; share via `Arc`. Jobs get
//! a dense index (their insertion position) which the scheduler's state
//! table is keyed by. Validation rejects the whole set on the first problem,
//! so a batch never starts half-checked.

use std::collections::VecDeque;

use indexmap::IndexMap;

use crate::error::{GraphError, Result};
use crate::spec::{JobId, JobSpec};

/// Immutable dependency graph over a set of [`JobSpec`]s.
#[derive(Debug)]
pub struct JobGraph {
    /// Specs in insertion order; the map index is the job's dense index.
    jobs: IndexMap<JobId, JobSpec>,
    /// Dependency indices per job.
    dependencies: Vec<Vec<usize>>,
    /// Dependent indices per job, in spec-set insertion order.
    dependents: Vec<Vec<usize>>,
}

impl JobGraph {
    /// Validate a spec set and build the graph.
    ///
    /// Checks every spec's own invariants (templates render, policies sane),
    /// id uniqueness, dependency reference integrity and acyclicity.
    pub fn build(specs: Vec<JobSpec>) -> Result<Self> {
        let mut jobs: IndexMap<JobId, JobSpec> = IndexMap::with_capacity(specs.len());
        for spec in specs {
            spec.validate()?;
            let id = spec.id.clone();
            if jobs.insert(id.clone(), spec).is_some() {
                return Err(GraphError::DuplicateId { id }.into());
            }
        }

        let n = jobs.len();
        let mut dependencies: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (i, spec) in jobs.values().enumerate() {
            let mut dep_indices = Vec::with_capacity(spec.depends_on.len());
            for dep in &spec.depends_on {
                let Some(j) = jobs.get_index_of(dep) else {
                    return Err(GraphError::UnknownDependency {
                        id: spec.id.clone(),
                        dependency: dep.clone(),
                    }
                    .into());
                };
                if j == i {
                    return Err(GraphError::SelfDependency {
                        id: spec.id.clone(),
                    }
                    .into());
                }
                dep_indices.push(j);
            }
            for &j in &dep_indices {
                dependents[j].push(i);
            }
            dependencies[i] = dep_indices;
        }

        let graph = Self {
            jobs,
            dependencies,
            dependents,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Kahn's topological sort; if not every job can be processed, a cycle
    /// exists and the actual loop is extracted for the error.
    fn check_acyclic(&self) -> Result<()> {
        let n = self.jobs.len();
        let mut remaining: Vec<usize> = (0..n).map(|i| self.dependencies[i].len()).collect();
        let mut done = vec![false; n];
        let mut queue: VecDeque<usize> =
            (0..n).filter(|&i| remaining[i] == 0).collect();

        let mut processed = 0;
        while let Some(i) = queue.pop_front() {
            done[i] = true;
            processed += 1;
            for &d in &self.dependents[i] {
                remaining[d] -= 1;
                if remaining[d] == 0 {
                    queue.push_back(d);
                }
            }
        }

        if processed == n {
            return Ok(());
        }

        // Walk unresolved dependency edges from any blocked node; the first
        // repeat closes the loop. Blocked nodes always have such an edge.
        let start = (0..n).find(|&i| !done[i]).unwrap_or(0);
        let mut path: Vec<usize> = Vec::new();
        let mut cur = start;
        loop {
            if let Some(pos) = path.iter().position(|&p| p == cur) {
                path.drain(..pos);
                break;
            }
            path.push(cur);
            match self.dependencies[cur].iter().find(|&&d| !done[d]) {
                Some(&next) => cur = next,
                None => break,
            }
        }

        let ids = path.into_iter().map(|i| self.id_at(i).clone()).collect();
        Err(GraphError::Cycle { ids }.into())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Job ids in spec-set insertion order.
    pub fn ids(&self) -> impl Iterator<Item = &JobId> {
        self.jobs.keys()
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn spec(&self, id: &JobId) -> Option<&JobSpec> {
        self.jobs.get(id)
    }

    /// Direct dependencies of a job, in declaration order.
    pub fn dependencies_of(&self, id: &JobId) -> Option<Vec<JobId>> {
        let i = self.jobs.get_index_of(id)?;
        Some(
            self.dependencies[i]
                .iter()
                .map(|&j| self.id_at(j).clone())
                .collect(),
        )
    }

    /// Direct dependents of a job, in spec-set insertion order.
    pub fn dependents_of(&self, id: &JobId) -> Option<Vec<JobId>> {
        let i = self.jobs.get_index_of(id)?;
        Some(
            self.dependents[i]
                .iter()
                .map(|&j| self.id_at(j).clone())
                .collect(),
        )
    }

    /// Jobs with no dependencies, in spec-set insertion order. This seeds
    /// the scheduler's ready queue.
    pub fn initial_ready(&self) -> Vec<JobId> {
        self.initial_ready_indices()
            .into_iter()
            .map(|i| self.id_at(i).clone())
            .collect()
    }

    // ── Index-based accessors for the scheduler's state table ────────────────

    pub(crate) fn initial_ready_indices(&self) -> Vec<usize> {
        (0..self.len())
            .filter(|&i| self.dependencies[i].is_empty())
            .collect()
    }

    pub(crate) fn spec_at(&self, index: usize) -> &JobSpec {
        &self.jobs[index]
    }

    pub(crate) fn id_at(&self, index: usize) -> &JobId {
        &self.jobs[index].id
    }

    pub(crate) fn dependency_indices(&self, index: usize) -> &[usize] {
        &self.dependencies[index]
    }

    pub(crate) fn dependent_indices(&self, index: usize) -> &[usize] {
        &self.dependents[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn spec(id: &str, deps: &[&str]) -> JobSpec {
        let mut builder = JobSpec::builder(id, "true");
        for dep in deps {
            builder = builder.depends_on(*dep);
        }
        builder.build().unwrap()
    }

    #[test]
    fn diamond_builds_and_answers_queries() {
        let graph = JobGraph::build(vec![
            spec("a", &[]),
            spec("b", &["a"]),
            spec("c", &["a"]),
            spec("d", &["b", "c"]),
        ])
        .unwrap();

        assert_eq!(graph.len(), 4);
        assert_eq!(
            graph.ids().map(JobId::as_str).collect::<Vec<_>>(),
            vec!["a", "b", "c", "d"]
        );
        assert_eq!(
            graph.dependencies_of(&"d".into()).unwrap(),
            vec![JobId::from("b"), JobId::from("c")]
        );
        assert_eq!(
            graph.dependents_of(&"a".into()).unwrap(),
            vec![JobId::from("b"), JobId::from("c")]
        );
        assert_eq!(graph.initial_ready(), vec![JobId::from("a")]);
    }

    #[test]
    fn initial_ready_preserves_insertion_order() {
        let graph = JobGraph::build(vec![
            spec("z", &[]),
            spec("m", &["z"]),
            spec("a", &[]),
            spec("k", &[]),
        ])
        .unwrap();
        assert_eq!(
            graph.initial_ready(),
            vec![JobId::from("z"), JobId::from("a"), JobId::from("k")]
        );
    }

    #[test]
    fn duplicate_id_rejected() {
        let err = JobGraph::build(vec![spec("a", &[]), spec("a", &[])]).unwrap_err();
        assert!(matches!(
            err,
            Error::Graph(GraphError::DuplicateId { ref id }) if id.as_str() == "a"
        ));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let err = JobGraph::build(vec![spec("a", &["ghost"])]).unwrap_err();
        assert!(matches!(
            err,
            Error::Graph(GraphError::UnknownDependency { ref dependency, .. })
                if dependency.as_str() == "ghost"
        ));
    }

    #[test]
    fn self_dependency_rejected() {
        let err = JobGraph::build(vec![spec("a", &["a"])]).unwrap_err();
        assert!(matches!(err, Error::Graph(GraphError::SelfDependency { .. })));
    }

    #[test]
    fn two_node_cycle_rejected() {
        let err = JobGraph::build(vec![spec("a", &["b"]), spec("b", &["a"])]).unwrap_err();
        let Error::Graph(GraphError::Cycle { ids }) = err else {
            panic!("expected cycle error, got {err:?}");
        };
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&JobId::from("a")));
        assert!(ids.contains(&JobId::from("b")));
    }

    #[test]
    fn cycle_error_names_only_the_loop() {
        // x hangs off the cycle and must not appear in it
        let err = JobGraph::build(vec![
            spec("x", &["a"]),
            spec("a", &["b"]),
            spec("b", &["c"]),
            spec("c", &["a"]),
        ])
        .unwrap_err();
        let Error::Graph(GraphError::Cycle { ids }) = err else {
            panic!("expected cycle error, got {err:?}");
        };
        assert_eq!(ids.len(), 3);
        assert!(!ids.contains(&JobId::from("x")));
    }

    #[test]
    fn empty_set_builds() {
        let graph = JobGraph::build(Vec::new()).unwrap();
        assert!(graph.is_empty());
        assert!(graph.initial_ready().is_empty());
    }

    #[test]
    fn invalid_spec_rejected_at_build() {
        let bad = JobSpec {
            id: JobId::from("a"),
            program: String::new(),
            args: Vec::new(),
            params: Default::default(),
            depends_on: Vec::new(),
            env: Default::default(),
            working_dir: None,
            stdin: None,
            success_codes: vec![0],
            timeout: None,
            retry: None,
        };
        assert!(matches!(
            JobGraph::build(vec![bad]).unwrap_err(),
            Error::Spec(_)
        ));
    }
}
