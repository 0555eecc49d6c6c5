//! Topologically sorts a job graph into dependency levels, with a keyed cache.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;

use crate::workflow::job::Job;

/// One batch of job names with no dependency on each other, safe to run
/// concurrently.
pub type Level = Vec<String>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolverError {
    #[error("circular dependency among jobs: {0:?}")]
    CircularDependency(Vec<String>),
    #[error("job {job:?} depends on unknown job {depends_on:?}")]
    UnknownDependency { job: String, depends_on: String },
}

/// Resolves a job map into ordered levels via Kahn's algorithm, caching
/// results keyed by a SHA-256 digest of the graph's shape.
pub struct DependencyResolver {
    cache: DashMap<[u8; 32], Arc<Vec<Level>>>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
        }
    }

    /// Clear the resolver cache (process-wide `reset()`).
    pub fn reset(&self) {
        self.cache.clear();
    }

    pub fn resolve(&self, jobs: &HashMap<String, Job>) -> Result<Arc<Vec<Level>>, ResolverError> {
        let key = Self::cache_key(jobs);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }

        let levels = Arc::new(Self::topo_sort(jobs)?);
        self.cache.insert(key, levels.clone());
        Ok(levels)
    }

    fn cache_key(jobs: &HashMap<String, Job>) -> [u8; 32] {
        let canonical: BTreeMap<&str, Vec<&str>> = jobs
            .iter()
            .map(|(name, job)| {
                let mut deps: Vec<&str> = job.needs.iter().map(String::as_str).collect();
                deps.sort_unstable();
                (name.as_str(), deps)
            })
            .collect();

        let bytes = serde_json::to_vec(&canonical).expect("canonical map always serializes");
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hasher.finalize().into()
    }

    fn topo_sort(jobs: &HashMap<String, Job>) -> Result<Vec<Level>, ResolverError> {
        for job in jobs.values() {
            for dep in &job.needs {
                if !jobs.contains_key(dep) {
                    return Err(ResolverError::UnknownDependency {
                        job: job.name.clone(),
                        depends_on: dep.clone(),
                    });
                }
            }
        }

        let mut in_degree: HashMap<&str, usize> =
            jobs.keys().map(|k| (k.as_str(), 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> =
            jobs.keys().map(|k| (k.as_str(), Vec::new())).collect();

        for job in jobs.values() {
            *in_degree.get_mut(job.name.as_str()).unwrap() = job.needs.len();
            for dep in &job.needs {
                dependents.get_mut(dep.as_str()).unwrap().push(job.name.as_str());
            }
        }

        let mut frontier: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut levels = Vec::new();
        let mut visited = 0usize;

        while !frontier.is_empty() {
            let level: Vec<String> = frontier.iter().map(|s| s.to_string()).collect();
            visited += level.len();

            let mut next_frontier = BTreeSet::new();
            for &name in &frontier {
                for &dependent in &dependents[name] {
                    let deg = in_degree.get_mut(dependent).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        next_frontier.insert(dependent);
                    }
                }
            }

            levels.push(level);
            frontier = next_frontier;
        }

        if visited != jobs.len() {
            let cycle: Vec<String> = in_degree
                .into_iter()
                .filter(|(_, deg)| *deg > 0)
                .map(|(name, _)| name.to_string())
                .collect();
            return Err(ResolverError::CircularDependency(cycle));
        }

        Ok(levels)
    }
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self::new()
    }
}
