//! The declarative job DSL: one node in a workflow's dependency graph.

use std::collections::HashMap;
use std::sync::Arc;

use crate::reliability::{CircuitBreakerConfig, RetryPolicy};
use crate::workflow::context::WorkflowContext;

/// Where a job's input comes from.
#[derive(Clone)]
pub enum InputBinding {
    /// The workflow's own input value, verbatim.
    Workflow,
    /// The named job's output.
    FromJob(String),
    /// Assembled from multiple upstream jobs, one field per source.
    FromMultiple(HashMap<String, FieldSource>),
    /// An empty JSON object.
    Default,
}

/// One field of a [`InputBinding::FromMultiple`] mapping.
#[derive(Clone)]
pub enum FieldSource {
    /// The whole output of the named job.
    WholeOutput(String),
    /// A single field, by JSON pointer path, within the named job's output.
    Field { job: String, pointer: String },
    /// The workflow's own input.
    WorkflowInput,
}

type ConditionFn = Arc<dyn Fn(&WorkflowContext) -> bool + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// One node of a workflow's DAG: what worker runs it, what it depends on,
/// where its input comes from, and how its failures are handled.
#[derive(Clone)]
pub struct Job {
    pub name: String,
    pub worker_type: String,
    pub needs: Vec<String>,
    pub input_binding: InputBinding,
    pub outputs_to_workflow: bool,
    pub terminates_workflow: bool,
    pub if_condition: Option<ConditionFn>,
    pub retry_policy: Option<RetryPolicy>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub circuit_breaker_shared_key: Option<String>,
    pub fallback_job_name: Option<String>,
    pub on_error: Option<ErrorHook>,
    pub input_type: Option<&'static str>,
    pub output_type: Option<&'static str>,
}

impl Job {
    pub fn new(name: impl Into<String>, worker_type: impl Into<String>) -> JobBuilder {
        JobBuilder::new(name, worker_type)
    }
}

/// Consuming builder for [`Job`], mirroring the teacher's `with_*` style
/// (e.g. `ActivityOptions::with_retry`/`with_priority`).
pub struct JobBuilder {
    job: Job,
}

impl JobBuilder {
    fn new(name: impl Into<String>, worker_type: impl Into<String>) -> Self {
        Self {
            job: Job {
                name: name.into(),
                worker_type: worker_type.into(),
                needs: Vec::new(),
                input_binding: InputBinding::Default,
                outputs_to_workflow: false,
                terminates_workflow: false,
                if_condition: None,
                retry_policy: None,
                circuit_breaker: None,
                circuit_breaker_shared_key: None,
                fallback_job_name: None,
                on_error: None,
                input_type: None,
                output_type: None,
            },
        }
    }

    pub fn needs(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.job.needs = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn inputs_from_workflow(mut self) -> Self {
        self.job.input_binding = InputBinding::Workflow;
        self
    }

    pub fn inputs_from_job(mut self, name: impl Into<String>) -> Self {
        self.job.input_binding = InputBinding::FromJob(name.into());
        self
    }

    pub fn inputs_from_multiple(mut self, mapping: HashMap<String, FieldSource>) -> Self {
        self.job.input_binding = InputBinding::FromMultiple(mapping);
        self
    }

    pub fn outputs_to_workflow(mut self) -> Self {
        self.job.outputs_to_workflow = true;
        self
    }

    pub fn terminates_workflow(mut self) -> Self {
        self.job.terminates_workflow = true;
        self
    }

    pub fn if_condition(mut self, predicate: impl Fn(&WorkflowContext) -> bool + Send + Sync + 'static) -> Self {
        self.job.if_condition = Some(Arc::new(predicate));
        self
    }

    pub fn retry_on_error(mut self, policy: RetryPolicy) -> Self {
        self.job.retry_policy = Some(policy);
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.job.circuit_breaker = Some(config);
        self
    }

    pub fn circuit_breaker_shared_key(mut self, key: impl Into<String>) -> Self {
        self.job.circuit_breaker_shared_key = Some(key.into());
        self
    }

    pub fn fallback_to(mut self, job_name: impl Into<String>) -> Self {
        self.job.fallback_job_name = Some(job_name.into());
        self
    }

    pub fn on_error(mut self, hook: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.job.on_error = Some(Arc::new(hook));
        self
    }

    pub fn input_type(mut self, type_tag: &'static str) -> Self {
        self.job.input_type = Some(type_tag);
        self
    }

    pub fn output_type(mut self, type_tag: &'static str) -> Self {
        self.job.output_type = Some(type_tag);
        self
    }

    pub fn build(self) -> Job {
        self.job
    }
}
