//! Shared, mutable state threaded through one workflow run.

use std::collections::BTreeSet;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::workflow::job::{FieldSource, InputBinding, Job};

/// Per-run state: the workflow's own input, every completed job's output,
/// and bookkeeping of which jobs have run or failed.
pub struct WorkflowContext {
    workflow_input: Value,
    job_outputs: DashMap<String, Value>,
    completed_jobs: Mutex<BTreeSet<String>>,
    failed_jobs: Mutex<BTreeSet<String>>,
    correlation_id: String,
}

impl WorkflowContext {
    pub fn new(workflow_input: Value, correlation_id: impl Into<String>) -> Self {
        Self {
            workflow_input,
            job_outputs: DashMap::new(),
            completed_jobs: Mutex::new(BTreeSet::new()),
            failed_jobs: Mutex::new(BTreeSet::new()),
            correlation_id: correlation_id.into(),
        }
    }

    pub fn workflow_input(&self) -> &Value {
        &self.workflow_input
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn record_output(&self, job_name: &str, output: Value) {
        self.job_outputs.insert(job_name.to_string(), output);
        self.completed_jobs.lock().insert(job_name.to_string());
    }

    pub fn record_failure(&self, job_name: &str) {
        self.failed_jobs.lock().insert(job_name.to_string());
    }

    pub fn record_skip(&self, job_name: &str) {
        self.job_outputs.insert(job_name.to_string(), Value::Null);
    }

    pub fn output_of(&self, job_name: &str) -> Option<Value> {
        self.job_outputs.get(job_name).map(|v| v.clone())
    }

    pub fn is_completed(&self, job_name: &str) -> bool {
        self.completed_jobs.lock().contains(job_name)
    }

    pub fn is_failed(&self, job_name: &str) -> bool {
        self.failed_jobs.lock().contains(job_name)
    }

    pub fn completed_jobs(&self) -> BTreeSet<String> {
        self.completed_jobs.lock().clone()
    }

    /// Resolve a job's input value per its [`InputBinding`]. A
    /// `FromMultiple` field sourced from a skipped (never-recorded)
    /// upstream job resolves as JSON `null` rather than omitting the key
    /// or erroring, so a downstream fan-in job can branch on `.is_null()`
    /// without a separate "was this skipped" side channel.
    pub fn build_job_input(&self, job: &Job) -> Value {
        match &job.input_binding {
            InputBinding::Workflow => self.workflow_input.clone(),
            InputBinding::FromJob(name) => self.output_of(name).unwrap_or(Value::Null),
            InputBinding::Default => Value::Object(Default::default()),
            InputBinding::FromMultiple(mapping) => {
                let mut object = serde_json::Map::new();
                for (field, source) in mapping {
                    let value = match source {
                        FieldSource::WholeOutput(job_name) => {
                            self.output_of(job_name).unwrap_or(Value::Null)
                        }
                        FieldSource::Field { job: job_name, pointer } => self
                            .output_of(job_name)
                            .and_then(|v| v.pointer(pointer).cloned())
                            .unwrap_or(Value::Null),
                        FieldSource::WorkflowInput => self.workflow_input.clone(),
                    };
                    object.insert(field.clone(), value);
                }
                Value::Object(object)
            }
        }
    }
}
