//! Static checks over a [`WorkflowDefinition`] before it's ever run.

use thiserror::Error;

use crate::workflow::job::InputBinding;
use crate::workflow::resolver::DependencyResolver;
use crate::workflow::WorkflowDefinition;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("job {job:?} needs unknown job {depends_on:?}")]
    UnknownDependency { job: String, depends_on: String },
    #[error("job {job:?} reads input from unknown job {source:?}")]
    UnknownInputSource { job: String, source: String },
    #[error("cycle detected among jobs: {0:?}")]
    Cycle(Vec<String>),
    #[error("workflow has no start job (a job with no dependencies)")]
    NoStartJob,
    #[error("workflow has no terminal job (outputs_to_workflow or terminates_workflow)")]
    NoTerminalJob,
    #[error("job {producer:?} outputs {produced:?} but job {consumer:?} expects {expected:?}")]
    TypeMismatch {
        producer: String,
        produced: &'static str,
        consumer: String,
        expected: &'static str,
    },
}

/// Validates a [`WorkflowDefinition`], collecting every problem found
/// rather than failing on the first — an author fixing one cycle wants to
/// see the rest of the diagnostics in the same pass.
pub struct WorkflowValidator;

impl WorkflowValidator {
    pub fn validate(workflow: &WorkflowDefinition) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        for job in workflow.jobs.values() {
            for dep in &job.needs {
                if !workflow.jobs.contains_key(dep) {
                    errors.push(ValidationError::UnknownDependency {
                        job: job.name.clone(),
                        depends_on: dep.clone(),
                    });
                }
            }

            match &job.input_binding {
                InputBinding::FromJob(name) if !workflow.jobs.contains_key(name) => {
                    errors.push(ValidationError::UnknownInputSource {
                        job: job.name.clone(),
                        source: name.clone(),
                    });
                }
                InputBinding::FromMultiple(mapping) => {
                    for source in mapping.values() {
                        let referenced = match source {
                            crate::workflow::job::FieldSource::WholeOutput(name) => Some(name),
                            crate::workflow::job::FieldSource::Field { job, .. } => Some(job),
                            crate::workflow::job::FieldSource::WorkflowInput => None,
                        };
                        if let Some(name) = referenced {
                            if !workflow.jobs.contains_key(name) {
                                errors.push(ValidationError::UnknownInputSource {
                                    job: job.name.clone(),
                                    source: name.clone(),
                                });
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        if errors.is_empty() {
            let resolver = DependencyResolver::new();
            if let Err(e) = resolver.resolve(&workflow.jobs) {
                match e {
                    crate::workflow::resolver::ResolverError::CircularDependency(cycle) => {
                        errors.push(ValidationError::Cycle(cycle));
                    }
                    crate::workflow::resolver::ResolverError::UnknownDependency {
                        job,
                        depends_on,
                    } => {
                        errors.push(ValidationError::UnknownDependency { job, depends_on });
                    }
                }
            }
        }

        if !workflow.jobs.values().any(|j| j.needs.is_empty()) {
            errors.push(ValidationError::NoStartJob);
        }

        if !workflow
            .jobs
            .values()
            .any(|j| j.outputs_to_workflow || j.terminates_workflow)
        {
            errors.push(ValidationError::NoTerminalJob);
        }

        for job in workflow.jobs.values() {
            if let InputBinding::FromJob(producer_name) = &job.input_binding {
                if let (Some(producer), Some(expected)) =
                    (workflow.jobs.get(producer_name), job.input_type)
                {
                    if let Some(produced) = producer.output_type {
                        if produced != expected {
                            errors.push(ValidationError::TypeMismatch {
                                producer: producer.name.clone(),
                                produced,
                                consumer: job.name.clone(),
                                expected,
                            });
                        }
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
