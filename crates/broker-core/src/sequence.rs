// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ordered, immutable lists of named steps.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::step::Step;

/// Errors detected while assembling a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    /// The sequence has no steps.
    #[error("sequence '{0}' has no steps")]
    Empty(String),

    /// Two steps share a name, which would make resume markers ambiguous.
    #[error("sequence '{sequence}' contains step '{step}' more than once")]
    DuplicateStep {
        /// Sequence name.
        sequence: String,
        /// Repeated step name.
        step: String,
    },
}

/// The steps of one (service, plan, operation) workflow.
#[derive(Clone)]
pub struct StepSequence {
    name: String,
    steps: Arc<[Arc<dyn Step>]>,
}

impl fmt::Debug for StepSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepSequence")
            .field("name", &self.name)
            .field("steps", &self.step_names())
            .finish()
    }
}

impl StepSequence {
    /// Start building a sequence.
    pub fn builder(name: impl Into<String>) -> StepSequenceBuilder {
        StepSequenceBuilder {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Sequence name (used in logs).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Always false for a built sequence.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step at `index`, if any.
    pub fn step(&self, index: usize) -> Option<&Arc<dyn Step>> {
        self.steps.get(index)
    }

    /// Position of the step with the given name.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name() == name)
    }

    /// Step names in execution order.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }
}

/// Builder for [`StepSequence`].
pub struct StepSequenceBuilder {
    name: String,
    steps: Vec<Arc<dyn Step>>,
}

impl StepSequenceBuilder {
    /// Append a step.
    pub fn step<S: Step + 'static>(mut self, step: S) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Append an already shared step.
    pub fn shared_step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    /// Validate and freeze the sequence.
    pub fn build(self) -> Result<StepSequence, SequenceError> {
        if self.steps.is_empty() {
            return Err(SequenceError::Empty(self.name));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name().to_string()) {
                return Err(SequenceError::DuplicateStep {
                    sequence: self.name,
                    step: step.name().to_string(),
                });
            }
        }

        Ok(StepSequence {
            name: self.name,
            steps: self.steps.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{StepOutcome, step_fn};

    fn noop(name: &'static str) -> impl Step {
        step_fn(name, |_ctx, _instance| async { Ok(StepOutcome::done()) })
    }

    #[test]
    fn test_build_keeps_order() {
        let seq = StepSequence::builder("search/deprovision")
            .step(noop("deleteARMDeployment"))
            .step(noop("deleteAzureSearch"))
            .build()
            .unwrap();

        assert_eq!(seq.len(), 2);
        assert_eq!(
            seq.step_names(),
            vec!["deleteARMDeployment", "deleteAzureSearch"]
        );
        assert_eq!(seq.position("deleteAzureSearch"), Some(1));
        assert!(seq.step(2).is_none());
    }

    #[test]
    fn test_empty_sequence_rejected() {
        let err = StepSequence::builder("empty").build().unwrap_err();
        assert_eq!(err, SequenceError::Empty("empty".to_string()));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = StepSequence::builder("dup")
            .step(noop("preProvision"))
            .step(noop("deployARMTemplate"))
            .step(noop("preProvision"))
            .build()
            .unwrap_err();

        assert_eq!(
            err,
            SequenceError::DuplicateStep {
                sequence: "dup".to_string(),
                step: "preProvision".to_string(),
            }
        );
    }
}
