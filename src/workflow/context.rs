//! Per-run record of step outcomes.

use serde::{Deserialize, Serialize};

/// Outcome of one executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "lowercase")]
pub enum StepOutcome {
    Success(serde_json::Value),
    /// Error description.
    Failure(String),
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn value(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Success(v) => Some(v),
            Self::Failure(_) => None,
        }
    }
}

/// Ordered map of step id to outcome for a single run.
///
/// Insertion order is execution order. The context lives only as long as
/// the run; it is not persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub pack_id: String,
    pub instance_id: Option<u64>,
    entries: Vec<(String, StepOutcome)>,
}

impl WorkflowContext {
    pub fn new(pack_id: impl Into<String>, instance_id: Option<u64>) -> Self {
        Self {
            pack_id: pack_id.into(),
            instance_id,
            entries: Vec::new(),
        }
    }

    /// Records `outcome` for `step_id`, replacing an earlier record in place.
    pub fn record(&mut self, step_id: impl Into<String>, outcome: StepOutcome) {
        let step_id = step_id.into();
        match self.entries.iter_mut().find(|(id, _)| *id == step_id) {
            Some((_, existing)) => *existing = outcome,
            None => self.entries.push((step_id, outcome)),
        }
    }

    pub fn get(&self, step_id: &str) -> Option<&StepOutcome> {
        self.entries
            .iter()
            .find(|(id, _)| id == step_id)
            .map(|(_, outcome)| outcome)
    }

    /// Recorded success value of `step_id`.
    pub fn value(&self, step_id: &str) -> Option<&serde_json::Value> {
        self.get(step_id).and_then(StepOutcome::value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StepOutcome)> {
        self.entries.iter().map(|(id, o)| (id.as_str(), o))
    }

    /// Step ids in execution order.
    pub fn step_ids(&self) -> Vec<&str> {
        self.entries.iter().map(|(id, _)| id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
