use crate::batch_executor::BatchOutcome;
use flowcore::{BatchItemError, FlowError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Success,
    Failed,
}

/// What happened when one node ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub node_id: String,
    pub node_type: String,
    pub status: RecordStatus,
    /// Signal returned on success
    pub action: Option<String>,
    pub duration_ms: u64,
    /// `node.key` names that appeared in the context during the run
    pub keys_written: Vec<String>,
    pub error: Option<String>,
    pub batch: Option<BatchSummary>,
}

impl ExecutionRecord {
    pub fn is_success(&self) -> bool {
        self.status == RecordStatus::Success
    }
}

/// Item counts for a batch node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub count: usize,
    pub success_count: usize,
    pub error_count: usize,
    /// Complete list; use [`BatchSummary::sample_errors`] for display
    pub errors: Vec<BatchItemError>,
}

impl BatchSummary {
    pub fn from_outcome(outcome: &BatchOutcome) -> Self {
        Self {
            count: outcome.count(),
            success_count: outcome.success_count(),
            error_count: outcome.error_count(),
            errors: outcome.errors.clone(),
        }
    }

    /// Summary of a fail-fast batch, if `error` is one.
    pub fn from_abort(error: &FlowError) -> Option<Self> {
        match error {
            FlowError::BatchAborted {
                error,
                succeeded,
                total,
            } => Some(Self {
                count: *total,
                success_count: *succeeded,
                error_count: 1,
                errors: vec![error.clone()],
            }),
            _ => None,
        }
    }

    pub fn sample_errors(&self, limit: usize) -> &[BatchItemError] {
        &self.errors[..self.errors.len().min(limit)]
    }
}
