//! Execution lifecycle state machine
//!
//! An execution is created in `running` the moment a request is accepted and
//! moves to exactly one terminal state. Cancelled and failed executions can
//! be resumed; the checkpoint carries everything a fresh worker needs to
//! skip already-finished work.

use crate::types::{ChapterDraft, RawNodeOutput};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Execution lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Re-dispatched and waiting for a worker (resume path)
    Queued,
    /// Accepted; a worker owns or will shortly own the job
    Running,
    /// Manuscript assembled successfully
    Completed,
    /// Ended with an error after exhausting retries
    Failed,
    /// Stopped by operator request
    Cancelled,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Queued => write!(f, "queued"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// State transition event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub execution_id: Uuid,
    pub old_status: ExecutionStatus,
    pub new_status: ExecutionStatus,
    pub transitioned_at: DateTime<Utc>,
}

/// Caller-supplied knobs for one execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOptions {
    /// Declared genre, drives the narrative structure table
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    /// Generation attempts per node before the execution fails
    #[serde(default)]
    pub generation_attempts: Option<u32>,
}

/// Progress tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionProgress {
    /// Work units finished so far (nodes, plus chapters within a node)
    pub current: usize,
    /// Total work units discovered
    pub total: usize,
    /// Percentage complete (0.0 - 100.0)
    pub percentage: f64,
    /// Current operation description
    pub current_operation: String,
    /// Elapsed time (seconds)
    pub elapsed_seconds: u64,
    /// Estimated remaining time (seconds), None if unknown
    pub estimated_remaining_seconds: Option<u64>,
}

impl Default for ExecutionProgress {
    fn default() -> Self {
        Self {
            current: 0,
            total: 0,
            percentage: 0.0,
            current_operation: String::from("Accepted"),
            elapsed_seconds: 0,
            estimated_remaining_seconds: None,
        }
    }
}

/// Resume checkpoint: outputs of finished nodes plus chapters accepted from
/// a partially finished multi-chapter node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Finished node outputs in completion order
    pub completed_nodes: Vec<RawNodeOutput>,
    /// Accepted chapters of the in-flight multi-chapter node, if any
    pub partial_chapters: Vec<ChapterDraft>,
}

impl Checkpoint {
    pub fn is_node_complete(&self, node_id: &str) -> bool {
        self.completed_nodes.iter().any(|o| o.node_id == node_id)
    }
}

/// Mutable payload of an execution row
///
/// Serialized camelCase because it travels verbatim in status responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionData {
    pub user_input: String,
    pub options: ExecutionOptions,
    pub nodes: Vec<super::GraphNode>,
    pub edges: Vec<super::GraphEdge>,
    pub progress: ExecutionProgress,
    /// Final compiled result once the execution completes
    pub result: Option<super::CompiledResult>,
    /// Most specific failure reason, verbatim
    pub error: Option<String>,
    /// Last validator rejection, kept for diagnosis across retries
    pub last_validation_error: Option<String>,
    pub tokens_used: u64,
    pub words_used: u64,
    pub checkpoint: Checkpoint,
}

/// One user-triggered run of an engine graph
///
/// Single-writer: only the worker holding the execution's job lock mutates
/// this record. Status readers get the latest persisted snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub execution_id: Uuid,
    pub engine_id: Uuid,
    pub user_id: Uuid,
    pub status: ExecutionStatus,
    pub data: ExecutionData,
    /// Desired-state flag flipped by stop requests; workers check it
    /// between node and chapter boundaries
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    /// Create a new execution, accepted and immediately dispatchable
    pub fn new(
        engine_id: Uuid,
        user_id: Uuid,
        nodes: Vec<super::GraphNode>,
        edges: Vec<super::GraphEdge>,
        user_input: String,
        options: ExecutionOptions,
    ) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            engine_id,
            user_id,
            status: ExecutionStatus::Running,
            data: ExecutionData {
                user_input,
                options,
                nodes,
                edges,
                progress: ExecutionProgress::default(),
                result: None,
                error: None,
                last_validation_error: None,
                tokens_used: 0,
                words_used: 0,
                checkpoint: Checkpoint::default(),
            },
            cancel_requested: false,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Transition to a new status
    pub fn transition_to(&mut self, new_status: ExecutionStatus) -> StatusTransition {
        let transition = StatusTransition {
            execution_id: self.execution_id,
            old_status: self.status,
            new_status,
            transitioned_at: Utc::now(),
        };
        self.status = new_status;

        // Terminal states set the end time; re-entering a live state
        // (resume) clears it
        match new_status {
            ExecutionStatus::Completed | ExecutionStatus::Cancelled | ExecutionStatus::Failed => {
                self.completed_at = Some(Utc::now());
            }
            ExecutionStatus::Queued | ExecutionStatus::Running => {
                self.completed_at = None;
            }
        }

        transition
    }

    /// Update progress
    pub fn update_progress(&mut self, current: usize, total: usize, operation: String) {
        self.data.progress.current = current;
        self.data.progress.total = total;
        self.data.progress.percentage = if total > 0 {
            (current as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        self.data.progress.current_operation = operation;

        let elapsed = (Utc::now() - self.created_at).num_seconds() as u64;
        self.data.progress.elapsed_seconds = elapsed;

        // Estimate remaining time
        if current > 0 && total > current {
            let rate = elapsed as f64 / current as f64;
            let remaining = ((total - current) as f64 * rate) as u64;
            self.data.progress.estimated_remaining_seconds = Some(remaining);
        } else {
            self.data.progress.estimated_remaining_seconds = None;
        }
    }

    /// Record a failure reason without losing earlier validation diagnostics
    pub fn record_error(&mut self, error: impl Into<String>) {
        self.data.error = Some(error.into());
    }

    /// Check if the execution reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            ExecutionStatus::Completed | ExecutionStatus::Cancelled | ExecutionStatus::Failed
        )
    }

    /// Whether this execution may be resumed
    pub fn is_resumable(&self) -> bool {
        matches!(
            self.status,
            ExecutionStatus::Cancelled | ExecutionStatus::Failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_execution() -> Execution {
        Execution::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Vec::new(),
            Vec::new(),
            "A story about a lighthouse keeper".to_string(),
            ExecutionOptions::default(),
        )
    }

    #[test]
    fn test_new_execution_is_running() {
        let execution = blank_execution();
        assert_eq!(execution.status, ExecutionStatus::Running);
        assert!(!execution.is_terminal());
        assert!(execution.completed_at.is_none());
    }

    #[test]
    fn test_terminal_transition_sets_completed_at() {
        let mut execution = blank_execution();
        let transition = execution.transition_to(ExecutionStatus::Completed);
        assert_eq!(transition.old_status, ExecutionStatus::Running);
        assert_eq!(transition.new_status, ExecutionStatus::Completed);
        assert!(execution.completed_at.is_some());
        assert!(execution.is_terminal());
    }

    #[test]
    fn test_cancelled_and_failed_are_resumable() {
        let mut execution = blank_execution();
        execution.transition_to(ExecutionStatus::Cancelled);
        assert!(execution.is_resumable());

        let mut execution = blank_execution();
        execution.transition_to(ExecutionStatus::Failed);
        assert!(execution.is_resumable());

        let mut execution = blank_execution();
        execution.transition_to(ExecutionStatus::Completed);
        assert!(!execution.is_resumable());
    }

    #[test]
    fn test_progress_percentage_and_estimate() {
        let mut execution = blank_execution();
        execution.update_progress(2, 8, "Generating chapter 2 of 8".to_string());
        assert!((execution.data.progress.percentage - 25.0).abs() < 0.001);
        assert_eq!(execution.data.progress.current_operation, "Generating chapter 2 of 8");

        execution.update_progress(0, 0, "Accepted".to_string());
        assert_eq!(execution.data.progress.percentage, 0.0);
        assert!(execution.data.progress.estimated_remaining_seconds.is_none());
    }

    #[test]
    fn test_checkpoint_node_lookup() {
        use crate::types::{NodeOutput, RawNodeOutput};
        let mut execution = blank_execution();
        execution.data.checkpoint.completed_nodes.push(RawNodeOutput {
            node_id: "research".to_string(),
            node_label: "Research".to_string(),
            output: NodeOutput::Process {
                content: "notes".to_string(),
            },
        });
        assert!(execution.data.checkpoint.is_node_complete("research"));
        assert!(!execution.data.checkpoint.is_node_complete("writer"));
    }
}
