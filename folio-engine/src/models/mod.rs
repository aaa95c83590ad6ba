//! Data models for folio-engine
//!
//! - Execution lifecycle state machine and progress tracking
//! - Engine graphs (the DAG of generation steps)
//! - Compiled manuscripts and chapters
//! - Narrative continuity state

pub mod execution;
pub mod graph;
pub mod manuscript;
pub mod story_state;

pub use execution::{
    Checkpoint, Execution, ExecutionData, ExecutionOptions, ExecutionProgress, ExecutionStatus,
    StatusTransition,
};
pub use graph::{EngineGraph, GraphEdge, GraphNode, NodeKind};
pub use manuscript::{Chapter, CompiledResult, Manuscript, ManuscriptMetadata, TocEntry};
pub use story_state::{PlotSummary, StoryState};
