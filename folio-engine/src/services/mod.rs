//! Service modules for the book generation pipeline
//!
//! Compilation, continuity and generation are pure per invocation; the
//! dispatcher is the only service that touches the queue.

pub mod compiler;
pub mod continuity;
pub mod dedup;
pub mod dispatcher;
pub mod generator;

pub use compiler::{ChapterRejection, CompilationEngine, CompileOutcome};
pub use continuity::{ChapterContext, ChapterPurpose, ContinuityTracker};
pub use dedup::{DedupRegistry, DedupVerdict};
pub use dispatcher::Dispatcher;
pub use generator::{GenerationOutput, Generator, HttpGenerator, ScriptedGenerator};
