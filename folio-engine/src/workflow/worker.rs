//! Graph-walking execution worker
//!
//! Walks an engine graph in layered topological order. Independent nodes
//! within a layer run concurrently; chapters inside a multi-chapter node run
//! strictly in sequence so each chapter's continuity context can include
//! every chapter accepted before it. The checkpoint is persisted after each
//! finished node and each accepted chapter, and cancellation is cooperative:
//! the worker checks the stored cancel flag at layer and chapter boundaries
//! and finalizes with everything accepted so far.

use std::sync::Arc;

use chrono::Utc;
use futures::future;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use folio_common::{Error, EventBus, ExecutionEvent, Result};

use crate::db;
use crate::models::{
    CompiledResult, EngineGraph, Execution, ExecutionStatus, GraphNode, NodeKind,
};
use crate::services::{CompilationEngine, ContinuityTracker, Generator};
use crate::types::{
    ChapterDraft, CompileOptions, ContentType, NodeOutput, RawNodeOutput, ValidationOptions,
};
use crate::validators::ResponseValidator;

use super::ProgressSink;

/// How a graph walk ended; cancellation is a clean outcome, not an error
enum Walk {
    Finished,
    Cancelled,
}

/// Outcome of the generation retry loop for one node or chapter
enum GenerationTry {
    Accepted {
        content: String,
        tokens: u64,
        /// Last rejection before the accepted attempt, if any
        last_failure: Option<String>,
    },
    Exhausted {
        tokens: u64,
        last_failure: String,
    },
}

/// Result of one single-shot node, applied to the execution after the
/// layer's concurrent batch resolves
struct NodeRun {
    node_id: String,
    node_label: String,
    tokens: u64,
    words: usize,
    validation_note: Option<String>,
    outcome: Result<Option<NodeOutput>>,
}

/// Executes engine graphs end to end
pub struct WorkflowWorker {
    db: SqlitePool,
    event_bus: EventBus,
    generator: Arc<dyn Generator>,
    tracker: ContinuityTracker,
    validator: ResponseValidator,
    validation_options: ValidationOptions,
    compile_options: CompileOptions,
    generation_attempts: u32,
}

impl WorkflowWorker {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        generator: Arc<dyn Generator>,
        validation_options: ValidationOptions,
        compile_options: CompileOptions,
        generation_attempts: u32,
    ) -> Self {
        Self {
            db,
            event_bus,
            generator,
            tracker: ContinuityTracker::new(),
            validator: ResponseValidator::with_options(validation_options.clone()),
            validation_options,
            compile_options,
            generation_attempts: generation_attempts.max(1),
        }
    }

    /// Replace the continuity classifiers (keyword classifiers by default)
    pub fn with_tracker(mut self, tracker: ContinuityTracker) -> Self {
        self.tracker = tracker;
        self
    }

    /// Drive one execution to a terminal state
    ///
    /// Picks up from the stored checkpoint when one exists, so the same call
    /// serves fresh dispatches, queue retries after a failure, and operator
    /// resumes. Returns `Err` only when the execution failed; completion and
    /// cancellation both return `Ok`.
    pub async fn run(&self, execution_id: Uuid, sink: Option<ProgressSink>) -> Result<()> {
        let mut execution = db::executions::load_execution(&self.db, execution_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("execution {execution_id} not found")))?;

        if execution.status == ExecutionStatus::Completed {
            info!(execution_id = %execution_id, "Execution already completed, nothing to run");
            return Ok(());
        }
        if execution.cancel_requested {
            info!(execution_id = %execution_id, "Cancel requested before work began");
            return self.finalize_cancelled(&mut execution).await;
        }

        let checkpoint = &execution.data.checkpoint;
        if checkpoint.completed_nodes.is_empty() && checkpoint.partial_chapters.is_empty() {
            info!(
                execution_id = %execution_id,
                engine_id = %execution.engine_id,
                "Starting execution"
            );
        } else {
            info!(
                execution_id = %execution_id,
                completed_nodes = checkpoint.completed_nodes.len(),
                partial_chapters = checkpoint.partial_chapters.len(),
                "Resuming execution from checkpoint"
            );
        }

        execution.transition_to(ExecutionStatus::Running);
        execution.data.error = None;
        db::executions::save_execution(&self.db, &execution).await?;
        self.event_bus.emit_lossy(ExecutionEvent::ExecutionStarted {
            execution_id,
            engine_id: execution.engine_id,
            timestamp: Utc::now(),
        });

        match self.walk(&mut execution, sink.as_ref()).await {
            Ok(Walk::Finished) => self.finalize_completed(&mut execution).await,
            Ok(Walk::Cancelled) => self.finalize_cancelled(&mut execution).await,
            Err(error) => {
                warn!(execution_id = %execution_id, error = %error, "Execution failed");
                execution.record_error(error.to_string());
                execution.transition_to(ExecutionStatus::Failed);
                if let Err(save_error) =
                    db::executions::save_execution(&self.db, &execution).await
                {
                    warn!(
                        execution_id = %execution_id,
                        error = %save_error,
                        "Failed to persist failed execution"
                    );
                }
                self.event_bus.emit_lossy(ExecutionEvent::ExecutionFailed {
                    execution_id,
                    error: error.to_string(),
                    timestamp: Utc::now(),
                });
                Err(error)
            }
        }
    }

    /// Walk every layer, skipping nodes the checkpoint already covers
    async fn walk(&self, execution: &mut Execution, sink: Option<&ProgressSink>) -> Result<Walk> {
        let graph = EngineGraph::new(
            execution.data.nodes.clone(),
            execution.data.edges.clone(),
        )?;
        let layers = graph.topological_layers()?;

        let execution_id = execution.execution_id;
        let total_units: usize = execution.data.nodes.iter().map(units_of).sum();
        let mut done_units: usize = execution
            .data
            .nodes
            .iter()
            .filter(|node| execution.data.checkpoint.is_node_complete(&node.id))
            .map(units_of)
            .sum::<usize>()
            + execution.data.checkpoint.partial_chapters.len();

        for layer in layers {
            if db::executions::cancel_requested(&self.db, execution_id).await? {
                info!(execution_id = %execution_id, "Cancel requested at layer boundary");
                return Ok(Walk::Cancelled);
            }

            let pending: Vec<&GraphNode> = layer
                .into_iter()
                .filter(|node| !execution.data.checkpoint.is_node_complete(&node.id))
                .collect();
            if pending.is_empty() {
                continue;
            }

            let (multi, simple): (Vec<&GraphNode>, Vec<&GraphNode>) = pending
                .into_iter()
                .partition(|node| node.kind == NodeKind::MultiChapterGeneration);

            if !simple.is_empty() {
                let user_input = execution.data.user_input.clone();
                let attempts = generation_attempts(execution, self.generation_attempts);
                let batch: Vec<(&GraphNode, String)> = simple
                    .into_iter()
                    .map(|node| {
                        let upstream =
                            upstream_context(&graph, node, &execution.data.checkpoint);
                        (node, upstream)
                    })
                    .collect();

                // Independent nodes within the layer run concurrently
                let runs = future::join_all(batch.into_iter().map(|(node, upstream)| {
                    self.run_simple_node(execution_id, node, upstream, user_input.clone(), attempts)
                }))
                .await;

                let mut first_error: Option<Error> = None;
                for run in runs {
                    let NodeRun {
                        node_id,
                        node_label,
                        tokens,
                        words,
                        validation_note,
                        outcome,
                    } = run;
                    execution.data.tokens_used += tokens;
                    if validation_note.is_some() {
                        execution.data.last_validation_error = validation_note;
                    }
                    match outcome {
                        Ok(output) => {
                            if let Some(output) = output {
                                execution.data.words_used += words as u64;
                                execution.data.checkpoint.completed_nodes.push(RawNodeOutput {
                                    node_id: node_id.clone(),
                                    node_label,
                                    output,
                                });
                            }
                            done_units += 1;
                            self.event_bus.emit_lossy(ExecutionEvent::NodeCompleted {
                                execution_id,
                                node_id: node_id.clone(),
                                timestamp: Utc::now(),
                            });
                            self.report_progress(
                                execution,
                                done_units,
                                total_units,
                                format!("Node {node_id} complete"),
                                sink,
                            );
                        }
                        Err(error) => {
                            warn!(
                                execution_id = %execution_id,
                                node_id = %node_id,
                                error = %error,
                                "Node failed"
                            );
                            if first_error.is_none() {
                                first_error = Some(error);
                            }
                        }
                    }
                }

                // Sibling results are checkpointed even when one node failed,
                // so a retry does not regenerate them
                db::executions::save_execution(&self.db, execution).await?;
                if let Some(error) = first_error {
                    return Err(error);
                }
            }

            for node in multi {
                match self
                    .run_multi_node(execution, &graph, node, total_units, &mut done_units, sink)
                    .await?
                {
                    Walk::Finished => {}
                    Walk::Cancelled => return Ok(Walk::Cancelled),
                }
            }
        }

        Ok(Walk::Finished)
    }

    /// Run one Input, Process, AiGeneration, or Output node
    async fn run_simple_node(
        &self,
        execution_id: Uuid,
        node: &GraphNode,
        upstream: String,
        user_input: String,
        attempts: u32,
    ) -> NodeRun {
        self.event_bus.emit_lossy(ExecutionEvent::NodeStarted {
            execution_id,
            node_id: node.id.clone(),
            label: node.label.clone(),
            timestamp: Utc::now(),
        });
        debug!(execution_id = %execution_id, node_id = %node.id, kind = ?node.kind, "Node started");

        let mut run = NodeRun {
            node_id: node.id.clone(),
            node_label: node.label.clone(),
            tokens: 0,
            words: 0,
            validation_note: None,
            outcome: Ok(None),
        };

        match node.kind {
            // The entry node republishes the caller's input as context for
            // downstream nodes; no generation happens here
            NodeKind::Input => {
                run.outcome = Ok(Some(NodeOutput::Process {
                    content: user_input,
                }));
            }
            // Reaching the output node is recorded for progress only; the
            // manuscript is compiled once the walk finishes
            NodeKind::Output => {}
            NodeKind::Process => {
                let prompt = node_prompt(node, &upstream, &user_input);
                match self.generator.generate(&prompt).await {
                    Ok(generation) => {
                        run.tokens = generation.tokens;
                        // Acceptance for context material is extraction only;
                        // chapter-grade checks do not apply
                        let validation =
                            self.validator.validate(&generation.raw, ContentType::Outline);
                        match validation.extracted_content {
                            Some(content) => {
                                run.words = content.split_whitespace().count();
                                run.outcome = Ok(Some(NodeOutput::Process { content }));
                            }
                            None => {
                                run.outcome = Err(Error::Generator(format!(
                                    "node {} returned no usable content",
                                    node.id
                                )));
                            }
                        }
                    }
                    Err(error) => run.outcome = Err(error),
                }
            }
            NodeKind::AiGeneration => {
                let prompt = node_prompt(node, &upstream, &user_input);
                match self
                    .generate_validated(
                        execution_id,
                        &node.id,
                        &prompt,
                        ContentType::Chapter,
                        attempts,
                    )
                    .await
                {
                    GenerationTry::Accepted {
                        content,
                        tokens,
                        last_failure,
                    } => {
                        run.tokens = tokens;
                        run.words = content.split_whitespace().count();
                        run.validation_note = last_failure;
                        run.outcome = Ok(Some(NodeOutput::AiGeneration { content }));
                    }
                    GenerationTry::Exhausted {
                        tokens,
                        last_failure,
                    } => {
                        run.tokens = tokens;
                        run.validation_note = Some(last_failure.clone());
                        run.outcome = Err(Error::Generator(format!(
                            "node {} rejected after {} attempts: {}",
                            node.id, attempts, last_failure
                        )));
                    }
                }
            }
            NodeKind::MultiChapterGeneration => {
                run.outcome = Err(Error::Internal(format!(
                    "node {} must run on the sequential chapter path",
                    node.id
                )));
            }
        }

        run
    }

    /// Run a multi-chapter node, one chapter at a time
    ///
    /// The continuity context for chapter N is derived from chapters 1..N-1,
    /// so generation order is the one ordering constraint the graph itself
    /// does not express.
    async fn run_multi_node(
        &self,
        execution: &mut Execution,
        graph: &EngineGraph,
        node: &GraphNode,
        total_units: usize,
        done_units: &mut usize,
        sink: Option<&ProgressSink>,
    ) -> Result<Walk> {
        let execution_id = execution.execution_id;
        let total_chapters = node.chapters.unwrap_or(1).max(1);
        let attempts = generation_attempts(execution, self.generation_attempts);
        let declared_genre = execution
            .data
            .options
            .genre
            .clone()
            .unwrap_or_else(|| String::from("fiction"));

        self.event_bus.emit_lossy(ExecutionEvent::NodeStarted {
            execution_id,
            node_id: node.id.clone(),
            label: node.label.clone(),
            timestamp: Utc::now(),
        });

        let start = execution.data.checkpoint.partial_chapters.len() as u32 + 1;
        if start > 1 {
            info!(
                execution_id = %execution_id,
                node_id = %node.id,
                resume_at = start,
                total = total_chapters,
                "Continuing multi-chapter node from checkpoint"
            );
        } else {
            info!(
                execution_id = %execution_id,
                node_id = %node.id,
                chapters = total_chapters,
                "Multi-chapter generation started"
            );
        }

        let upstream = upstream_context(graph, node, &execution.data.checkpoint);

        for number in start..=total_chapters {
            if db::executions::cancel_requested(&self.db, execution_id).await? {
                info!(
                    execution_id = %execution_id,
                    node_id = %node.id,
                    next_chapter = number,
                    "Cancel requested between chapters"
                );
                return Ok(Walk::Cancelled);
            }

            let context = self.tracker.chapter_context(
                &execution.data.user_input,
                &declared_genre,
                &execution.data.checkpoint.partial_chapters,
                number,
                total_chapters,
            );
            let title = context
                .suggested_title
                .clone()
                .unwrap_or_else(|| format!("Chapter {number}"));
            let prompt = chapter_prompt(
                node,
                &upstream,
                &execution.data.user_input,
                &context.instructions,
            );

            debug!(
                execution_id = %execution_id,
                chapter = number,
                purpose = %context.purpose,
                "Generating chapter"
            );

            let content = match self
                .generate_validated(execution_id, &node.id, &prompt, ContentType::Chapter, attempts)
                .await
            {
                GenerationTry::Accepted {
                    content,
                    tokens,
                    last_failure,
                } => {
                    execution.data.tokens_used += tokens;
                    if last_failure.is_some() {
                        execution.data.last_validation_error = last_failure;
                    }
                    content
                }
                GenerationTry::Exhausted {
                    tokens,
                    last_failure,
                } => {
                    execution.data.tokens_used += tokens;
                    execution.data.last_validation_error = Some(last_failure.clone());
                    return Err(Error::Generator(format!(
                        "chapter {} of node {} rejected after {} attempts: {}",
                        number, node.id, attempts, last_failure
                    )));
                }
            };

            let words = content.split_whitespace().count();
            execution.data.words_used += words as u64;
            execution.data.checkpoint.partial_chapters.push(ChapterDraft {
                number: Some(number),
                title: title.clone(),
                content,
            });
            *done_units += 1;
            self.report_progress(
                execution,
                *done_units,
                total_units,
                format!("Chapter {number} of {total_chapters}"),
                sink,
            );
            db::executions::save_execution(&self.db, execution).await?;
            self.event_bus.emit_lossy(ExecutionEvent::ChapterAccepted {
                execution_id,
                number,
                title,
                words,
                timestamp: Utc::now(),
            });
            info!(
                execution_id = %execution_id,
                node_id = %node.id,
                chapter = number,
                words,
                "Chapter accepted"
            );
        }

        // Fold the accepted chapters into the finished-node checkpoint
        let chapters = std::mem::take(&mut execution.data.checkpoint.partial_chapters);
        execution.data.checkpoint.completed_nodes.push(RawNodeOutput {
            node_id: node.id.clone(),
            node_label: node.label.clone(),
            output: NodeOutput::MultiChapterGeneration { chapters },
        });
        db::executions::save_execution(&self.db, execution).await?;
        self.event_bus.emit_lossy(ExecutionEvent::NodeCompleted {
            execution_id,
            node_id: node.id.clone(),
            timestamp: Utc::now(),
        });

        Ok(Walk::Finished)
    }

    /// Generation call with validation, retried up to the attempt budget
    async fn generate_validated(
        &self,
        execution_id: Uuid,
        node_id: &str,
        prompt: &str,
        content_type: ContentType,
        attempts: u32,
    ) -> GenerationTry {
        let mut tokens = 0u64;
        let mut last_failure: Option<String> = None;

        for attempt in 1..=attempts {
            let raw = match self.generator.generate(prompt).await {
                Ok(generation) => {
                    tokens += generation.tokens;
                    generation.raw
                }
                Err(error) => {
                    warn!(
                        execution_id = %execution_id,
                        node_id = %node_id,
                        attempt,
                        error = %error,
                        "Generation call failed"
                    );
                    last_failure = Some(error.to_string());
                    if attempt < attempts {
                        self.event_bus.emit_lossy(ExecutionEvent::GenerationRetry {
                            execution_id,
                            node_id: node_id.to_string(),
                            attempt,
                            code: String::from("GENERATION_ERROR"),
                            timestamp: Utc::now(),
                        });
                    }
                    continue;
                }
            };

            let validation = self.validator.validate(&raw, content_type);
            if validation.is_valid {
                if let Some(content) = validation.extracted_content {
                    for warning in &validation.warnings {
                        debug!(
                            execution_id = %execution_id,
                            node_id = %node_id,
                            warning = %warning,
                            "Validation warning"
                        );
                    }
                    return GenerationTry::Accepted {
                        content,
                        tokens,
                        last_failure,
                    };
                }
            }

            let (code, message) = match validation.first_critical() {
                Some(issue) => (issue.code.as_str().to_string(), issue.message.clone()),
                None => (
                    String::from("NO_CONTENT"),
                    String::from("no usable content"),
                ),
            };
            warn!(
                execution_id = %execution_id,
                node_id = %node_id,
                attempt,
                code = %code,
                "Generated content rejected"
            );
            last_failure = Some(format!("{code}: {message}"));
            if attempt < attempts {
                self.event_bus.emit_lossy(ExecutionEvent::GenerationRetry {
                    execution_id,
                    node_id: node_id.to_string(),
                    attempt,
                    code,
                    timestamp: Utc::now(),
                });
            }
        }

        GenerationTry::Exhausted {
            tokens,
            last_failure: last_failure
                .unwrap_or_else(|| String::from("no attempt produced usable content")),
        }
    }

    /// Compile finished node outputs and complete the execution
    async fn finalize_completed(&self, execution: &mut Execution) -> Result<()> {
        let execution_id = execution.execution_id;

        let mut options = self.compile_options.clone();
        if execution.data.options.title.is_some() {
            options.title = execution.data.options.title.clone();
        }
        if execution.data.options.author.is_some() {
            options.author = execution.data.options.author.clone();
        }
        let compiler = CompilationEngine::new(options, self.validation_options.clone());

        let outcome = compiler.compile(
            &execution.data.checkpoint.completed_nodes,
            &execution.data.user_input,
        );

        for rejection in &outcome.rejections {
            self.event_bus.emit_lossy(ExecutionEvent::ChapterRejected {
                execution_id,
                title: rejection.title.clone(),
                reason: rejection.reason.clone(),
                timestamp: Utc::now(),
            });
        }

        let total_chapters = outcome.manuscript.metadata.total_chapters;
        let total_words = outcome.manuscript.metadata.total_words;
        let rendered = outcome.manuscript.render();
        execution.data.result = Some(CompiledResult {
            manuscript: outcome.manuscript,
            rendered,
        });
        execution.data.progress.current_operation = String::from("Completed");
        execution.transition_to(ExecutionStatus::Completed);
        db::executions::save_execution(&self.db, execution).await?;

        self.event_bus.emit_lossy(ExecutionEvent::ExecutionCompleted {
            execution_id,
            total_chapters,
            total_words,
            timestamp: Utc::now(),
        });
        info!(
            execution_id = %execution_id,
            chapters = total_chapters,
            words = total_words,
            rejected = outcome.rejections.len(),
            "Execution completed"
        );
        Ok(())
    }

    /// Mark the execution cancelled, keeping the checkpoint for resume
    async fn finalize_cancelled(&self, execution: &mut Execution) -> Result<()> {
        let execution_id = execution.execution_id;
        execution.data.progress.current_operation = String::from("Cancelled");
        execution.transition_to(ExecutionStatus::Cancelled);
        db::executions::save_execution(&self.db, execution).await?;
        self.event_bus.emit_lossy(ExecutionEvent::ExecutionCancelled {
            execution_id,
            timestamp: Utc::now(),
        });
        info!(
            execution_id = %execution_id,
            completed_nodes = execution.data.checkpoint.completed_nodes.len(),
            partial_chapters = execution.data.checkpoint.partial_chapters.len(),
            "Execution cancelled, checkpoint retained"
        );
        Ok(())
    }

    fn report_progress(
        &self,
        execution: &mut Execution,
        done: usize,
        total: usize,
        operation: String,
        sink: Option<&ProgressSink>,
    ) {
        execution.update_progress(done, total, operation);
        let percentage = execution.data.progress.percentage;
        self.event_bus.emit_lossy(ExecutionEvent::ExecutionProgress {
            execution_id: execution.execution_id,
            percentage: percentage as f32,
            completed_nodes: done,
            total_nodes: total,
            timestamp: Utc::now(),
        });
        if let Some(sink) = sink {
            sink(percentage);
        }
    }
}

/// Work units a node contributes to overall progress
fn units_of(node: &GraphNode) -> usize {
    match node.kind {
        NodeKind::MultiChapterGeneration => node.chapters.unwrap_or(1).max(1) as usize,
        _ => 1,
    }
}

fn generation_attempts(execution: &Execution, default: u32) -> u32 {
    execution
        .data
        .options
        .generation_attempts
        .unwrap_or(default)
        .max(1)
}

/// Context block assembled from a node's finished dependencies
///
/// Prose dependencies contribute their content verbatim; multi-chapter
/// dependencies contribute chapter titles only, keeping prompts bounded.
fn upstream_context(
    graph: &EngineGraph,
    node: &GraphNode,
    checkpoint: &crate::models::Checkpoint,
) -> String {
    let mut sections = Vec::new();
    for dep_id in graph.dependencies_of(&node.id) {
        let Some(raw) = checkpoint
            .completed_nodes
            .iter()
            .find(|output| output.node_id == dep_id)
        else {
            continue;
        };
        match &raw.output {
            NodeOutput::Process { content } | NodeOutput::AiGeneration { content } => {
                sections.push(format!("## {}\n\n{}", raw.node_label, content));
            }
            NodeOutput::MultiChapterGeneration { chapters } => {
                let titles: Vec<String> = chapters
                    .iter()
                    .enumerate()
                    .map(|(index, chapter)| {
                        format!(
                            "- Chapter {}: {}",
                            chapter.number.unwrap_or(index as u32 + 1),
                            chapter.title
                        )
                    })
                    .collect();
                sections.push(format!("## {}\n\n{}", raw.node_label, titles.join("\n")));
            }
        }
    }
    sections.join("\n\n")
}

fn default_instruction(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::Process => "Produce the supporting material the request calls for.",
        NodeKind::AiGeneration => "Write the requested prose in full.",
        NodeKind::MultiChapterGeneration => "Write the book one chapter at a time.",
        NodeKind::Input | NodeKind::Output => "",
    }
}

/// Assemble the provider prompt for one node
fn node_prompt(node: &GraphNode, upstream: &str, user_input: &str) -> String {
    let instruction = node
        .prompt
        .as_deref()
        .unwrap_or(default_instruction(node.kind));

    let mut prompt = String::from(instruction);
    if !upstream.is_empty() {
        prompt.push_str("\n\n# Material from earlier steps\n\n");
        prompt.push_str(upstream);
    }
    prompt.push_str("\n\n# Request\n\n");
    prompt.push_str(user_input);
    prompt
}

/// Chapter prompt: node prompt plus the binding continuity instructions
fn chapter_prompt(
    node: &GraphNode,
    upstream: &str,
    user_input: &str,
    instructions: &str,
) -> String {
    let mut prompt = node_prompt(node, upstream, user_input);
    prompt.push_str("\n\n");
    prompt.push_str(instructions);
    prompt
}

// ============================================================================
// Tests
// ============================================================================
