//! Manuscript compilation
//!
//! Turns the raw outputs of a finished workflow into a single manuscript
//! through five ordered stages:
//!
//! 1. Extraction: structured chapter sequences are validated element by
//!    element; unstructured prose is set aside for boundary detection
//! 2. Parsing: unstructured prose is split on `Chapter N: Title` headings;
//!    text with no headings becomes one chapter. Structured chapters are
//!    never re-parsed
//! 3. Deduplication: exact and near duplicates are rejected outright,
//!    naming the chapter they collided with. Rejected chapters contribute
//!    nothing; merging is never attempted
//! 4. Integrity repair: chapters are ordered by claimed number, then
//!    renumbered densely from 1 so collisions and dedup gaps both disappear;
//!    short chapters are padded with an explicit placeholder, empty titles
//!    default to `Chapter N`
//! 5. Assembly: title page, optional table of contents, chapter bodies and
//!    an aggregate metadata block
//!
//! The engine holds no state between calls; every `compile` starts with a
//! fresh duplicate registry.

use crate::models::{Chapter, Manuscript, ManuscriptMetadata, TocEntry};
use crate::services::dedup::{self, DedupRegistry, DedupVerdict};
use crate::types::{
    CompileOptions, ContentType, NodeOutput, RawNodeOutput, ValidationOptions,
};
use crate::validators::ResponseValidator;
use serde_json::json;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// A chapter the compiler refused, with the reason it was refused
#[derive(Debug, Clone)]
pub struct ChapterRejection {
    pub title: String,
    pub reason: String,
}

/// Compiled manuscript plus everything that was turned away on the way
#[derive(Debug, Clone)]
pub struct CompileOutcome {
    pub manuscript: Manuscript,
    pub rejections: Vec<ChapterRejection>,
}

/// One chapter candidate moving through the pipeline
struct Candidate {
    number: Option<u32>,
    title: String,
    content: String,
    source: String,
}

/// Five-stage manuscript compiler
pub struct CompilationEngine {
    options: CompileOptions,
    validator: ResponseValidator,
}

impl CompilationEngine {
    pub fn new(options: CompileOptions, validation: ValidationOptions) -> Self {
        Self {
            options,
            validator: ResponseValidator::with_options(validation),
        }
    }

    /// Compile node outputs into a manuscript
    ///
    /// `outputs` arrive in node completion order; `user_input` supplies the
    /// fallback title when the caller configured none.
    pub fn compile(&self, outputs: &[RawNodeOutput], user_input: &str) -> CompileOutcome {
        let mut rejections = Vec::new();
        let mut sources = BTreeSet::new();

        // Stages 1 and 2: collect candidates
        let candidates = self.extract_candidates(outputs, &mut rejections, &mut sources);

        // Stage 3: deduplication
        let mut accepted = Vec::new();
        let mut registry = DedupRegistry::from_options(&self.options);
        for candidate in candidates {
            match registry.admit(&candidate.title, &candidate.content) {
                DedupVerdict::Unique => accepted.push(candidate),
                DedupVerdict::ExactDuplicate {
                    original_index,
                    original_title,
                } => {
                    let original = display_title(&original_title, original_index);
                    warn!(
                        rejected = %candidate.title,
                        original = %original,
                        "Rejected chapter: exact duplicate"
                    );
                    rejections.push(ChapterRejection {
                        title: candidate.title,
                        reason: format!("exact duplicate of accepted chapter {}", original),
                    });
                }
                DedupVerdict::NearDuplicate {
                    original_index,
                    original_title,
                    similarity,
                } => {
                    let original = display_title(&original_title, original_index);
                    warn!(
                        rejected = %candidate.title,
                        original = %original,
                        similarity = format!("{:.2}", similarity),
                        "Rejected chapter: near duplicate"
                    );
                    rejections.push(ChapterRejection {
                        title: candidate.title,
                        reason: format!(
                            "{:.0}% similar to accepted chapter {}",
                            similarity * 100.0,
                            original
                        ),
                    });
                }
            }
        }

        // Stage 4: integrity repair
        let chapters = self.repair(accepted, &mut sources);

        // Stage 5: assembly
        let manuscript = self.assemble(chapters, user_input, sources);

        info!(
            chapters = manuscript.metadata.total_chapters,
            words = manuscript.metadata.total_words,
            rejected = rejections.len(),
            "Manuscript compiled"
        );

        CompileOutcome {
            manuscript,
            rejections,
        }
    }

    /// Stages 1 and 2: pull chapter candidates out of every node output
    fn extract_candidates(
        &self,
        outputs: &[RawNodeOutput],
        rejections: &mut Vec<ChapterRejection>,
        sources: &mut BTreeSet<String>,
    ) -> Vec<Candidate> {
        let mut candidates = Vec::new();

        for raw in outputs {
            let source = if raw.node_label.is_empty() {
                raw.node_id.clone()
            } else {
                raw.node_label.clone()
            };

            match &raw.output {
                NodeOutput::MultiChapterGeneration { chapters } => {
                    // Structured chapters keep their own number and title;
                    // each element is validated on its own
                    for draft in chapters {
                        let result = self
                            .validator
                            .validate(&json!(draft.content.clone()), ContentType::Chapter);
                        if result.is_valid {
                            candidates.push(Candidate {
                                number: draft.number,
                                title: draft.title.clone(),
                                content: draft.content.clone(),
                                source: source.clone(),
                            });
                        } else {
                            let reason = result
                                .first_critical()
                                .map(|issue| issue.message.clone())
                                .unwrap_or_else(|| "failed validation".to_string());
                            warn!(
                                node = %source,
                                title = %draft.title,
                                reason = %reason,
                                "Dropped structured chapter during extraction"
                            );
                            rejections.push(ChapterRejection {
                                title: draft.title.clone(),
                                reason,
                            });
                        }
                    }
                }
                NodeOutput::AiGeneration { content } => {
                    for (number, title, body) in parse_chapters(content) {
                        candidates.push(Candidate {
                            number,
                            title,
                            content: body,
                            source: source.clone(),
                        });
                    }
                }
                NodeOutput::Process { content } => {
                    // Context only: process output never becomes a chapter
                    debug!(node = %source, chars = content.len(), "Process node noted as source");
                    sources.insert(source.clone());
                }
            }
        }

        candidates
    }

    /// Stage 4: order, renumber, pad, title
    ///
    /// Final numbers are always a dense 1..N run: a chapter claiming number 4
    /// after number 3 was rejected as a duplicate comes out as chapter 3.
    fn repair(&self, mut accepted: Vec<Candidate>, sources: &mut BTreeSet<String>) -> Vec<Chapter> {
        // Stable sort keeps arrival order within equal numbers; unnumbered
        // candidates sort last
        accepted.sort_by_key(|c| c.number.unwrap_or(u32::MAX));

        let mut chapters = Vec::with_capacity(accepted.len());
        for (index, candidate) in accepted.into_iter().enumerate() {
            let number = index as u32 + 1;

            let mut content = candidate.content.trim().to_string();
            let mut word_count = content.split_whitespace().count();
            if word_count < self.options.min_chapter_words {
                debug!(
                    number,
                    word_count, "Padding short chapter with placeholder"
                );
                content.push_str("\n\n[This chapter is awaiting additional content.]");
                word_count = content.split_whitespace().count();
            }

            let title = if candidate.title.trim().is_empty() {
                format!("Chapter {}", number)
            } else {
                candidate.title.trim().to_string()
            };

            sources.insert(candidate.source.clone());
            chapters.push(Chapter {
                number,
                title,
                content_hash: dedup::content_hash(&content),
                word_count,
                content,
                sources: BTreeSet::from([candidate.source]),
            });
        }
        chapters
    }

    /// Stage 5: title page, contents, metadata block
    fn assemble(
        &self,
        chapters: Vec<Chapter>,
        user_input: &str,
        sources: BTreeSet<String>,
    ) -> Manuscript {
        let title = self
            .options
            .title
            .clone()
            .unwrap_or_else(|| derive_title(user_input));
        let author = self
            .options
            .author
            .clone()
            .unwrap_or_else(|| "Anonymous".to_string());

        let toc = if self.options.include_toc {
            Some(
                chapters
                    .iter()
                    .map(|c| TocEntry {
                        number: c.number,
                        title: c.title.clone(),
                    })
                    .collect(),
            )
        } else {
            None
        };

        let total_words: usize = chapters.iter().map(|c| c.word_count).sum();
        let wpm = self.options.reading_wpm.max(1);
        let metadata = ManuscriptMetadata {
            total_words,
            total_chapters: chapters.len(),
            estimated_reading_time_minutes: total_words.div_ceil(wpm),
            content_sources: sources,
        };

        Manuscript {
            title,
            author,
            toc,
            chapters,
            metadata,
        }
    }
}

fn display_title(title: &str, index: usize) -> String {
    if title.trim().is_empty() {
        format!("#{}", index + 1)
    } else {
        format!("\"{}\"", title.trim())
    }
}

/// Title fallback: first non-empty line of the premise, clipped at a word
/// boundary
fn derive_title(user_input: &str) -> String {
    let line = user_input
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    if line.is_empty() {
        return "Untitled Manuscript".to_string();
    }
    if line.chars().count() <= 80 {
        return line.to_string();
    }
    let clipped: String = line.chars().take(80).collect();
    match clipped.rfind(' ') {
        Some(cut) => format!("{}...", &clipped[..cut]),
        None => clipped,
    }
}

/// Stage 2 boundary detection over unstructured prose
///
/// Returns `(claimed number, title, body)` per detected chapter. Text with
/// no headings at all is one untitled chapter. A short preamble before the
/// first heading is generator filler and is dropped; a long one is kept as
/// an untitled chapter so real content is not lost.
fn parse_chapters(text: &str) -> Vec<(Option<u32>, String, String)> {
    let mut found: Vec<(Option<u32>, String, Vec<&str>)> = Vec::new();
    let mut preamble: Vec<&str> = Vec::new();

    for line in text.lines() {
        if let Some((number, title)) = parse_heading(line) {
            found.push((Some(number), title, Vec::new()));
        } else {
            match found.last_mut() {
                Some((_, _, body)) => body.push(line),
                None => preamble.push(line),
            }
        }
    }

    if found.is_empty() {
        let body = text.trim();
        if body.is_empty() {
            return Vec::new();
        }
        return vec![(None, String::new(), body.to_string())];
    }

    let mut chapters = Vec::with_capacity(found.len() + 1);
    let lead = preamble.join("\n").trim().to_string();
    if lead.len() >= 200 {
        chapters.push((None, String::new(), lead));
    } else if !lead.is_empty() {
        debug!(chars = lead.len(), "Dropped short preamble before first chapter heading");
    }

    for (number, title, body) in found {
        chapters.push((number, title, body.join("\n").trim().to_string()));
    }
    chapters
}

/// Matches `Chapter N`, `Chapter N: Title`, and markdown-prefixed variants
///
/// After the number the line must end or continue with a separator, so prose
/// that merely begins with the word chapter is not treated as a heading.
fn parse_heading(line: &str) -> Option<(u32, String)> {
    let trimmed = line.trim().trim_start_matches('#').trim_start();
    let keyword = trimmed.get(..7)?;
    if !keyword.eq_ignore_ascii_case("chapter") {
        return None;
    }

    let rest = trimmed[7..].trim_start();
    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let number: u32 = rest[..digits].parse().ok()?;

    let tail = rest[digits..].trim_start();
    if tail.is_empty() {
        return Some((number, String::new()));
    }
    let title = tail.strip_prefix([':', '.', '-'])?.trim().to_string();
    Some((number, title))
}

// ============================================================================
// Tests
// ============================================================================
