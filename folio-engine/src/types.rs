//! Core Types and Trait Definitions for the Folio pipeline
//!
//! Defines the shared vocabulary used across the pipeline tiers:
//! - Node outputs (what workflow nodes hand to the compiler)
//! - Validation results (what the response validator produces)
//! - Tunable options for validation and compilation
//! - Pluggable classifier traits for the continuity heuristics

use serde::{Deserialize, Serialize};

// ============================================================================
// Node Outputs
// ============================================================================

/// Output produced by one workflow node
///
/// The variant determines how the compiler treats the payload: generation
/// variants contribute manuscript text, `Process` contributes context only.
/// Matching is exhaustive so a new variant cannot be silently ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeOutput {
    /// Single block of generated prose; chapter boundaries unknown
    AiGeneration { content: String },
    /// Generation that already produced discrete chapters
    MultiChapterGeneration { chapters: Vec<ChapterDraft> },
    /// Non-generative node output (user input, research notes, outlines)
    Process { content: String },
}

/// One chapter as produced by a generation node, before compilation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChapterDraft {
    /// Chapter number claimed by the generator; repaired later if colliding
    pub number: Option<u32>,
    pub title: String,
    pub content: String,
}

/// Output of one node paired with its origin, consumed once by the compiler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawNodeOutput {
    pub node_id: String,
    pub node_label: String,
    pub output: NodeOutput,
}

// ============================================================================
// Validation
// ============================================================================

/// Issue severity; only critical issues make a response invalid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
}

/// Machine-readable validation issue codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    /// Response was null, empty, or whitespace-only
    NullResponse,
    /// Envelope unwrapping produced no usable text
    NoContent,
    /// Below the minimum word or character floor
    InsufficientLength,
    /// Too few complete sentences
    InsufficientSentences,
    /// A sliding word window repeats past the allowed count
    ExcessiveRepetition,
    /// Short response that reads like a provider error message
    ErrorResponse,
    /// Too few substantial paragraphs (warning only)
    SparseParagraphs,
    /// Outline could not be parsed or recovered as JSON
    MalformedOutline,
    /// Outline parsed but carries neither title nor chapters
    MissingOutlineFields,
    /// Outline chapters field present but empty
    EmptyChapters,
}

impl IssueCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCode::NullResponse => "NULL_RESPONSE",
            IssueCode::NoContent => "NO_CONTENT",
            IssueCode::InsufficientLength => "INSUFFICIENT_LENGTH",
            IssueCode::InsufficientSentences => "INSUFFICIENT_SENTENCES",
            IssueCode::ExcessiveRepetition => "EXCESSIVE_REPETITION",
            IssueCode::ErrorResponse => "ERROR_RESPONSE",
            IssueCode::SparseParagraphs => "SPARSE_PARAGRAPHS",
            IssueCode::MalformedOutline => "MALFORMED_OUTLINE",
            IssueCode::MissingOutlineFields => "MISSING_OUTLINE_FIELDS",
            IssueCode::EmptyChapters => "EMPTY_CHAPTERS",
        }
    }
}

impl std::fmt::Display for IssueCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One validation finding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: IssueCode,
    pub message: String,
    pub severity: Severity,
}

impl ValidationIssue {
    pub fn critical(code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            severity: Severity::Critical,
        }
    }

    pub fn warning(code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            severity: Severity::Warning,
        }
    }
}

/// Immutable result of one validation call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    /// True when no critical issue was found
    pub is_valid: bool,
    /// Text unwrapped from the provider envelope, when extraction succeeded
    pub extracted_content: Option<String>,
    /// All findings in detection order, critical and warning alike
    pub errors: Vec<ValidationIssue>,
    /// Warning messages repeated as plain strings for quick display
    pub warnings: Vec<String>,
    /// Measured characteristics (word count, sentence count, worst window)
    pub metadata: serde_json::Value,
}

impl ValidationResult {
    /// First critical issue, if any; used for retry diagnostics
    pub fn first_critical(&self) -> Option<&ValidationIssue> {
        self.errors
            .iter()
            .find(|issue| issue.severity == Severity::Critical)
    }
}

/// What the validator expects the response to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Chapter,
    Outline,
}

// ============================================================================
// Tunable Options
// ============================================================================

/// Thresholds for chapter response validation
///
/// The repetition and length floors are empirically chosen; they are carried
/// as options rather than constants so deployments can tune them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOptions {
    /// Minimum words for a chapter to count as real content
    pub min_words: usize,
    /// Minimum non-whitespace characters
    pub min_chars: usize,
    /// Minimum extractable sentences (fragments over 10 chars)
    pub min_sentences: usize,
    /// Sliding window size in words for repetition analysis
    pub repetition_window: usize,
    /// A window repeating more than this many times is critical
    pub repetition_threshold: usize,
    /// Error-keyword detection only applies below this length
    pub error_scan_max_chars: usize,
    /// Fewer substantial paragraphs than this draws a warning
    pub min_paragraphs: usize,
    /// A paragraph shorter than this does not count as substantial
    pub min_paragraph_chars: usize,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            min_words: 50,
            min_chars: 100,
            min_sentences: 3,
            repetition_window: 5,
            repetition_threshold: 5,
            error_scan_max_chars: 200,
            min_paragraphs: 2,
            min_paragraph_chars: 50,
        }
    }
}

/// Thresholds and format settings for manuscript compilation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileOptions {
    /// Word-level Jaccard similarity above which a chapter is a duplicate
    pub similarity_threshold: f64,
    /// Words of this length or shorter are ignored by the similarity measure
    pub similarity_min_word_len: usize,
    /// Chapters below this word count get a placeholder pad
    pub min_chapter_words: usize,
    /// Reading speed used for the estimated reading time
    pub reading_wpm: usize,
    pub include_toc: bool,
    pub title: Option<String>,
    pub author: Option<String>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            similarity_min_word_len: 3,
            min_chapter_words: 50,
            reading_wpm: 200,
            include_toc: true,
            title: None,
            author: None,
        }
    }
}

// ============================================================================
// Classifier Traits
// ============================================================================

/// Broad world classification driving continuity constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoryWorldType {
    Fantasy,
    Realistic,
}

impl std::fmt::Display for StoryWorldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoryWorldType::Fantasy => write!(f, "fantasy"),
            StoryWorldType::Realistic => write!(f, "realistic"),
        }
    }
}

/// Structural genre class selecting the narrative structure table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenreClass {
    Fiction,
    NonFiction,
}

/// Classifies prose as fantasy or realistic
///
/// The default implementation scores keyword presence; the trait exists so a
/// model-based classifier can replace it without touching the pipeline.
pub trait WorldTypeClassifier: Send + Sync {
    /// Classifier name for provenance tracking
    fn name(&self) -> &'static str;

    fn classify(&self, text: &str) -> StoryWorldType;
}

/// Maps a declared genre to the structure-table class
pub trait GenreClassifier: Send + Sync {
    /// Classifier name for provenance tracking
    fn name(&self) -> &'static str;

    fn classify(&self, genre: &str) -> GenreClass;
}

/// Detects the dominant tone of accepted prose
pub trait ToneClassifier: Send + Sync {
    /// Classifier name for provenance tracking
    fn name(&self) -> &'static str;

    fn classify(&self, text: &str) -> String;
}

/// Recognizes provider error messages masquerading as content
pub trait ErrorIndicatorDetector: Send + Sync {
    /// Detector name for provenance tracking
    fn name(&self) -> &'static str;

    /// The matched indicator when the text reads like an error message
    fn detect(&self, text: &str) -> Option<String>;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_code_wire_format() {
        assert_eq!(IssueCode::InsufficientLength.as_str(), "INSUFFICIENT_LENGTH");
        let json = serde_json::to_value(IssueCode::NullResponse).unwrap();
        assert_eq!(json, "NULL_RESPONSE");
    }

    #[test]
    fn test_node_output_tagged_serialization() {
        let output = NodeOutput::MultiChapterGeneration {
            chapters: vec![ChapterDraft {
                number: Some(1),
                title: "Beginnings".to_string(),
                content: "Once there was a door.".to_string(),
            }],
        };
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["kind"], "multi_chapter_generation");
        assert_eq!(json["chapters"][0]["title"], "Beginnings");
    }

    #[test]
    fn test_first_critical_skips_warnings() {
        let result = ValidationResult {
            is_valid: false,
            extracted_content: None,
            errors: vec![
                ValidationIssue::warning(IssueCode::SparseParagraphs, "thin structure"),
                ValidationIssue::critical(IssueCode::InsufficientLength, "too short"),
            ],
            warnings: vec!["thin structure".to_string()],
            metadata: serde_json::json!({}),
        };
        assert_eq!(
            result.first_critical().map(|i| i.code),
            Some(IssueCode::InsufficientLength)
        );
    }

    #[test]
    fn test_default_thresholds() {
        let opts = ValidationOptions::default();
        assert_eq!(opts.min_words, 50);
        assert_eq!(opts.repetition_window, 5);
        let compile = CompileOptions::default();
        assert!((compile.similarity_threshold - 0.85).abs() < f64::EPSILON);
    }
}
