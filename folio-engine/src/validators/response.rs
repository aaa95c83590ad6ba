//! Response validation decision procedure
//!
//! Pure transformation: raw provider response in, `ValidationResult` out.
//! Structural failures (null response, empty extraction) short-circuit;
//! content checks then run in order and accumulate issues. A response is
//! valid exactly when no critical issue was found.
//!
//! # Chapter checks
//! 1. Minimum word and non-whitespace character floors
//! 2. Minimum extractable sentences (split on `.!?`, fragments over 10
//!    chars count)
//! 3. Repetition analysis over 5-word sliding windows; any window occurring
//!    more often than the threshold is critical, and the worst offender is
//!    reported
//! 4. Error-message detection, applied only to short responses so long
//!    legitimate prose mentioning "sorry" is not rejected
//! 5. Paragraph structure (warning only)
//!
//! There is deliberately no upper length cap: chapter length is allowed to
//! vary, only insufficiency and degeneracy are rejected.

use crate::types::{
    ContentType, ErrorIndicatorDetector, IssueCode, ValidationIssue, ValidationOptions,
    ValidationResult,
};
use crate::validators::outline;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::debug;

/// Keyword-list error detector
///
/// Scores nothing; the first matching indicator wins. Swappable for a
/// model-based detector through the `ErrorIndicatorDetector` trait.
pub struct KeywordErrorDetector {
    indicators: Vec<&'static str>,
}

impl KeywordErrorDetector {
    pub fn new() -> Self {
        Self {
            indicators: vec![
                "sorry",
                "i cannot",
                "i can't",
                "cannot",
                "unable to",
                "rate limit",
                "api key",
                "as an ai",
                "quota exceeded",
                "try again later",
                "error:",
                "failed to generate",
            ],
        }
    }
}

impl Default for KeywordErrorDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorIndicatorDetector for KeywordErrorDetector {
    fn name(&self) -> &'static str {
        "KeywordErrorDetector"
    }

    fn detect(&self, text: &str) -> Option<String> {
        let lowered = text.to_lowercase();
        self.indicators
            .iter()
            .find(|indicator| lowered.contains(*indicator))
            .map(|indicator| indicator.to_string())
    }
}

/// Validates raw AI responses before they enter the pipeline
pub struct ResponseValidator {
    options: ValidationOptions,
    error_detector: Box<dyn ErrorIndicatorDetector>,
}

impl ResponseValidator {
    /// Create a validator with default thresholds and the keyword detector
    pub fn new() -> Self {
        Self {
            options: ValidationOptions::default(),
            error_detector: Box::new(KeywordErrorDetector::new()),
        }
    }

    /// Create a validator with custom thresholds
    pub fn with_options(options: ValidationOptions) -> Self {
        Self {
            options,
            error_detector: Box::new(KeywordErrorDetector::new()),
        }
    }

    /// Replace the error detector
    pub fn with_error_detector(mut self, detector: Box<dyn ErrorIndicatorDetector>) -> Self {
        self.error_detector = detector;
        self
    }

    /// Validate a raw provider response
    pub fn validate(&self, raw: &Value, content_type: ContentType) -> ValidationResult {
        // Step 1: null/empty response
        if is_null_response(raw) {
            return invalid(
                ValidationIssue::critical(IssueCode::NullResponse, "response was null or empty"),
            );
        }

        // Step 2: unwrap the provider envelope
        let extracted = match extract_content(raw) {
            Some(content) if !content.trim().is_empty() => content,
            _ => {
                return invalid(ValidationIssue::critical(
                    IssueCode::NoContent,
                    "no usable content found in response envelope",
                ))
            }
        };

        // Step 3: content-type-specific checks
        let (issues, metadata, cleaned) = match content_type {
            ContentType::Chapter => {
                let (issues, metadata) = self.check_chapter(&extracted);
                (issues, metadata, extracted)
            }
            ContentType::Outline => {
                let (issues, metadata, recovered) = self.check_outline(&extracted);
                (issues, metadata, recovered.unwrap_or(extracted))
            }
        };

        let is_valid = !issues
            .iter()
            .any(|issue| issue.severity == crate::types::Severity::Critical);
        let warnings = issues
            .iter()
            .filter(|issue| issue.severity == crate::types::Severity::Warning)
            .map(|issue| issue.message.clone())
            .collect();

        debug!(
            valid = is_valid,
            issue_count = issues.len(),
            content_type = ?content_type,
            "Response validation complete"
        );

        ValidationResult {
            is_valid,
            extracted_content: Some(cleaned),
            errors: issues,
            warnings,
            metadata,
        }
    }

    fn check_chapter(&self, content: &str) -> (Vec<ValidationIssue>, Value) {
        let mut issues = Vec::new();

        let word_count = content.split_whitespace().count();
        let char_count = content.chars().filter(|c| !c.is_whitespace()).count();
        if word_count < self.options.min_words || char_count < self.options.min_chars {
            issues.push(ValidationIssue::critical(
                IssueCode::InsufficientLength,
                format!(
                    "content has {} words / {} characters, minimum is {} words / {} characters",
                    word_count, char_count, self.options.min_words, self.options.min_chars
                ),
            ));
        }

        let sentence_count = count_sentences(content);
        if sentence_count < self.options.min_sentences {
            issues.push(ValidationIssue::critical(
                IssueCode::InsufficientSentences,
                format!(
                    "found {} sentences, minimum is {}",
                    sentence_count, self.options.min_sentences
                ),
            ));
        }

        let worst_window = worst_repeated_window(content, self.options.repetition_window);
        if let Some((window, count)) = &worst_window {
            if *count > self.options.repetition_threshold {
                issues.push(ValidationIssue::critical(
                    IssueCode::ExcessiveRepetition,
                    format!(
                        "the phrase \"{}\" occurs {} times (threshold {})",
                        window, count, self.options.repetition_threshold
                    ),
                ));
            }
        }

        // Short responses that read like provider errors are rejected;
        // long prose is exempt to avoid false positives
        if char_count < self.options.error_scan_max_chars {
            if let Some(indicator) = self.error_detector.detect(content) {
                issues.push(ValidationIssue::critical(
                    IssueCode::ErrorResponse,
                    format!("short response contains error indicator \"{}\"", indicator),
                ));
            }
        }

        let paragraph_count = content
            .split("\n\n")
            .filter(|p| p.trim().len() > self.options.min_paragraph_chars)
            .count();
        if paragraph_count < self.options.min_paragraphs {
            issues.push(ValidationIssue::warning(
                IssueCode::SparseParagraphs,
                format!(
                    "only {} substantial paragraphs, expected at least {}",
                    paragraph_count, self.options.min_paragraphs
                ),
            ));
        }

        let metadata = json!({
            "word_count": word_count,
            "char_count": char_count,
            "sentence_count": sentence_count,
            "paragraph_count": paragraph_count,
            "worst_window": worst_window.map(|(window, count)| json!({
                "text": window,
                "count": count,
            })),
        });

        (issues, metadata)
    }

    fn check_outline(&self, content: &str) -> (Vec<ValidationIssue>, Value, Option<String>) {
        let mut issues = Vec::new();

        let recovered = match outline::recover_json(content) {
            Some(recovered) => recovered,
            None => {
                issues.push(ValidationIssue::critical(
                    IssueCode::MalformedOutline,
                    "outline could not be parsed or recovered as JSON",
                ));
                return (issues, json!({ "recovered_via": Value::Null }), None);
            }
        };

        let object = recovered.value.as_object();
        let has_title = object.map(|o| o.contains_key("title")).unwrap_or(false);
        let chapters = object.and_then(|o| o.get("chapters"));

        if !has_title && chapters.is_none() {
            issues.push(ValidationIssue::critical(
                IssueCode::MissingOutlineFields,
                "outline carries neither a title nor chapters",
            ));
        }

        if let Some(chapters) = chapters {
            match chapters.as_array() {
                Some(list) if list.is_empty() => {
                    issues.push(ValidationIssue::critical(
                        IssueCode::EmptyChapters,
                        "outline chapters list is empty",
                    ));
                }
                Some(_) => {}
                None => {
                    issues.push(ValidationIssue::critical(
                        IssueCode::MalformedOutline,
                        "outline chapters field is not a list",
                    ));
                }
            }
        }

        let metadata = json!({ "recovered_via": recovered.method });
        let canonical = serde_json::to_string(&recovered.value).ok();
        (issues, metadata, canonical)
    }
}

impl Default for ResponseValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn is_null_response(raw: &Value) -> bool {
    match raw {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Unwrap the known provider envelopes into a single string
///
/// Handles: bare strings, `{content}`, `{text}`, chat-completion
/// `{choices:[{message:{content}}]}`, arrays of content blocks, and
/// stringified JSON nesting any of the above.
fn extract_content(raw: &Value) -> Option<String> {
    match raw {
        Value::String(s) => {
            let trimmed = s.trim();
            // Stringified JSON envelopes come back from some providers
            if (trimmed.starts_with('{') && trimmed.ends_with('}'))
                || (trimmed.starts_with('[') && trimmed.ends_with(']'))
            {
                if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
                    if let Some(inner) = extract_content(&parsed) {
                        return Some(inner);
                    }
                }
            }
            Some(s.clone())
        }
        Value::Object(map) => {
            if let Some(content) = map.get("content") {
                return extract_content(content);
            }
            if let Some(choices) = map.get("choices").and_then(|c| c.as_array()) {
                if let Some(first) = choices.first() {
                    if let Some(message) = first.get("message") {
                        return extract_content(message);
                    }
                    return extract_content(first);
                }
            }
            if let Some(text) = map.get("text") {
                return extract_content(text);
            }
            None
        }
        Value::Array(items) => {
            let blocks: Vec<String> = items.iter().filter_map(extract_content).collect();
            if blocks.is_empty() {
                None
            } else {
                Some(blocks.join("\n\n"))
            }
        }
        _ => None,
    }
}

/// Sentences are fragments between `.`, `!`, `?` longer than 10 chars
fn count_sentences(content: &str) -> usize {
    content
        .split(['.', '!', '?'])
        .filter(|fragment| fragment.trim().len() > 10)
        .count()
}

/// Most frequent sliding word window and its occurrence count
fn worst_repeated_window(content: &str, window: usize) -> Option<(String, usize)> {
    let words: Vec<String> = content
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect();
    if words.len() < window {
        return None;
    }

    let mut counts: HashMap<String, usize> = HashMap::new();
    for slice in words.windows(window) {
        *counts.entry(slice.join(" ")).or_insert(0) += 1;
    }

    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
}

fn invalid(issue: ValidationIssue) -> ValidationResult {
    ValidationResult {
        is_valid: false,
        extracted_content: None,
        errors: vec![issue],
        warnings: Vec::new(),
        metadata: json!({}),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;

    fn valid_chapter_text() -> String {
        let mut paragraphs = Vec::new();
        for i in 0..3 {
            paragraphs.push(format!(
                "Paragraph {} follows the lighthouse keeper through a long watch. \
                 She counted the ships as they passed the headland in the dark. \
                 Every lamp she trimmed burned a little differently than the last one did.",
                i + 1
            ));
        }
        paragraphs.join("\n\n")
    }

    fn first_code(result: &ValidationResult) -> Option<IssueCode> {
        result.first_critical().map(|issue| issue.code)
    }

    #[test]
    fn test_valid_chapter_passes() {
        let validator = ResponseValidator::new();
        let result = validator.validate(&json!(valid_chapter_text()), ContentType::Chapter);
        assert!(result.is_valid, "unexpected issues: {:?}", result.errors);
        assert!(result.extracted_content.is_some());
    }

    #[test]
    fn test_null_response_is_critical() {
        let validator = ResponseValidator::new();
        let result = validator.validate(&Value::Null, ContentType::Chapter);
        assert!(!result.is_valid);
        assert_eq!(first_code(&result), Some(IssueCode::NullResponse));

        let result = validator.validate(&json!("   "), ContentType::Chapter);
        assert_eq!(first_code(&result), Some(IssueCode::NullResponse));
    }

    #[test]
    fn test_short_response_is_insufficient_length() {
        let validator = ResponseValidator::new();
        let result = validator.validate(
            &json!("A very short reply that ends here."),
            ContentType::Chapter,
        );
        assert!(!result.is_valid);
        assert!(result
            .errors
            .iter()
            .any(|issue| issue.code == IssueCode::InsufficientLength
                && issue.severity == Severity::Critical));
    }

    #[test]
    fn test_envelope_extraction_variants() {
        let validator = ResponseValidator::new();
        let text = valid_chapter_text();

        let wrapped = json!({ "content": text });
        assert!(validator.validate(&wrapped, ContentType::Chapter).is_valid);

        let chat = json!({ "choices": [{ "message": { "content": text } }] });
        assert!(validator.validate(&chat, ContentType::Chapter).is_valid);

        let blocks = json!([{ "text": text }]);
        assert!(validator.validate(&blocks, ContentType::Chapter).is_valid);

        let stringified = json!(serde_json::to_string(&json!({ "content": text })).unwrap());
        assert!(validator
            .validate(&stringified, ContentType::Chapter)
            .is_valid);
    }

    #[test]
    fn test_object_without_content_is_no_content() {
        let validator = ResponseValidator::new();
        let result = validator.validate(&json!({ "usage": { "tokens": 10 } }), ContentType::Chapter);
        assert!(!result.is_valid);
        assert_eq!(first_code(&result), Some(IssueCode::NoContent));
    }

    #[test]
    fn test_too_few_sentences_is_critical() {
        let validator = ResponseValidator::new();
        // Plenty of words, but one giant run-on with no terminators
        let text = "word ".repeat(80);
        let result = validator.validate(&json!(text), ContentType::Chapter);
        assert!(result
            .errors
            .iter()
            .any(|issue| issue.code == IssueCode::InsufficientSentences));
    }

    #[test]
    fn test_excessive_repetition_reports_worst_window() {
        let validator = ResponseValidator::new();
        let phrase = "the mist rolled over town. ";
        let mut text = valid_chapter_text();
        text.push_str("\n\n");
        text.push_str(&phrase.repeat(7));
        let result = validator.validate(&json!(text), ContentType::Chapter);
        assert!(!result.is_valid);
        let issue = result
            .errors
            .iter()
            .find(|issue| issue.code == IssueCode::ExcessiveRepetition)
            .expect("repetition issue");
        assert!(issue.message.contains("occurs"));
        assert!(result.metadata["worst_window"]["count"].as_u64().unwrap() > 5);
    }

    #[test]
    fn test_five_repeats_are_allowed() {
        let validator = ResponseValidator::new();
        let phrase = "the mist rolled over town. ";
        let mut text = valid_chapter_text();
        text.push_str("\n\n");
        // Exactly at the threshold; windows occur 5 times, not more
        text.push_str(&phrase.repeat(5));
        let result = validator.validate(&json!(text), ContentType::Chapter);
        assert!(
            !result
                .errors
                .iter()
                .any(|issue| issue.code == IssueCode::ExcessiveRepetition),
            "threshold repeats must pass: {:?}",
            result.errors
        );
    }

    #[test]
    fn test_short_error_message_is_rejected() {
        let validator = ResponseValidator::new();
        let result = validator.validate(
            &json!("I'm sorry, I cannot generate that chapter right now."),
            ContentType::Chapter,
        );
        assert!(result
            .errors
            .iter()
            .any(|issue| issue.code == IssueCode::ErrorResponse));
    }

    #[test]
    fn test_long_prose_mentioning_sorry_is_not_an_error() {
        let validator = ResponseValidator::new();
        let mut text = valid_chapter_text();
        text.push_str("\n\n\"Sorry,\" she said, and meant it, which surprised them both entirely.");
        let result = validator.validate(&json!(text), ContentType::Chapter);
        assert!(
            !result
                .errors
                .iter()
                .any(|issue| issue.code == IssueCode::ErrorResponse),
            "long prose must be exempt from keyword detection"
        );
    }

    #[test]
    fn test_single_paragraph_only_warns() {
        let validator = ResponseValidator::new();
        let text = valid_chapter_text().replace("\n\n", " ");
        let result = validator.validate(&json!(text), ContentType::Chapter);
        assert!(result.is_valid, "warnings must not invalidate");
        assert!(result
            .errors
            .iter()
            .any(|issue| issue.code == IssueCode::SparseParagraphs
                && issue.severity == Severity::Warning));
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn test_outline_direct_json() {
        let validator = ResponseValidator::new();
        let outline = json!({ "title": "The Lane", "chapters": [{ "title": "One" }] });
        let result = validator.validate(&json!(outline.to_string()), ContentType::Outline);
        assert!(result.is_valid, "issues: {:?}", result.errors);
        assert_eq!(result.metadata["recovered_via"], "direct");
    }

    #[test]
    fn test_outline_empty_chapters_rejected() {
        let validator = ResponseValidator::new();
        let outline = json!({ "title": "The Lane", "chapters": [] });
        let result = validator.validate(&json!(outline.to_string()), ContentType::Outline);
        assert!(!result.is_valid);
        assert_eq!(first_code(&result), Some(IssueCode::EmptyChapters));
    }

    #[test]
    fn test_outline_prose_is_malformed() {
        let validator = ResponseValidator::new();
        let result = validator.validate(
            &json!("Here is a lovely outline with no JSON in it at all."),
            ContentType::Outline,
        );
        assert!(!result.is_valid);
        assert_eq!(first_code(&result), Some(IssueCode::MalformedOutline));
    }

    #[test]
    fn test_custom_thresholds_are_honored() {
        let mut options = ValidationOptions::default();
        options.min_words = 5;
        options.min_chars = 10;
        options.min_sentences = 1;
        let validator = ResponseValidator::with_options(options);
        let result = validator.validate(
            &json!("Five words are quite enough here to pass muster."),
            ContentType::Chapter,
        );
        assert!(result.is_valid, "issues: {:?}", result.errors);
    }
}
