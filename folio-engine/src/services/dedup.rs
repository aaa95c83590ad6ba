//! Chapter deduplication
//!
//! Detects both exact duplicates (SHA-256 over normalized text) and
//! near-duplicates (word-level Jaccard similarity). The registry lives for
//! one compilation only; there is no shared state between compilations.
//!
//! The invariant is reject-only: a duplicate chapter contributes nothing to
//! the manuscript. Merging near-duplicates is never attempted.

use crate::types::CompileOptions;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Outcome of checking one candidate chapter against the registry
#[derive(Debug, Clone, PartialEq)]
pub enum DedupVerdict {
    /// No collision, chapter was admitted
    Unique,
    /// Normalized text is byte-identical to an admitted chapter
    ExactDuplicate {
        original_index: usize,
        original_title: String,
    },
    /// Word overlap with an admitted chapter exceeds the threshold
    NearDuplicate {
        original_index: usize,
        original_title: String,
        similarity: f64,
    },
}

struct AdmittedChapter {
    hash: String,
    words: HashSet<String>,
    title: String,
}

/// Per-compilation duplicate registry
pub struct DedupRegistry {
    threshold: f64,
    min_word_len: usize,
    admitted: Vec<AdmittedChapter>,
}

impl DedupRegistry {
    pub fn new(threshold: f64, min_word_len: usize) -> Self {
        Self {
            threshold,
            min_word_len,
            admitted: Vec::new(),
        }
    }

    pub fn from_options(options: &CompileOptions) -> Self {
        Self::new(options.similarity_threshold, options.similarity_min_word_len)
    }

    /// Check a candidate against every admitted chapter and admit it when
    /// unique. Exact hash matches are checked before similarity so identical
    /// text is always reported as an exact duplicate.
    pub fn admit(&mut self, title: &str, content: &str) -> DedupVerdict {
        let hash = content_hash(content);
        let words = significant_words(content, self.min_word_len);

        for (index, existing) in self.admitted.iter().enumerate() {
            if existing.hash == hash {
                return DedupVerdict::ExactDuplicate {
                    original_index: index,
                    original_title: existing.title.clone(),
                };
            }
        }

        for (index, existing) in self.admitted.iter().enumerate() {
            let similarity = jaccard(&words, &existing.words);
            if similarity > self.threshold {
                return DedupVerdict::NearDuplicate {
                    original_index: index,
                    original_title: existing.title.clone(),
                    similarity,
                };
            }
        }

        self.admitted.push(AdmittedChapter {
            hash,
            words,
            title: title.to_string(),
        });
        DedupVerdict::Unique
    }

    pub fn len(&self) -> usize {
        self.admitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.admitted.is_empty()
    }
}

/// Lowercase, strip punctuation, collapse whitespace
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// SHA-256 hex digest of the normalized text
pub fn content_hash(text: &str) -> String {
    let normalized = normalize(text);
    format!("{:x}", Sha256::digest(normalized.as_bytes()))
}

fn significant_words(text: &str, min_word_len: usize) -> HashSet<String> {
    normalize(text)
        .split_whitespace()
        .filter(|w| w.len() > min_word_len)
        .map(str::to_string)
        .collect()
}

/// |A ∩ B| / |A ∪ B|; empty union counts as no similarity
fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds text from distinct 5-letter words so overlap is controllable
    fn text_from_words(words: &[&str]) -> String {
        words.join(" ")
    }

    #[test]
    fn test_normalize_strips_punctuation_and_case() {
        assert_eq!(
            normalize("  Hello,   WORLD!  It's   me. "),
            "hello world its me"
        );
    }

    #[test]
    fn test_content_hash_ignores_formatting() {
        let a = content_hash("The rain fell. The rain fell hard!");
        let b = content_hash("the RAIN fell,\n\nthe rain  fell hard");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_exact_duplicate_names_original() {
        let mut registry = DedupRegistry::from_options(&CompileOptions::default());
        assert_eq!(
            registry.admit("The Gate", "The keeper walked the wall at dusk."),
            DedupVerdict::Unique
        );
        let verdict = registry.admit("The Gate Again", "THE KEEPER walked the wall, at dusk!");
        match verdict {
            DedupVerdict::ExactDuplicate {
                original_index,
                original_title,
            } => {
                assert_eq!(original_index, 0);
                assert_eq!(original_title, "The Gate");
            }
            other => panic!("expected ExactDuplicate, got {:?}", other),
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_ninety_percent_overlap_is_rejected() {
        // 9 shared words; the first text adds one more, the second adds none:
        // intersection 9, union 10, similarity 0.9
        let shared = [
            "amber", "basket", "candle", "drift", "ember", "fable", "garnet", "harbor", "ivory",
        ];
        let mut first: Vec<&str> = shared.to_vec();
        first.push("jasper");
        let second: Vec<&str> = shared.to_vec();

        let mut registry = DedupRegistry::new(0.85, 3);
        assert_eq!(
            registry.admit("One", &text_from_words(&first)),
            DedupVerdict::Unique
        );
        let verdict = registry.admit("Two", &text_from_words(&second));
        match verdict {
            DedupVerdict::NearDuplicate {
                original_title,
                similarity,
                ..
            } => {
                assert_eq!(original_title, "One");
                assert!((similarity - 0.9).abs() < 1e-9);
            }
            other => panic!("expected NearDuplicate, got {:?}", other),
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_eighty_percent_overlap_is_admitted() {
        // intersection 8, union 10 => similarity exactly 0.8
        let shared = [
            "amber", "basket", "candle", "drift", "ember", "fable", "garnet", "harbor",
        ];
        let mut first: Vec<&str> = shared.to_vec();
        first.push("ivory");
        let mut second: Vec<&str> = shared.to_vec();
        second.push("jasper");

        let mut registry = DedupRegistry::new(0.85, 3);
        assert_eq!(
            registry.admit("One", &text_from_words(&first)),
            DedupVerdict::Unique
        );
        assert_eq!(
            registry.admit("Two", &text_from_words(&second)),
            DedupVerdict::Unique
        );
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_short_words_do_not_count_toward_similarity() {
        // Only "different"/"unrelated" words are significant; the shared
        // filler is all 3 chars or less
        let mut registry = DedupRegistry::new(0.85, 3);
        registry.admit("One", "it is so far off and the owl waited patiently tonight");
        let verdict = registry.admit("Two", "it is so far off and the fox slipped away unseen");
        assert_eq!(verdict, DedupVerdict::Unique);
    }

    #[test]
    fn test_registry_is_per_instance() {
        let text = "The keeper walked the wall at dusk while gulls circled overhead.";
        let mut first = DedupRegistry::from_options(&CompileOptions::default());
        assert_eq!(first.admit("A", text), DedupVerdict::Unique);

        let mut second = DedupRegistry::from_options(&CompileOptions::default());
        assert_eq!(second.admit("A", text), DedupVerdict::Unique);
    }
}
