//! Compiled manuscripts and their chapters

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A titled, numbered unit of manuscript content
///
/// Chapter numbers are unique and contiguous in a final manuscript; content
/// passed validation before acceptance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub number: u32,
    pub title: String,
    pub content: String,
    /// Normalized fingerprint used for exact-duplicate detection
    pub content_hash: String,
    pub word_count: usize,
    /// Ids of the nodes that contributed this chapter
    pub sources: BTreeSet<String>,
}

/// Table-of-contents line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TocEntry {
    pub number: u32,
    pub title: String,
}

/// Aggregate figures for a compiled manuscript
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManuscriptMetadata {
    pub total_words: usize,
    pub total_chapters: usize,
    /// Minutes at the configured reading speed, rounded up
    pub estimated_reading_time_minutes: usize,
    /// Labels of every node whose output fed the manuscript
    pub content_sources: BTreeSet<String>,
}

/// The assembled book
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manuscript {
    pub title: String,
    pub author: String,
    pub toc: Option<Vec<TocEntry>>,
    pub chapters: Vec<Chapter>,
    pub metadata: ManuscriptMetadata,
}

impl Manuscript {
    /// Plain-text rendering: title page, optional contents, chapter bodies,
    /// closing metadata block
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# {}\n\n", self.title));
        out.push_str(&format!("by {}\n\n", self.author));

        if let Some(toc) = &self.toc {
            out.push_str("## Table of Contents\n\n");
            for entry in toc {
                out.push_str(&format!("{}. {}\n", entry.number, entry.title));
            }
            out.push('\n');
        }

        for chapter in &self.chapters {
            out.push_str(&format!("## Chapter {}: {}\n\n", chapter.number, chapter.title));
            out.push_str(chapter.content.trim_end());
            out.push_str("\n\n");
        }

        out.push_str("---\n");
        out.push_str(&format!("Total words: {}\n", self.metadata.total_words));
        out.push_str(&format!("Chapters: {}\n", self.metadata.total_chapters));
        out.push_str(&format!(
            "Estimated reading time: {} minutes\n",
            self.metadata.estimated_reading_time_minutes
        ));
        if !self.metadata.content_sources.is_empty() {
            let sources: Vec<&str> = self
                .metadata
                .content_sources
                .iter()
                .map(|s| s.as_str())
                .collect();
            out.push_str(&format!("Sources: {}\n", sources.join(", ")));
        }
        out
    }
}

/// What a completed execution stores: the structure plus its rendering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledResult {
    pub manuscript: Manuscript,
    pub rendered: String,
}
