//! Narrative continuity state
//!
//! Always derived fresh from the accepted chapters, never persisted on its
//! own, so it cannot drift out of sync with the manuscript.

use crate::types::StoryWorldType;
use serde::{Deserialize, Serialize};

/// Short excerpt standing in for one prior chapter's events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotSummary {
    pub chapter: u32,
    pub summary: String,
}

/// Continuity context recomputed before generating each chapter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryState {
    pub genre: String,
    pub setting: String,
    pub world_type: StoryWorldType,
    /// Character names found in the caller's premise
    pub characters: Vec<String>,
    pub tone: String,
    pub themes: Vec<String>,
    /// One excerpt per accepted chapter, in chapter order
    pub plot_summaries: Vec<PlotSummary>,
}

impl StoryState {
    /// Chapters already summarized, so the next prompt can forbid reuse
    pub fn covered_chapters(&self) -> Vec<u32> {
        self.plot_summaries.iter().map(|p| p.chapter).collect()
    }
}
