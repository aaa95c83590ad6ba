//! Narrative continuity tracking
//!
//! Derives a fresh `StoryState` from the accepted chapters before each
//! generation call and turns it into a binding instruction block for the
//! next chapter. The tracker never calls the generator itself; it only
//! prepares the context the generator must honor.
//!
//! Classification runs through the `WorldTypeClassifier`, `GenreClassifier`
//! and `ToneClassifier` traits. The keyword classifiers here are the stock
//! implementations; callers can swap in anything else.

use crate::models::{PlotSummary, StoryState};
use crate::types::{
    ChapterDraft, GenreClass, GenreClassifier, StoryWorldType, ToneClassifier,
    WorldTypeClassifier,
};
use strsim::jaro_winkler;
use tracing::debug;

/// Excerpt length used for per-chapter plot summaries
const EXCERPT_CHARS: usize = 500;

/// Titles closer than this to an already-used title count as taken
const TITLE_SIMILARITY_CUTOFF: f64 = 0.92;

// ============================================================================
// Chapter purpose
// ============================================================================

/// The narrative job a chapter position carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChapterPurpose {
    Setup,
    RisingAction,
    Climax,
    FallingAction,
    Resolution,
    Introduction,
    MainContent,
    Conclusion,
}

impl ChapterPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChapterPurpose::Setup => "setup",
            ChapterPurpose::RisingAction => "rising_action",
            ChapterPurpose::Climax => "climax",
            ChapterPurpose::FallingAction => "falling_action",
            ChapterPurpose::Resolution => "resolution",
            ChapterPurpose::Introduction => "introduction",
            ChapterPurpose::MainContent => "main_content",
            ChapterPurpose::Conclusion => "conclusion",
        }
    }

    /// What the chapter must accomplish, stated as instructions
    pub fn objectives(&self) -> &'static [&'static str] {
        match self {
            ChapterPurpose::Setup => &[
                "Establish the setting and the rules of the world",
                "Introduce the protagonist and what they want",
                "Plant the central conflict without resolving it",
            ],
            ChapterPurpose::RisingAction => &[
                "Escalate the central conflict with a concrete new obstacle",
                "Deepen at least one relationship established earlier",
                "Raise the cost of failure",
            ],
            ChapterPurpose::Climax => &[
                "Bring the central conflict to its peak",
                "Force the protagonist into a decisive, costly choice",
                "Keep the outcome uncertain until the turn",
            ],
            ChapterPurpose::FallingAction => &[
                "Show the immediate consequences of the climax",
                "Begin resolving secondary threads",
                "Let the characters register what the climax cost",
            ],
            ChapterPurpose::Resolution => &[
                "Close every open thread from earlier chapters",
                "Introduce no new conflicts",
                "Land the emotional ending the story has earned",
            ],
            ChapterPurpose::Introduction => &[
                "State the promise of the book and why it matters",
                "Establish credibility and scope",
                "Preview the journey ahead",
            ],
            ChapterPurpose::MainContent => &[
                "Deliver the core material with concrete examples",
                "Build on the previous section without repeating it",
                "Keep the through-line visible",
            ],
            ChapterPurpose::Conclusion => &[
                "Summarize the key takeaways",
                "End with a clear call to action",
                "Open no new topics",
            ],
        }
    }

    fn title_pool(&self) -> &'static [&'static str] {
        match self {
            ChapterPurpose::Setup => {
                &["First Light", "The Threshold", "Where It Began", "Small Hours"]
            }
            ChapterPurpose::RisingAction => {
                &["The Storm Gathers", "Deeper Water", "No Way Back", "Complications"]
            }
            ChapterPurpose::Climax => {
                &["The Reckoning", "Breaking Point", "Zero Hour", "The Confrontation"]
            }
            ChapterPurpose::FallingAction => {
                &["Aftermath", "What Remains", "Embers", "The Long Way Down"]
            }
            ChapterPurpose::Resolution => {
                &["Full Circle", "Homecoming", "A New Dawn", "The Last Door"]
            }
            ChapterPurpose::Introduction => &["The Promise", "Why This Matters", "Starting Here"],
            ChapterPurpose::MainContent => &["The Heart of It", "In Practice", "The Working Parts"],
            ChapterPurpose::Conclusion => {
                &["Bringing It Together", "The Road Ahead", "Final Thoughts"]
            }
        }
    }
}

impl std::fmt::Display for ChapterPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Keyword classifiers
// ============================================================================

const FANTASY_TERMS: &[&str] = &[
    "magic", "magical", "wizard", "dragon", "sorcer", "spell", "spells", "sword", "kingdom",
    "castle", "prophecy", "quest", "enchant", "realm", "curse", "cursed", "elf", "elves",
    "throne", "potion",
];

const REALISTIC_TERMS: &[&str] = &[
    "city", "office", "phone", "computer", "internet", "email", "startup", "company", "police",
    "detective", "hospital", "school", "college", "apartment", "train", "subway", "highway",
    "airport", "election", "market",
];

const NONFICTION_MARKERS: &[&str] = &[
    "non-fiction", "nonfiction", "self-help", "self help", "how-to", "how to", "guide",
    "manual", "biography", "memoir", "history", "business", "reference", "textbook",
    "cookbook",
];

/// A cleaned word matches a term exactly, or by prefix for long stems
fn term_matches(word: &str, term: &str) -> bool {
    word == term || (term.len() >= 6 && word.starts_with(term))
}

fn score_terms(text: &str, terms: &[&str]) -> usize {
    text.split_whitespace()
        .map(|token| token.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|word| terms.iter().any(|term| term_matches(word, term)))
        .count()
}

/// Stock world classifier: fantasy terms against real-world terms
pub struct KeywordWorldClassifier;

impl WorldTypeClassifier for KeywordWorldClassifier {
    fn name(&self) -> &'static str {
        "KeywordWorldClassifier"
    }

    fn classify(&self, text: &str) -> StoryWorldType {
        let fantasy = score_terms(text, FANTASY_TERMS);
        let realistic = score_terms(text, REALISTIC_TERMS);
        debug!(fantasy, realistic, "World type scores");
        // A tie, including no signal at all, reads as realistic
        if fantasy > realistic {
            StoryWorldType::Fantasy
        } else {
            StoryWorldType::Realistic
        }
    }
}

/// Stock genre classifier over the caller's declared genre string
pub struct KeywordGenreClassifier;

impl GenreClassifier for KeywordGenreClassifier {
    fn name(&self) -> &'static str {
        "KeywordGenreClassifier"
    }

    fn classify(&self, genre: &str) -> GenreClass {
        let lowered = genre.to_lowercase();
        if NONFICTION_MARKERS
            .iter()
            .any(|marker| lowered.contains(marker))
        {
            GenreClass::NonFiction
        } else {
            GenreClass::Fiction
        }
    }
}

/// Stock tone classifier; highest keyword score wins, no signal is neutral
pub struct KeywordToneClassifier;

impl ToneClassifier for KeywordToneClassifier {
    fn name(&self) -> &'static str {
        "KeywordToneClassifier"
    }

    fn classify(&self, text: &str) -> String {
        let scored = [
            (
                "dark",
                score_terms(
                    text,
                    &["death", "blood", "murder", "shadow", "grief", "betrayal", "corpse", "grave"],
                ),
            ),
            (
                "lighthearted",
                score_terms(
                    text,
                    &["laugh", "laughed", "joke", "cheerful", "picnic", "delight", "wedding", "smile"],
                ),
            ),
            (
                "suspenseful",
                score_terms(
                    text,
                    &["secret", "mystery", "vanish", "missing", "hidden", "whisper", "stalked"],
                ),
            ),
        ];

        let best = scored.iter().max_by_key(|(_, score)| *score);
        match best {
            Some((tone, score)) if *score > 0 => tone.to_string(),
            _ => "neutral".to_string(),
        }
    }
}

// ============================================================================
// Tracker
// ============================================================================

/// Everything the worker hands the generator for one chapter
#[derive(Debug, Clone)]
pub struct ChapterContext {
    pub purpose: ChapterPurpose,
    pub state: StoryState,
    /// The binding instruction block, ready to embed in the prompt
    pub instructions: String,
    pub suggested_title: Option<String>,
}

/// Derives continuity context between sequential chapter generations
pub struct ContinuityTracker {
    world: Box<dyn WorldTypeClassifier>,
    genre: Box<dyn GenreClassifier>,
    tone: Box<dyn ToneClassifier>,
}

impl ContinuityTracker {
    pub fn new() -> Self {
        Self {
            world: Box::new(KeywordWorldClassifier),
            genre: Box::new(KeywordGenreClassifier),
            tone: Box::new(KeywordToneClassifier),
        }
    }

    pub fn with_classifiers(
        world: Box<dyn WorldTypeClassifier>,
        genre: Box<dyn GenreClassifier>,
        tone: Box<dyn ToneClassifier>,
    ) -> Self {
        Self { world, genre, tone }
    }

    /// Recompute story state from the premise and every accepted chapter
    ///
    /// Characters come from the premise only; world type and tone consider
    /// the accepted prose as well, so the story can reveal its own nature.
    pub fn derive_state(
        &self,
        premise: &str,
        declared_genre: &str,
        accepted: &[ChapterDraft],
    ) -> StoryState {
        let mut corpus = String::with_capacity(
            premise.len() + accepted.iter().map(|c| c.content.len()).sum::<usize>(),
        );
        corpus.push_str(premise);
        for chapter in accepted {
            corpus.push('\n');
            corpus.push_str(&chapter.content);
        }

        let world_type = self.world.classify(&corpus);
        let tone = self.tone.classify(&corpus);

        let plot_summaries = accepted
            .iter()
            .enumerate()
            .map(|(index, chapter)| PlotSummary {
                chapter: chapter.number.unwrap_or(index as u32 + 1),
                summary: excerpt(&chapter.content, EXCERPT_CHARS),
            })
            .collect();

        debug!(
            world = %world_type,
            tone = %tone,
            chapters = accepted.len(),
            classifier = self.world.name(),
            "Derived story state"
        );

        StoryState {
            genre: declared_genre.to_string(),
            setting: derive_setting(premise),
            world_type,
            characters: extract_characters(premise),
            tone,
            themes: extract_themes(&corpus),
            plot_summaries,
        }
    }

    /// Structure-table lookup: narrative purpose for a chapter position
    pub fn purpose_for(genre: GenreClass, total: u32, position: u32) -> ChapterPurpose {
        match genre {
            GenreClass::NonFiction => {
                if total <= 1 {
                    ChapterPurpose::MainContent
                } else if position <= 1 {
                    ChapterPurpose::Introduction
                } else if position >= total {
                    ChapterPurpose::Conclusion
                } else {
                    ChapterPurpose::MainContent
                }
            }
            GenreClass::Fiction => match total {
                0 | 1 => ChapterPurpose::Resolution,
                2 => {
                    if position <= 1 {
                        ChapterPurpose::Setup
                    } else {
                        ChapterPurpose::Resolution
                    }
                }
                3 => match position {
                    0 | 1 => ChapterPurpose::Setup,
                    2 => ChapterPurpose::Climax,
                    _ => ChapterPurpose::Resolution,
                },
                _ => {
                    if position <= 1 {
                        ChapterPurpose::Setup
                    } else if position >= total {
                        ChapterPurpose::Resolution
                    } else if position == total - 1 {
                        ChapterPurpose::FallingAction
                    } else if position == total - 2 {
                        ChapterPurpose::Climax
                    } else {
                        ChapterPurpose::RisingAction
                    }
                }
            },
        }
    }

    /// First pool title not already taken, fuzzily compared
    pub fn suggest_title(purpose: ChapterPurpose, used: &[String]) -> Option<String> {
        purpose
            .title_pool()
            .iter()
            .find(|candidate| {
                !used.iter().any(|taken| {
                    jaro_winkler(&taken.to_lowercase(), &candidate.to_lowercase())
                        >= TITLE_SIMILARITY_CUTOFF
                })
            })
            .map(|title| title.to_string())
    }

    /// Full context for generating chapter `number` of `total`
    pub fn chapter_context(
        &self,
        premise: &str,
        declared_genre: &str,
        accepted: &[ChapterDraft],
        number: u32,
        total: u32,
    ) -> ChapterContext {
        let state = self.derive_state(premise, declared_genre, accepted);
        let genre_class = self.genre.classify(declared_genre);
        let purpose = Self::purpose_for(genre_class, total, number);

        let used_titles: Vec<String> = accepted.iter().map(|c| c.title.clone()).collect();
        let suggested_title = Self::suggest_title(purpose, &used_titles);

        let instructions =
            build_instructions(&state, purpose, number, total, suggested_title.as_deref());

        ChapterContext {
            purpose,
            state,
            instructions,
            suggested_title,
        }
    }
}

impl Default for ContinuityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Render the story state and purpose into the binding instruction block
fn build_instructions(
    state: &StoryState,
    purpose: ChapterPurpose,
    number: u32,
    total: u32,
    suggested_title: Option<&str>,
) -> String {
    let mut block = String::new();
    block.push_str(&format!(
        "You are writing chapter {} of {}. Narrative purpose: {}.\n\n",
        number, total, purpose
    ));

    block.push_str("Established story state. Every item below is binding:\n");
    if !state.genre.is_empty() {
        block.push_str(&format!("- Genre: {}\n", state.genre));
    }
    if !state.setting.is_empty() {
        block.push_str(&format!("- Setting: {}\n", state.setting));
    }
    block.push_str(&format!(
        "- World type: {} (do not change the established world type)\n",
        state.world_type
    ));
    if state.characters.is_empty() {
        block.push_str("- Characters: none established yet\n");
    } else {
        block.push_str(&format!("- Characters: {}\n", state.characters.join(", ")));
    }
    block.push_str(&format!("- Tone: {}\n", state.tone));
    if !state.themes.is_empty() {
        block.push_str(&format!("- Themes: {}\n", state.themes.join(", ")));
    }

    block.push_str("\nThis chapter must:\n");
    for objective in purpose.objectives() {
        block.push_str(&format!("- {}\n", objective));
    }

    if !state.plot_summaries.is_empty() {
        block.push_str("\nEvents already covered, chapter by chapter:\n");
        for summary in &state.plot_summaries {
            block.push_str(&format!("Chapter {}: {}\n", summary.chapter, summary.summary));
        }
        block.push_str(
            "\nDo not repeat any scene or event listed above. Continue from where the \
             previous chapter left off.\n",
        );
    }

    if let Some(title) = suggested_title {
        block.push_str(&format!("\nSuggested title (not yet used): {}\n", title));
    }

    block
}

/// The premise's first sentence, clipped, stands in for the setting
fn derive_setting(premise: &str) -> String {
    let first = premise
        .split(['.', '!', '?'])
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or("");
    excerpt(first, 160)
}

/// First `limit` chars, cut back to a word boundary
fn excerpt(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= limit {
        return trimmed.to_string();
    }
    let clipped: String = trimmed.chars().take(limit).collect();
    match clipped.rfind(' ') {
        Some(cut) => format!("{}...", clipped[..cut].trim_end()),
        None => clipped,
    }
}

/// Capitalized words from the premise that read like names
///
/// Sentence-initial capitals only count when the same word also appears
/// mid-sentence or more than once, which filters ordinary sentence openers.
fn extract_characters(premise: &str) -> Vec<String> {
    const STOPWORDS: &[&str] = &[
        "The", "A", "An", "In", "On", "At", "When", "After", "Before", "It", "He", "She",
        "They", "His", "Her", "Their", "But", "And", "Then", "This", "That", "Once", "Every",
        "By", "With", "From", "For", "Not", "Now", "What", "Where", "Who", "While", "One",
        "Two", "Three", "Chapter",
    ];

    let mut candidates: Vec<(String, usize, bool)> = Vec::new();
    let mut at_sentence_start = true;

    for token in premise.split_whitespace() {
        let word = token.trim_matches(|c: char| !c.is_alphanumeric());
        let sentence_start = at_sentence_start;
        at_sentence_start = token.ends_with(['.', '!', '?', ':']);

        if word.len() < 2 || !word.chars().next().is_some_and(char::is_uppercase) {
            continue;
        }
        if STOPWORDS.contains(&word) {
            continue;
        }

        match candidates.iter_mut().find(|(name, _, _)| name == word) {
            Some((_, count, non_initial)) => {
                *count += 1;
                *non_initial |= !sentence_start;
            }
            None => candidates.push((word.to_string(), 1, !sentence_start)),
        }
    }

    candidates
        .into_iter()
        .filter(|(_, count, non_initial)| *non_initial || *count >= 2)
        .map(|(name, _, _)| name)
        .take(8)
        .collect()
}

fn extract_themes(corpus: &str) -> Vec<String> {
    const THEME_TABLE: &[(&str, &[&str])] = &[
        ("loss", &["loss", "grief", "missing", "mourning"]),
        ("discovery", &["discover", "uncover", "reveal", "found"]),
        ("power", &["power", "throne", "control", "command"]),
        ("friendship", &["friend", "friends", "friendship", "loyal"]),
        ("survival", &["survive", "survival", "escape", "endure"]),
        ("justice", &["justice", "crime", "guilt", "trial"]),
        (
            "family",
            &["family", "mother", "father", "sister", "brother", "grandfather", "grandmother"],
        ),
        ("love", &["love", "beloved", "romance", "heart"]),
    ];

    THEME_TABLE
        .iter()
        .filter(|(_, terms)| score_terms(corpus, terms) > 0)
        .map(|(theme, _)| theme.to_string())
        .take(5)
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
