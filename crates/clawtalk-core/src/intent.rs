//! Lexicon-driven intent classification for inbound text.
//!
//! The same classifier feeds the routing trigger gate (study/advice checks)
//! and job execution (tool-affinity bucketing). Rules are compiled once and
//! evaluated most-specific first; anything unmatched is `Other`.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `Intent` values.
pub enum Intent {
    Study,
    Advice,
    StateTracking,
    GoogleDocs,
    WebResearch,
    CodeExecution,
    FileOps,
    Automation,
    ModelMeta,
    Conversation,
    Other,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Study => "study",
            Self::Advice => "advice",
            Self::StateTracking => "state_tracking",
            Self::GoogleDocs => "google_docs",
            Self::WebResearch => "web_research",
            Self::CodeExecution => "code_execution",
            Self::FileOps => "file_ops",
            Self::Automation => "automation",
            Self::ModelMeta => "model_meta",
            Self::Conversation => "conversation",
            Self::Other => "other",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "study" => Some(Self::Study),
            "advice" => Some(Self::Advice),
            "state_tracking" => Some(Self::StateTracking),
            "google_docs" => Some(Self::GoogleDocs),
            "web_research" => Some(Self::WebResearch),
            "code_execution" => Some(Self::CodeExecution),
            "file_ops" => Some(Self::FileOps),
            "automation" => Some(Self::Automation),
            "model_meta" => Some(Self::ModelMeta),
            "conversation" => Some(Self::Conversation),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    /// Intents that start with a curated tool baseline instead of a warmup
    /// broadcast of every policy-allowed tool.
    pub fn is_cold_start(&self) -> bool {
        matches!(
            self,
            Self::Study | Self::StateTracking | Self::Conversation | Self::ModelMeta
        )
    }
}

struct IntentLexicon {
    time_quantity: Regex,
    study_keywords: Regex,
    advice_phrasing: Regex,
    state_tracking: Regex,
    google_docs: Regex,
    web_research: Regex,
    code_execution: Regex,
    file_ops: Regex,
    automation: Regex,
    model_meta: Regex,
    conversation: Regex,
}

impl IntentLexicon {
    fn new() -> Self {
        let compile = |pattern: &str| Regex::new(pattern).expect("intent lexicon pattern");
        Self {
            time_quantity: compile(r"(?i)\b\d+\s*(h|hr|hrs?|hour[s]?|m|min[s]?|minute[s]?)\b"),
            study_keywords: compile(
                r"(?i)\b(study|studied|studying|homework|revision|revised|reading|practice|practiced|worksheet|flashcards?)\b",
            ),
            advice_phrasing: compile(
                r"(?i)\b(how\s+(do|should|can|would)\s+(i|we)|what\s+should\s+(i|we)|can\s+you\s+(help|suggest|recommend)|any\s+(advice|tips|suggestions?)|should\s+i\b|recommend)\b",
            ),
            state_tracking: compile(
                r"(?i)\b(track|tracking|log\s+(it|this|that)|record\s+(it|this|that)|progress|streak|tally|total\s+so\s+far)\b",
            ),
            google_docs: compile(r"(?i)\b(google\s+docs?|docs?\s+file|the\s+doc|spreadsheet)\b"),
            web_research: compile(
                r"(?i)\b(search|look\s+up|research|find\s+out|google\s+it|latest\s+news)\b",
            ),
            code_execution: compile(
                r"(?i)\b(run|execute|compile|script|shell|python|terminal)\b",
            ),
            file_ops: compile(
                r"(?i)\b(file|folder|directory|download|upload|save\s+(it|this|that|to))\b",
            ),
            automation: compile(
                r"(?i)\b(schedule|automate|remind(er)?|every\s+(day|week|morning|night)|cron)\b",
            ),
            model_meta: compile(
                r"(?i)\b(which\s+model|what\s+model|model\s+(name|version)|system\s+prompt|context\s+window)\b",
            ),
            conversation: compile(
                r"(?i)\b(hello|hi\b|hey\b|thanks|thank\s+you|good\s+(morning|night|evening)|how\s+are\s+you)\b",
            ),
        }
    }

    fn classify(&self, text: &str) -> Intent {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Intent::Other;
        }
        if self.time_quantity.is_match(trimmed) && self.study_keywords.is_match(trimmed) {
            return Intent::Study;
        }
        if self.advice_phrasing.is_match(trimmed) {
            return Intent::Advice;
        }
        if self.state_tracking.is_match(trimmed) {
            return Intent::StateTracking;
        }
        if self.google_docs.is_match(trimmed) {
            return Intent::GoogleDocs;
        }
        if self.web_research.is_match(trimmed) {
            return Intent::WebResearch;
        }
        if self.automation.is_match(trimmed) {
            return Intent::Automation;
        }
        if self.code_execution.is_match(trimmed) {
            return Intent::CodeExecution;
        }
        if self.file_ops.is_match(trimmed) {
            return Intent::FileOps;
        }
        if self.model_meta.is_match(trimmed) {
            return Intent::ModelMeta;
        }
        if self.conversation.is_match(trimmed) {
            return Intent::Conversation;
        }
        Intent::Other
    }
}

fn lexicon() -> &'static IntentLexicon {
    static LEXICON: OnceLock<IntentLexicon> = OnceLock::new();
    LEXICON.get_or_init(IntentLexicon::new)
}

/// Classifies free text into an [`Intent`] using the shared lexicon.
pub fn classify_intent(text: &str) -> Intent {
    lexicon().classify(text)
}
