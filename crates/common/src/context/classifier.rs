//! Query Classifier - decides which retrieval path a question takes
//!
//! Matching is an ordered list of `(pattern, kind)` rules evaluated by a
//! pure function. Any hit makes the question temporal; a miss is semantic.
//! Words like "past" or "ago" also fire on non-temporal sentences, which is
//! an accepted limitation of the rule set.

use serde::{Deserialize, Serialize};

/// Retrieval path for a question
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    /// Scoped to a calendar period
    Temporal,
    /// Answered by meaning-based similarity
    Semantic,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Temporal => "temporal",
            QueryKind::Semantic => "semantic",
        }
    }
}

/// Anything that can route a question
pub trait Classifier: Send + Sync {
    fn classify(&self, text: &str) -> QueryKind;
}

/// Temporal keyword rules, lower-case
const TEMPORAL_RULES: &[(&str, QueryKind)] = &[
    ("yesterday", QueryKind::Temporal),
    ("today", QueryKind::Temporal),
    ("last week", QueryKind::Temporal),
    ("this week", QueryKind::Temporal),
    ("last month", QueryKind::Temporal),
    ("this month", QueryKind::Temporal),
    ("recent", QueryKind::Temporal),
    ("past", QueryKind::Temporal),
    ("ago", QueryKind::Temporal),
    ("entries from", QueryKind::Temporal),
    ("from yesterday", QueryKind::Temporal),
    ("from today", QueryKind::Temporal),
    ("from last week", QueryKind::Temporal),
    ("from this week", QueryKind::Temporal),
];

/// Case-insensitive substring classifier
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    rules: Vec<(String, QueryKind)>,
    default: QueryKind,
}

impl KeywordClassifier {
    /// Classifier with the built-in temporal keyword set
    pub fn new() -> Self {
        Self::with_rules(
            TEMPORAL_RULES.iter().map(|(p, k)| (p.to_string(), *k)),
            QueryKind::Semantic,
        )
    }

    /// Classifier with custom rules; the first matching rule wins
    pub fn with_rules(
        rules: impl IntoIterator<Item = (String, QueryKind)>,
        default: QueryKind,
    ) -> Self {
        Self {
            rules: rules
                .into_iter()
                .map(|(pattern, kind)| (pattern.to_lowercase(), kind))
                .collect(),
            default,
        }
    }

    /// The pattern that fired for `text`, if any
    pub fn matching_rule(&self, text: &str) -> Option<&str> {
        self.first_match(text).map(|(pattern, _)| pattern.as_str())
    }

    fn first_match(&self, text: &str) -> Option<&(String, QueryKind)> {
        let lowered = text.to_lowercase();
        self.rules
            .iter()
            .find(|(pattern, _)| lowered.contains(pattern.as_str()))
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier for KeywordClassifier {
    fn classify(&self, text: &str) -> QueryKind {
        self.first_match(text)
            .map(|(_, kind)| *kind)
            .unwrap_or(self.default)
    }
}
