//! Context Assembler - turns a retrieval result into prompt context
//!
//! One line per record: `<date> (<relevance%> relevant): <body>`. Bodies are
//! truncated to a fixed number of characters; the list itself is never cut.

use crate::config::ContextConfig;
use crate::context::retrieval::RetrievalResult;
use chrono::NaiveDate;
use serde::Serialize;
use uuid::Uuid;

/// Emitted in place of an empty context so the answer acknowledges absence
pub const NO_RECORDS_MARKER: &str = "No relevant entries were found for this question.";

/// One annotated excerpt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snippet {
    pub record_id: Uuid,
    pub date: NaiveDate,
    /// Relevance as a whole percentage
    pub relevance_pct: u8,
    pub text: String,
}

impl Snippet {
    pub fn line(&self) -> String {
        format!(
            "{} ({}% relevant): {}",
            self.date.format("%Y-%m-%d"),
            self.relevance_pct,
            self.text
        )
    }
}

/// Bounded context handed to the completion service
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextWindow {
    snippets: Vec<Snippet>,
}

impl ContextWindow {
    pub fn snippets(&self) -> &[Snippet] {
        &self.snippets
    }

    pub fn is_empty(&self) -> bool {
        self.snippets.is_empty()
    }

    /// Prompt text; the no-records marker when there is nothing to show
    pub fn render(&self) -> String {
        if self.snippets.is_empty() {
            return NO_RECORDS_MARKER.to_string();
        }

        self.snippets
            .iter()
            .map(Snippet::line)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Truncate to at most `max_chars` characters (not bytes), marking the cut
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((cut, _)) => format!("{}...", text[..cut].trim_end()),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ContextAssembler {
    snippet_chars: usize,
}

impl ContextAssembler {
    pub fn new(snippet_chars: usize) -> Self {
        Self { snippet_chars }
    }

    pub fn from_config(config: &ContextConfig) -> Self {
        Self::new(config.snippet_chars)
    }

    pub fn assemble(&self, result: &RetrievalResult) -> ContextWindow {
        let snippets = result
            .iter()
            .map(|entry| {
                // one line per record
                let flat = entry
                    .record
                    .body_text
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ");

                Snippet {
                    record_id: entry.record.id,
                    date: entry.record.created_at.date_naive(),
                    relevance_pct: (entry.relevance * 100.0).round() as u8,
                    text: truncate_chars(&flat, self.snippet_chars),
                }
            })
            .collect();

        ContextWindow { snippets }
    }
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self::from_config(&ContextConfig::default())
    }
}
