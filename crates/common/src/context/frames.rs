//! Outbound stream frames and their codec
//!
//! Every frame travels as one line `data: <json>\n\n`. The JSON is either
//! `{"sources": [...]}` or `{"response": "<text>"}`; the end of the stream is
//! the transport closing, not a frame.

use crate::context::assembler::truncate_chars;
use crate::context::retrieval::RetrievalResult;
use crate::errors::{AppError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const DATA_PREFIX: &str = "data: ";
const FRAME_END: &str = "\n\n";

/// Citation metadata for one retrieved record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub id: Uuid,
    /// Truncated preview of the body
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub relevance: f32,
}

impl SourceSummary {
    /// Summaries for every entry, in result order
    pub fn from_result(result: &RetrievalResult, preview_chars: usize) -> Vec<Self> {
        result
            .iter()
            .map(|entry| Self {
                id: entry.record.id,
                content: truncate_chars(&entry.record.body_text, preview_chars),
                created_at: entry.record.created_at,
                relevance: entry.relevance,
            })
            .collect()
    }
}

/// One unit of the outbound stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamFrame {
    /// At most once, before any token
    Sources { sources: Vec<SourceSummary> },
    Token { response: String },
}

impl StreamFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamFrame::Sources { .. } => "sources",
            StreamFrame::Token { .. } => "token",
        }
    }
}

/// Encoder/decoder for the `data:` line framing
pub struct FrameCodec;

impl FrameCodec {
    pub fn encode(frame: &StreamFrame) -> Result<String> {
        Ok(format!(
            "{}{}{}",
            DATA_PREFIX,
            serde_json::to_string(frame)?,
            FRAME_END
        ))
    }

    /// Decode a single frame, with or without its trailing blank line
    pub fn decode(frame: &str) -> Result<StreamFrame> {
        let payload = frame
            .trim_end()
            .strip_prefix(DATA_PREFIX)
            .ok_or_else(|| AppError::StreamDecode {
                message: "frame is missing the data prefix".to_string(),
            })?;

        Ok(serde_json::from_str(payload)?)
    }

    /// Decode every frame in a complete stream body
    pub fn decode_all(body: &str) -> Result<Vec<StreamFrame>> {
        body.split(FRAME_END)
            .filter(|chunk| !chunk.trim().is_empty())
            .map(Self::decode)
            .collect()
    }
}
