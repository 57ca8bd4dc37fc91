//! Increment decoding for streamed completions
//!
//! Completion backends frame their output differently: OpenAI-compatible
//! servers send `data:`-prefixed Server-Sent-Event lines, Ollama sends one
//! JSON object per line. Both become the same sequence of text increments.
//! A malformed line is logged and skipped; it never ends the stream. An
//! error the backend reports in-band does.

use crate::context::completion::TokenStream;
use crate::errors::{AppError, Result};
use crate::metrics;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, warn};

/// What one complete line decoded to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Text(String),
    /// Keep-alive, comment, metadata or an empty delta
    Skip,
    /// Terminator; nothing after it is read
    Done,
}

/// Wire-format specific line decoder
pub trait IncrementDecoder: Send + Sync {
    fn decode_line(&self, line: &str) -> Result<Decoded>;

    /// Label used in logs and metrics
    fn format_name(&self) -> &'static str;
}

fn malformed(format: &str, err: impl Display) -> AppError {
    AppError::StreamDecode {
        message: format!("{} increment: {}", format, err),
    }
}

/// The backend reported a failure in-band; nothing useful follows it
fn upstream(format: &str, err: impl Display) -> AppError {
    AppError::CompletionUnavailable {
        message: format!("{} stream reported an error: {}", format, err),
    }
}

/// OpenAI-compatible `data:` lines carrying chat completion chunks
#[derive(Debug, Clone, Copy, Default)]
pub struct SseDecoder;

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    content: Option<String>,
}

impl IncrementDecoder for SseDecoder {
    fn decode_line(&self, line: &str) -> Result<Decoded> {
        let line = line.trim();
        let Some(data) = line.strip_prefix("data:") else {
            // blank separators, `: keep-alive`, `event:`, `id:`, `retry:`
            return Ok(Decoded::Skip);
        };

        let data = data.trim_start();
        if data == "[DONE]" {
            return Ok(Decoded::Done);
        }

        let chunk: ChatChunk =
            serde_json::from_str(data).map_err(|e| malformed(self.format_name(), e))?;

        if let Some(error) = chunk.error {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .map(String::from)
                .unwrap_or_else(|| error.to_string());
            return Err(upstream(self.format_name(), message));
        }

        Ok(chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|text| !text.is_empty())
            .map(Decoded::Text)
            .unwrap_or(Decoded::Skip))
    }

    fn format_name(&self) -> &'static str {
        "sse"
    }
}

/// Ollama newline-delimited JSON chat chunks
#[derive(Debug, Clone, Copy, Default)]
pub struct NdjsonDecoder;

#[derive(Deserialize)]
struct OllamaChunk {
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

#[derive(Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

impl IncrementDecoder for NdjsonDecoder {
    fn decode_line(&self, line: &str) -> Result<Decoded> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Decoded::Skip);
        }

        let chunk: OllamaChunk =
            serde_json::from_str(line).map_err(|e| malformed(self.format_name(), e))?;

        if let Some(error) = chunk.error {
            return Err(upstream(self.format_name(), error));
        }

        match chunk.message {
            Some(message) if !message.content.is_empty() => Ok(Decoded::Text(message.content)),
            _ if chunk.done => Ok(Decoded::Done),
            _ => Ok(Decoded::Skip),
        }
    }

    fn format_name(&self) -> &'static str {
        "ndjson"
    }
}

/// Accumulates raw bytes and hands out complete lines.
///
/// Splitting on bytes rather than decoded text keeps a multi-byte character
/// that straddles two chunks intact.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Whatever is left once the body has ended
    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Malformed lines become `Skip`; an in-band backend error is returned
fn decode_logged(decoder: &dyn IncrementDecoder, line: &str) -> Result<Decoded> {
    match decoder.decode_line(line) {
        Ok(decoded) => Ok(decoded),
        Err(e @ AppError::CompletionUnavailable { .. }) => {
            warn!(format = decoder.format_name(), error = %e, "Completion backend reported an error");
            metrics::record_decode_error(decoder.format_name());
            Err(e)
        }
        Err(e) => {
            warn!(format = decoder.format_name(), error = %e, "Skipping malformed increment");
            metrics::record_decode_error(decoder.format_name());
            Ok(Decoded::Skip)
        }
    }
}

/// Decode a chunked response body into text increments.
///
/// Each chunk is split into lines and decoded before the next chunk is
/// read. A transport error or an in-band backend error yields one
/// `CompletionUnavailable` and ends the stream; frames already yielded stay
/// valid. So does a body that ends without a single increment or
/// terminator, since that is not the framing the decoder expects.
pub fn decode_increments<S, B, E>(body: S, decoder: Arc<dyn IncrementDecoder>) -> TokenStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut body = Box::pin(body);
        let mut lines = LineBuffer::default();
        let mut recognised = false;

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => lines.push(bytes.as_ref()),
                Err(e) => {
                    warn!(error = %e, "Completion stream interrupted");
                    yield Err(AppError::CompletionUnavailable {
                        message: format!("Stream interrupted: {}", e),
                    });
                    return;
                }
            }

            while let Some(line) = lines.next_line() {
                match decode_logged(decoder.as_ref(), &line) {
                    Ok(Decoded::Text(text)) => {
                        recognised = true;
                        yield Ok(text);
                    }
                    Ok(Decoded::Done) => {
                        debug!(format = decoder.format_name(), "Completion stream terminated");
                        return;
                    }
                    Ok(Decoded::Skip) => {}
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }

        if let Some(line) = lines.finish() {
            match decode_logged(decoder.as_ref(), &line) {
                Ok(Decoded::Text(text)) => {
                    recognised = true;
                    yield Ok(text);
                }
                Ok(Decoded::Done) => recognised = true,
                Ok(Decoded::Skip) => {}
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        if !recognised {
            warn!(
                format = decoder.format_name(),
                "Completion body ended without a single increment"
            );
            metrics::record_decode_error(decoder.format_name());
            yield Err(AppError::CompletionUnavailable {
                message: format!("response body is not {} framed", decoder.format_name()),
            });
        }
    })
}
