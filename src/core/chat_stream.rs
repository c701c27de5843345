//! Parsing for the legacy raw stream channel.
//!
//! Older backends forward provider-native SSE text verbatim: `data:` lines
//! carrying OpenAI-style chunks, terminated by a literal `[DONE]`. Chunks may
//! split lines arbitrarily, so the parser keeps a byte buffer and only acts on
//! complete lines.

use memchr::memchr;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::api::ChatResponse;
use crate::core::message::Usage;

/// How the legacy parser treats payloads that do not match the expected
/// `choices[0].delta.content` shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegacyFormatPolicy {
    /// Skip unrecognized payloads (logged at debug level).
    #[default]
    Lenient,
    /// Surface unrecognized payloads as stream errors.
    Strict,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LegacyChunk {
    Text(String),
    Usage(Usage),
    Error(String),
    Done,
}

pub struct LegacyStreamParser {
    buffer: Vec<u8>,
    policy: LegacyFormatPolicy,
    finished: bool,
}

impl LegacyStreamParser {
    pub fn new(policy: LegacyFormatPolicy) -> Self {
        Self {
            buffer: Vec::new(),
            policy,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed one raw chunk and return everything it completed.
    pub fn feed(&mut self, chunk: &str) -> Vec<LegacyChunk> {
        self.feed_bytes(chunk.as_bytes())
    }

    /// Byte-level variant of [`feed`](Self::feed); multi-byte characters may
    /// straddle chunk boundaries.
    pub fn feed_bytes(&mut self, chunk: &[u8]) -> Vec<LegacyChunk> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.buffer.extend_from_slice(chunk);

        while let Some(newline_pos) = memchr(b'\n', &self.buffer) {
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            let line = match std::str::from_utf8(&line) {
                Ok(line) => line.trim(),
                Err(err) => {
                    debug!("invalid UTF-8 in legacy stream: {err}");
                    continue;
                }
            };
            if let Some(event) = self.parse_line(line) {
                let done = matches!(event, LegacyChunk::Done);
                out.push(event);
                if done {
                    self.finished = true;
                    self.buffer.clear();
                    break;
                }
            }
        }
        out
    }

    fn parse_line(&self, line: &str) -> Option<LegacyChunk> {
        let payload = extract_data_payload(line)?;
        if payload == "[DONE]" {
            return Some(LegacyChunk::Done);
        }
        if payload.is_empty() {
            return None;
        }

        let value: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(_) => return self.unrecognized(payload),
        };
        if value.get("error").is_some() {
            return Some(LegacyChunk::Error(format_api_error(payload)));
        }
        if value.get("choices").is_none() && value.get("usage").is_none() {
            return self.unrecognized(payload);
        }

        let response: ChatResponse = match serde_json::from_value(value) {
            Ok(response) => response,
            Err(_) => return self.unrecognized(payload),
        };
        if let Some(content) = response
            .choices
            .first()
            .and_then(|choice| choice.delta.content.clone())
        {
            if !content.is_empty() {
                return Some(LegacyChunk::Text(content));
            }
        }
        response.usage.map(|usage| LegacyChunk::Usage(usage.into()))
    }

    fn unrecognized(&self, payload: &str) -> Option<LegacyChunk> {
        match self.policy {
            LegacyFormatPolicy::Lenient => {
                debug!(payload, "skipping unrecognized legacy stream payload");
                None
            }
            LegacyFormatPolicy::Strict => Some(LegacyChunk::Error(format!(
                "Unrecognized stream payload: {}",
                payload.trim()
            ))),
        }
    }
}

fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

/// Per-request switch between the normalized and legacy channels. Once a
/// normalized event has been seen the legacy channel stays off for the
/// remainder of the request.
#[derive(Debug, Default)]
pub struct FormatLatch {
    normalized_seen: bool,
}

impl FormatLatch {
    /// Record a normalized event. Returns `true` only on the first call.
    pub fn observe_normalized(&mut self) -> bool {
        !std::mem::replace(&mut self.normalized_seen, true)
    }

    pub fn accepts_legacy(&self) -> bool {
        !self.normalized_seen
    }
}

fn extract_error_summary(value: &Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value
                .get("error")
                .and_then(|v| v.as_str().map(str::to_owned))
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        });

    summary.map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Collapse an API error body into one line of error text.
pub fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();
    if trimmed.is_empty() {
        return "API Error: <empty response>".to_string();
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(summary) = extract_error_summary(&value).filter(|s| !s.is_empty()) {
            return format!("API Error: {summary}");
        }
        return format!("API Error: {value}");
    }

    format!("API Error: {trimmed}")
}
