//! Response normalization: raw model text → JSON value.
//!
//! Models wrap JSON in prose, Markdown fences, or thinking preambles, and
//! long answers get cut off mid-structure. Every consumer of model output
//! goes through `normalize_json` instead of parsing raw text itself.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::LlmError;

/// Truncation repair gives up after this many comma backtracks.
const MAX_REPAIR_ATTEMPTS: usize = 32;

/// Strip model-specific artifacts from raw LLM output.
///
/// Handles:
/// 1. MedGemma thinking tags (`<unusedN>thought\n...`)
/// 2. Stray `<unusedN>` tokens from the Gemma3 tokenizer
/// 3. `<think>...</think>` blocks from reasoning models
pub fn strip_model_artifacts(raw: &str) -> String {
    let mut text = raw.to_string();

    if let Some(idx) = text.find("<unused") {
        if let Some(thought_offset) = text[idx..].find("thought\n") {
            text = text[idx + thought_offset + 8..].to_string();
        }
    }

    static UNUSED_TOKEN_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"<unused\d+>").expect("valid regex"));
    text = UNUSED_TOKEN_RE.replace_all(&text, "").to_string();

    static THINK_BLOCK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"));
    text = THINK_BLOCK_RE.replace_all(&text, "").to_string();

    text.trim().to_string()
}

/// Locate the JSON payload inside model text.
///
/// Preference order: a ```json fence, any fence whose body starts like JSON,
/// then the span from the first `{`/`[` to its last matching closer. An
/// unclosed fence or structure returns the tail so truncation repair can run.
pub fn extract_json_block(text: &str) -> Option<&str> {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```json") {
        let after_fence = &trimmed[start + 7..];
        return Some(match after_fence.find("```") {
            Some(end) => after_fence[..end].trim(),
            None => after_fence.trim(),
        });
    }

    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        let block = match after_fence.find("```") {
            Some(end) => after_fence[..end].trim(),
            None => after_fence.trim(),
        };
        if block.starts_with('{') || block.starts_with('[') {
            return Some(block);
        }
    }

    let start = trimmed.find(['{', '['])?;
    let closer = if trimmed[start..].starts_with('{') { '}' } else { ']' };
    match trimmed.rfind(closer) {
        Some(end) if end > start => Some(&trimmed[start..=end]),
        _ => Some(&trimmed[start..]),
    }
}

/// Parse model output into a JSON value, repairing truncation when needed.
pub fn normalize_json(raw: &str) -> Result<Value, LlmError> {
    let cleaned = strip_model_artifacts(raw);
    let block = extract_json_block(&cleaned)
        .ok_or_else(|| LlmError::MalformedResponse("No JSON found in response".into()))?;

    match serde_json::from_str::<Value>(block) {
        Ok(value) => Ok(value),
        Err(first_err) => match repair_truncated(block) {
            Some(value) => {
                tracing::debug!(block_len = block.len(), "Repaired truncated JSON response");
                Ok(value)
            }
            None => Err(LlmError::MalformedResponse(format!(
                "Invalid JSON in response: {first_err}"
            ))),
        },
    }
}

/// Read a 1–100 style score from model output.
///
/// Accepts `{"score": n}` JSON or falls back to the first integer in the text.
/// Returns `None` when nothing numeric is present; callers decide the default.
pub fn parse_score(raw: &str) -> Option<i64> {
    let cleaned = strip_model_artifacts(raw);

    if let Ok(value) = normalize_json(&cleaned) {
        let score = match &value {
            Value::Object(map) => map.get("score"),
            _ => None,
        };
        if let Some(n) = score.and_then(value_as_i64) {
            return Some(n);
        }
    }

    static INTEGER_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"-?\d+").expect("valid regex"));
    INTEGER_RE
        .find(&cleaned)
        .and_then(|m| m.as_str().parse::<i64>().ok())
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f.round() as i64),
        _ => None,
    }
}

// ── Truncation repair ────────────────────────────────────

/// Structural state at the end of a (possibly truncated) JSON text.
struct ScanState {
    in_string: bool,
    open: Vec<char>,
    last_comma: Option<usize>,
}

fn scan(text: &str) -> ScanState {
    let mut state = ScanState {
        in_string: false,
        open: Vec::new(),
        last_comma: None,
    };
    let mut escaped = false;

    for (pos, c) in text.char_indices() {
        if state.in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                state.in_string = false;
            }
            continue;
        }
        match c {
            '"' => state.in_string = true,
            '{' => state.open.push('}'),
            '[' => state.open.push(']'),
            '}' | ']' => {
                state.open.pop();
            }
            ',' => state.last_comma = Some(pos),
            _ => {}
        }
    }
    state
}

fn close_open(text: &str, state: &ScanState) -> String {
    let mut out = text.to_string();
    if state.in_string {
        out.push('"');
    }
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if out.ends_with(',') {
        out.pop();
    }
    if out.ends_with(':') {
        out.push_str("null");
    }
    for closer in state.open.iter().rev() {
        out.push(*closer);
    }
    out
}

fn repair_truncated(text: &str) -> Option<Value> {
    let mut candidate = text.to_string();
    for _ in 0..MAX_REPAIR_ATTEMPTS {
        let state = scan(&candidate);
        let closed = close_open(&candidate, &state);
        if let Ok(value) = serde_json::from_str::<Value>(&closed) {
            return Some(value);
        }
        let cut = state.last_comma?;
        candidate.truncate(cut);
    }
    None
}
