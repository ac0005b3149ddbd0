//! Pull the structured patch object out of free-form model output.
//!
//! Models wrap JSON in prose or code fences more often than not. Candidates
//! are tried in order: the whole reply, the body of every fenced block, then
//! every balanced `{...}` span. The first one that parses as a JSON object wins.

use super::client::sanitize_api_response;
use super::GenerationError;
use serde_json::Value;

const MAX_BALANCED_CANDIDATES: usize = 8;

fn push_unique_candidate(candidates: &mut Vec<String>, candidate: &str) {
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return;
    }
    if !candidates.iter().any(|existing| existing == trimmed) {
        candidates.push(trimmed.to_string());
    }
}

/// Bodies of every ``` fenced block, with the info string (e.g. `json`) dropped.
fn fenced_blocks(content: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = content;
    while let Some(open) = rest.find("```") {
        let after_open = &rest[open + 3..];
        let body_start = match after_open.find('\n') {
            Some(newline_idx) => newline_idx + 1,
            None => break,
        };
        let body = &after_open[body_start..];
        let Some(close) = body.find("```") else {
            break;
        };
        blocks.push(&body[..close]);
        rest = &body[close + 3..];
    }
    blocks
}

/// Balanced JSON starting at byte `start`, ignoring brackets inside strings.
fn extract_balanced_json_from(content: &str, start: usize) -> Option<&str> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in content[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(ch) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(&content[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

fn balanced_objects(content: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut idx = 0usize;
    while let Some(rel) = content[idx..].find('{') {
        let start = idx + rel;
        match extract_balanced_json_from(content, start) {
            Some(object) => {
                out.push(object);
                if out.len() >= MAX_BALANCED_CANDIDATES {
                    break;
                }
                idx = start + object.len();
            }
            None => idx = start + 1,
        }
    }
    out
}

/// Return the first JSON object embedded in `text`.
pub fn extract_json_payload(text: &str) -> Result<Value, GenerationError> {
    let mut candidates = Vec::new();
    push_unique_candidate(&mut candidates, text);
    for block in fenced_blocks(text) {
        push_unique_candidate(&mut candidates, block);
    }
    for object in balanced_objects(text) {
        push_unique_candidate(&mut candidates, object);
    }

    let mut last_err: Option<String> = None;
    for candidate in &candidates {
        match serde_json::from_str::<Value>(candidate) {
            Ok(value) if value.is_object() => return Ok(value),
            Ok(_) => last_err = Some("top-level value is not an object".to_string()),
            Err(err) => last_err = Some(err.to_string()),
        }
    }

    Err(GenerationError::Parse {
        message: format!(
            "{} (response preview: {})",
            last_err.unwrap_or_else(|| "response was empty".to_string()),
            sanitize_api_response(text)
        ),
    })
}
