//! Reply parsing helpers
//!
//! Models wrap payloads in markdown fences more often than not, so both
//! helpers accept either a bare payload or a fenced one.

use crate::ModelError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```([A-Za-z0-9_+\-]*)[ \t]*\r?\n(.*?)```").expect("fence pattern is valid")
});

/// Body of the first fenced block tagged `lang`
///
/// An untagged block is accepted when no tagged one exists.
#[must_use]
pub fn extract_fenced_block(text: &str, lang: &str) -> Option<String> {
    let mut untagged = None;
    for caps in FENCE.captures_iter(text) {
        let tag = caps.get(1).map_or("", |m| m.as_str());
        let body = caps.get(2).map_or("", |m| m.as_str());
        if tag.eq_ignore_ascii_case(lang) {
            return Some(body.trim_end().to_string());
        }
        if tag.is_empty() && untagged.is_none() {
            untagged = Some(body.trim_end().to_string());
        }
    }
    untagged
}

/// Parse a JSON payload from a model reply
///
/// Tries, in order: the whole reply, a ```json fenced block, and the
/// outermost `{ ... }` span.
pub fn parse_json_output(text: &str) -> Result<Value, ModelError> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }
    if let Some(block) = extract_fenced_block(trimmed, "json") {
        return serde_json::from_str(&block)
            .map_err(|e| ModelError::Unparseable(format!("fenced json block: {e}")));
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str(&trimmed[start..=end]) {
                return Ok(value);
            }
        }
    }
    Err(ModelError::Unparseable(format!(
        "no JSON payload in reply ({} chars)",
        trimmed.len()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn extracts_tagged_block() {
        let reply = "Here you go:\n```python\ndef run_code(input):\n    return input\n```\nDone.";
        assert_eq!(
            extract_fenced_block(reply, "python").as_deref(),
            Some("def run_code(input):\n    return input")
        );
    }

    #[test]
    fn prefers_tagged_over_untagged() {
        let reply = "```\nfirst\n```\n```python\nsecond\n```";
        assert_eq!(extract_fenced_block(reply, "python").as_deref(), Some("second"));
    }

    #[test]
    fn falls_back_to_untagged() {
        let reply = "```\nx = 1\n```";
        assert_eq!(extract_fenced_block(reply, "python").as_deref(), Some("x = 1"));
    }

    #[test]
    fn missing_block_is_none() {
        assert_eq!(extract_fenced_block("no code here", "python"), None);
        assert_eq!(extract_fenced_block("```json\n{}\n```", "python"), None);
    }

    #[test]
    fn parses_bare_and_fenced_json() {
        assert_eq!(parse_json_output(" {\"a\": 1} ").unwrap(), json!({"a": 1}));
        assert_eq!(
            parse_json_output("Sure!\n```json\n{\"type\": \"object\"}\n```").unwrap(),
            json!({"type": "object"})
        );
        assert_eq!(
            parse_json_output("The schema is {\"b\": [1, 2]} as requested").unwrap(),
            json!({"b": [1, 2]})
        );
    }

    #[test]
    fn rejects_non_json() {
        let err = parse_json_output("I cannot help with that").unwrap_err();
        assert!(err.is_unparseable());
    }
}
