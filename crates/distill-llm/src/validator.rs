//! JSON extraction and repair for model output
//!
//! Model output is untrusted: it may arrive wrapped in a markdown fence, with
//! trailing commas, or truncated. [`validate_response`] is the strict stage run
//! inside each attempt; [`clean_json_output`] is the lenient stage run once on
//! the final text and never fails.

use crate::client::GenerateContentResponse;
use crate::error::{LLMError, Result};
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::OnceLock;
use tracing::{debug, warn};

fn fence_pattern() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)^```[A-Za-z0-9_+-]*[ \t]*\r?\n?(.*?)\r?\n?[ \t]*```$").expect("fence pattern is valid")
    })
}

fn trailing_comma_pattern() -> &'static Regex {
    static TRAILING_COMMA: OnceLock<Regex> = OnceLock::new();
    // string literals are matched first so commas inside them are left alone
    TRAILING_COMMA.get_or_init(|| {
        Regex::new(r#""(?:[^"\\]|\\.)*"|,(\s*[}\]])"#).expect("trailing comma pattern is valid")
    })
}

/// Remove one fenced code block enclosing the whole text
///
/// Text that is not entirely wrapped is returned trimmed but otherwise intact.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    match fence_pattern().captures(trimmed).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().trim(),
        None => trimmed,
    }
}

/// Drop commas directly followed by a closing `}` or `]`
///
/// Text inside string literals is never rewritten.
pub fn repair_trailing_commas(text: &str) -> String {
    trailing_comma_pattern()
        .replace_all(text, |caps: &Captures| match caps.get(1) {
            Some(closing) => closing.as_str().to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Turn a provider response into text that parses as JSON
///
/// Fails with [`LLMError::SafetyBlocked`] when the response carries a block
/// indicator, and with [`LLMError::InvalidResponse`] when no parseable JSON
/// can be recovered.
pub fn validate_response(response: &GenerateContentResponse) -> Result<String> {
    if let Some(reason) = response.block_reason() {
        let message = response
            .prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason_message.clone())
            .map(|m| format!("{}: {}", reason, m))
            .unwrap_or(reason);
        return Err(LLMError::SafetyBlocked(message));
    }

    let raw = match response.text() {
        Ok(text) => text,
        Err(err) => {
            debug!(error = %err, "Primary text accessor failed, reading first part");
            response
                .first_part_text()
                .ok_or_else(|| LLMError::InvalidResponse(format!("No text in response: {}", err)))?
        }
    };

    let repaired = repair_trailing_commas(strip_code_fence(&raw));
    if repaired.trim().is_empty() {
        return Err(LLMError::InvalidResponse("Empty response text".to_string()));
    }

    serde_json::from_str::<Value>(&repaired).map_err(|e| {
        LLMError::InvalidResponse(format!(
            "Response is not valid JSON ({}), {} chars",
            e,
            repaired.len()
        ))
    })?;

    Ok(repaired)
}

/// Extract the outermost JSON object from already validated text
///
/// Returns an empty string when no object can be recovered.
pub fn clean_json_output(text: &str) -> String {
    let stripped = strip_code_fence(text);

    let (start, end) = match (stripped.find('{'), stripped.rfind('}')) {
        (Some(start), Some(end)) if start < end => (start, end),
        _ => {
            warn!("No JSON object found in final output");
            return String::new();
        }
    };

    let candidate = &stripped[start..=end];
    match serde_json::from_str::<Value>(candidate) {
        Ok(_) => candidate.to_string(),
        Err(e) => {
            warn!(error = %e, "Final output object does not parse");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fence("```\n[1, 2]\n```"), "[1, 2]");
        assert_eq!(strip_code_fence("  {\"a\": 1}  "), "{\"a\": 1}");
        // only a fence around the whole text is removed
        assert_eq!(
            strip_code_fence("see ```json\n{}\n```"),
            "see ```json\n{}\n```"
        );
    }

    #[test]
    fn test_repair_trailing_commas() {
        assert_eq!(repair_trailing_commas(r#"{"a": 1,}"#), r#"{"a": 1}"#);
        assert_eq!(repair_trailing_commas("[1, 2,\n ]"), "[1, 2\n ]");
        assert_eq!(repair_trailing_commas(r#"{"a": [1,], "b": 2}"#), r#"{"a": [1], "b": 2}"#);
    }

    #[test]
    fn test_repair_leaves_string_contents_alone() {
        assert_eq!(repair_trailing_commas(r#"{"note": "a,]"}"#), r#"{"note": "a,]"}"#);
        assert_eq!(
            repair_trailing_commas(r#"{"note": "say \"x,}\"", "n": [1,]}"#),
            r#"{"note": "say \"x,}\"", "n": [1]}"#
        );
    }

    #[test]
    fn test_fenced_trailing_comma_matches_clean_object() {
        let response = GenerateContentResponse::from_text("```json\n{\"total\": 12.5, \"items\": [\"a\", \"b\",],}\n```");

        let text = validate_response(&response).unwrap();
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, json!({"total": 12.5, "items": ["a", "b"]}));
    }

    #[test]
    fn test_safety_block_rejected() {
        let response: GenerateContentResponse = serde_json::from_value(json!({
            "promptFeedback": {"blockReason": "SAFETY", "blockReasonMessage": "harm category"}
        }))
        .unwrap();

        match validate_response(&response) {
            Err(LLMError::SafetyBlocked(reason)) => assert_eq!(reason, "SAFETY: harm category"),
            other => panic!("expected safety block, got {:?}", other),
        }
    }

    #[test]
    fn test_max_tokens_candidate_still_readable() {
        let response: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{"content": {"parts": [{"text": "{\"ok\": true}"}]}, "finishReason": "MAX_TOKENS"}]
        }))
        .unwrap();

        assert_eq!(validate_response(&response).unwrap(), "{\"ok\": true}");
    }

    #[test]
    fn test_truncated_json_is_invalid() {
        let response = GenerateContentResponse::from_text("{\"items\": [1, 2");
        assert!(matches!(validate_response(&response), Err(LLMError::InvalidResponse(_))));

        let empty = GenerateContentResponse::from_text("   ");
        assert!(matches!(validate_response(&empty), Err(LLMError::InvalidResponse(_))));

        let none = GenerateContentResponse::default();
        assert!(matches!(validate_response(&none), Err(LLMError::InvalidResponse(_))));
    }

    #[test]
    fn test_clean_json_output() {
        assert_eq!(clean_json_output("Here you go: {\"a\": {\"b\": 1}} thanks"), "{\"a\": {\"b\": 1}}");
        assert_eq!(clean_json_output("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(clean_json_output("{\"a\": 1} and {broken}"), "");
        assert_eq!(clean_json_output("[1, 2, 3]"), "");
        assert_eq!(clean_json_output(""), "");
    }
}
