//! Outline JSON recovery
//!
//! Providers rarely return clean JSON. Recovery runs three strategies in
//! order and stops at the first that parses:
//! 1. the whole text as-is
//! 2. the body of a markdown code fence
//! 3. the first balanced `{...}` block found by brace matching
//!
//! Strings inside the scanned JSON are respected during brace matching, so
//! braces in chapter summaries do not break extraction.

use serde_json::Value;

/// A parsed outline value plus the strategy that produced it
pub struct RecoveredJson {
    pub value: Value,
    pub method: &'static str,
}

/// Try to pull a JSON object out of free-form provider output
pub fn recover_json(text: &str) -> Option<RecoveredJson> {
    let trimmed = text.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return Some(RecoveredJson {
                value,
                method: "direct",
            });
        }
    }

    if let Some(body) = fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(body) {
            if value.is_object() {
                return Some(RecoveredJson {
                    value,
                    method: "fenced",
                });
            }
        }
    }

    if let Some(body) = balanced_braces(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(body) {
            if value.is_object() {
                return Some(RecoveredJson {
                    value,
                    method: "braces",
                });
            }
        }
    }

    None
}

/// Body of the first markdown code fence, language tag stripped
fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_ticks = &text[open + 3..];
    // Skip an optional language tag like `json` up to the first newline
    let body_start = after_ticks.find('\n')? + 1;
    let body = &after_ticks[body_start..];
    let close = body.find("```")?;
    Some(body[..close].trim())
}

/// First balanced top-level `{...}` span, string-aware
fn balanced_braces(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_parse() {
        let recovered = recover_json(r#"{"title": "Tidewater", "chapters": []}"#).unwrap();
        assert_eq!(recovered.method, "direct");
        assert_eq!(recovered.value["title"], "Tidewater");
    }

    #[test]
    fn test_fenced_block_with_language_tag() {
        let text = "Here you go:\n```json\n{\"title\": \"Tidewater\"}\n```\nEnjoy!";
        let recovered = recover_json(text).unwrap();
        assert_eq!(recovered.method, "fenced");
        assert_eq!(recovered.value["title"], "Tidewater");
    }

    #[test]
    fn test_brace_matching_through_prose() {
        let text = "Sure! The outline is {\"title\": \"Tidewater\", \"chapters\": [{\"title\": \"Low Water\"}]} as requested.";
        let recovered = recover_json(text).unwrap();
        assert_eq!(recovered.method, "braces");
        assert_eq!(recovered.value["chapters"][0]["title"], "Low Water");
    }

    #[test]
    fn test_braces_inside_strings_do_not_confuse_matching() {
        let text = r#"Result: {"title": "Brace } Yourself", "chapters": [{"title": "One"}]} done"#;
        let recovered = recover_json(text).unwrap();
        assert_eq!(recovered.value["title"], "Brace } Yourself");
    }

    #[test]
    fn test_plain_prose_fails() {
        assert!(recover_json("No JSON anywhere in this sentence.").is_none());
    }

    #[test]
    fn test_top_level_array_is_not_an_outline() {
        assert!(recover_json(r#"[1, 2, 3]"#).is_none());
    }
}
