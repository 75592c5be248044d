//! Pulls a plan out of free-form model output.
//!
//! Models wrap the JSON array in prose or markdown fences and occasionally
//! emit trailing commas or bare keys. Extraction finds the first balanced
//! array; if it does not decode, a small set of textual repairs is applied
//! once before giving up.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::{Action, Plan};

static TRAILING_COMMA_ARRAY: Lazy<Regex> = Lazy::new(|| Regex::new(r",\s*\]").expect("valid regex"));
static TRAILING_COMMA_OBJECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",\s*\}").expect("valid regex"));
static BARE_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([\{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:").expect("valid regex"));

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    #[error("no JSON array found in model output")]
    NoArray,
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("invalid plan structure: {0}")]
    InvalidStructure(String),
}

fn strip_fences(text: &str) -> String {
    text.replace("```json", "").replace("```", "")
}

/// Returns the first balanced JSON array in `text`, ignoring code fences.
/// Brackets inside string literals are not counted.
pub fn extract(text: &str) -> Option<String> {
    let cleaned = strip_fences(text);
    let start = cleaned.find('[')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in cleaned[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return Some(cleaned[start..end].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Applies the repair rules to the span between the first `[` and the last
/// `]` of `text`.
pub fn repair(text: &str) -> Option<String> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end < start {
        return None;
    }
    let span = &text[start..=end];
    let fixed = TRAILING_COMMA_ARRAY.replace_all(span, "]");
    let fixed = TRAILING_COMMA_OBJECT.replace_all(&fixed, "}");
    let fixed = BARE_KEY.replace_all(&fixed, "${1}\"${2}\":");
    Some(fixed.into_owned())
}

/// True iff `value` is an array whose elements are objects carrying a
/// non-empty string `event` and a `data` key.
pub fn validate(value: &Value) -> bool {
    structural_error(value).is_none()
}

fn structural_error(value: &Value) -> Option<String> {
    let Some(items) = value.as_array() else {
        return Some("expected a JSON array".into());
    };
    for (i, item) in items.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            return Some(format!("action {i} is not an object"));
        };
        match obj.get("event").and_then(Value::as_str) {
            Some(event) if !event.trim().is_empty() => {}
            _ => return Some(format!("action {i} has no event name")),
        }
        if !obj.contains_key("data") {
            return Some(format!("action {i} has no data"));
        }
    }
    None
}

/// Extracts, decodes (repairing once if needed) and validates a plan.
pub fn parse(text: &str) -> Result<Plan, ParseError> {
    let candidate = extract(text).ok_or(ParseError::NoArray)?;
    let value = match serde_json::from_str::<Value>(&candidate) {
        Ok(value) => value,
        Err(first) => {
            debug!(error = %first, "plan JSON did not decode, repairing");
            let repaired = repair(text).ok_or_else(|| ParseError::InvalidJson(first.to_string()))?;
            serde_json::from_str(&repaired).map_err(|e| ParseError::InvalidJson(e.to_string()))?
        }
    };
    from_value(value)
}

/// Validates an already decoded value, such as the `plan` field of a
/// `task_execute` event.
pub fn from_value(value: Value) -> Result<Plan, ParseError> {
    if let Some(reason) = structural_error(&value) {
        return Err(ParseError::InvalidStructure(reason));
    }
    let actions: Vec<Action> =
        serde_json::from_value(value).map_err(|e| ParseError::InvalidStructure(e.to_string()))?;
    Ok(Plan::new(actions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_strips_fences() {
        let raw = "```json\n[{\"event\":\"x\",\"data\":{}}]\n```";
        assert_eq!(extract(raw).as_deref(), Some("[{\"event\":\"x\",\"data\":{}}]"));
    }

    #[test]
    fn extract_matches_nested_brackets_and_skips_strings() {
        let raw = r#"Sure! [{"event":"k","data":{"keys":["ctrl","]"]}}] and [1]"#;
        assert_eq!(
            extract(raw).as_deref(),
            Some(r#"[{"event":"k","data":{"keys":["ctrl","]"]}}]"#)
        );
    }

    #[test]
    fn extract_gives_up_on_unbalanced_input() {
        assert_eq!(extract("no array here"), None);
        assert_eq!(extract("[{\"event\":\"x\""), None);
    }

    #[test]
    fn parse_repairs_trailing_comma() {
        let plan = parse("[{\"event\":\"x\",\"data\":{},}]").unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.actions()[0].event, "x");
    }

    #[test]
    fn parse_repairs_bare_keys_without_touching_quoted_ones() {
        let plan = parse(r#"Plan: [{event: "open", "data": {path: "/tmp/x"}, description: "Open it",},]"#)
            .unwrap();
        assert_eq!(plan.actions()[0].data, json!({"path": "/tmp/x"}));
        assert_eq!(plan.actions()[0].description.as_deref(), Some("Open it"));
    }

    #[test]
    fn parse_reports_each_failure_kind() {
        assert_eq!(parse("nothing useful"), Err(ParseError::NoArray));
        assert!(matches!(parse("[{\"event\": }]"), Err(ParseError::InvalidJson(_))));
        assert!(matches!(
            parse("[{\"description\": \"no event\", \"data\": {}}]"),
            Err(ParseError::InvalidStructure(_))
        ));
    }

    #[test]
    fn parse_accepts_empty_plan() {
        assert!(parse("[]").unwrap().is_empty());
    }

    #[test]
    fn validate_requires_event_and_data() {
        assert!(!validate(&json!([{"description": "no event"}])));
        assert!(validate(&json!([{"event": "x", "data": {}}])));
        assert!(!validate(&json!([{"event": "x"}])));
        assert!(!validate(&json!([{"event": "", "data": {}}])));
        assert!(!validate(&json!({"event": "x", "data": {}})));
        assert!(validate(&json!([])));
    }
}
