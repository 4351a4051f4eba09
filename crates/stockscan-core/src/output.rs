//! Best-effort extraction of the trailing JSON result object from mixed
//! process output. The analysis scripts print log lines followed by one
//! final JSON value; failure output often ends in an object carrying an
//! `"error"` field.

use serde_json::Value;

/// Find the last well-formed JSON object that runs to the end of the text.
/// Candidate start positions are scanned backwards from the end, so log
/// noise before the final object is skipped; trailing noise after it means
/// there is no trailing object and the caller falls back to the raw tail.
pub fn extract_trailing_json(text: &str) -> Option<Value> {
    let trimmed = text.trim_end();
    let mut pos = trimmed.len();
    while let Some(start) = trimmed[..pos].rfind('{') {
        let candidate = &trimmed[start..];
        let mut stream = serde_json::Deserializer::from_str(candidate).into_iter::<Value>();
        if let Some(Ok(value)) = stream.next()
            && value.is_object()
            && candidate[stream.byte_offset()..].trim().is_empty()
        {
            return Some(value);
        }
        pos = start;
    }
    None
}

/// The `"error"` message embedded in a tool result, when present.
pub fn error_message(value: &Value) -> Option<&str> {
    value.get("error").and_then(Value::as_str)
}

/// Last `max_chars` characters of the text, for attaching raw output to a
/// failure message without flooding it.
pub fn tail_snippet(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        return trimmed.to_string();
    }
    let skipped: String = trimmed
        .chars()
        .skip(count - max_chars)
        .collect();
    format!("...{skipped}")
}

#[cfg(test)]
mod tests {
    use super::{error_message, extract_trailing_json, tail_snippet};

    #[test]
    fn object_after_log_lines_is_found() {
        let text = "fetching listings\nsaved 120/2600\n{\"status\": \"success\", \"count\": 2600}\n";
        let value = extract_trailing_json(text).expect("trailing object");
        assert_eq!(value["status"], "success");
        assert_eq!(value["count"], 2600);
    }

    #[test]
    fn nested_object_resolves_to_the_outer_one() {
        let text = "log\n{\"outer\": {\"inner\": 1}}";
        let value = extract_trailing_json(text).expect("trailing object");
        assert!(value.get("outer").is_some());
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_scan() {
        let text = "note: use {placeholders}\n{\"message\": \"a { b } c\"}";
        let value = extract_trailing_json(text).expect("trailing object");
        assert_eq!(value["message"], "a { b } c");
    }

    #[test]
    fn multi_line_object_is_found() {
        let text = "step done\n{\n  \"similar_stocks\": [\n    {\"symbol\": \"005930\"}\n  ]\n}";
        let value = extract_trailing_json(text).expect("trailing object");
        assert!(value["similar_stocks"].is_array());
    }

    #[test]
    fn text_without_object_yields_none() {
        assert!(extract_trailing_json("plain logs only\nno json here").is_none());
        assert!(extract_trailing_json("").is_none());
    }

    #[test]
    fn trailing_noise_after_object_yields_none() {
        assert!(extract_trailing_json("{\"ok\": true}\nmore logs after").is_none());
    }

    #[test]
    fn error_field_is_read_from_objects() {
        let value = extract_trailing_json("{\"error\": \"no data for symbol\"}").expect("object");
        assert_eq!(error_message(&value), Some("no data for symbol"));
        assert_eq!(error_message(&serde_json::json!({"ok": 1})), None);
    }

    #[test]
    fn tail_snippet_truncates_from_the_front() {
        assert_eq!(tail_snippet("short", 10), "short");
        let long = "a".repeat(20) + "TAIL";
        let snippet = tail_snippet(&long, 8);
        assert!(snippet.starts_with("..."));
        assert!(snippet.ends_with("TAIL"));
    }
}
