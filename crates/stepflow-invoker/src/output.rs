use serde_json::Value;

use stepflow_core::types::ContextMap;

/// Extract a context update from a step's standard output.
///
/// The last line holding a JSON object wins, so steps may print progress
/// before their result. If no single line qualifies, the whole output is
/// tried (pretty-printed objects). Anything else yields an empty update and
/// a warning; empty output is silently an empty update.
pub fn parse_output(stdout: &str) -> (ContextMap, Option<String>) {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return (ContextMap::new(), None);
    }

    for line in trimmed.lines().rev() {
        let line = line.trim();
        if !(line.starts_with('{') && line.ends_with('}')) {
            continue;
        }
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(line) {
            return (map.into_iter().collect(), None);
        }
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => (map.into_iter().collect(), None),
        Ok(other) => (
            ContextMap::new(),
            Some(format!("step printed JSON {} instead of an object", json_type(&other))),
        ),
        Err(_) => (
            ContextMap::new(),
            Some("no valid JSON object found in step output".to_string()),
        ),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_last_json_line_wins() {
        let out = "starting\n{\"n\": 1}\nworking...\n{\"result\": \"ok\", \"n\": 2}\n";
        let (update, warning) = parse_output(out);
        assert!(warning.is_none());
        assert_eq!(update.get("result"), Some(&json!("ok")));
        assert_eq!(update.get("n"), Some(&json!(2)));
    }

    #[test]
    fn test_pretty_printed_object() {
        let out = "{\n  \"a\": [1, 2],\n  \"b\": null\n}\n";
        let (update, warning) = parse_output(out);
        assert!(warning.is_none());
        assert_eq!(update.get("a"), Some(&json!([1, 2])));
        assert_eq!(update.get("b"), Some(&Value::Null));
    }

    #[test]
    fn test_plain_text_warns() {
        let (update, warning) = parse_output("hello world\n");
        assert!(update.is_empty());
        assert!(warning.unwrap().contains("no valid JSON"));
    }

    #[test]
    fn test_non_object_json_warns() {
        let (update, warning) = parse_output("[1, 2, 3]");
        assert!(update.is_empty());
        assert!(warning.unwrap().contains("array"));
    }

    #[test]
    fn test_empty_output_is_silent() {
        let (update, warning) = parse_output("  \n\n");
        assert!(update.is_empty());
        assert!(warning.is_none());
    }

    #[test]
    fn test_braced_line_that_is_not_json_is_skipped() {
        let out = "{\"x\": 5}\n{not json}\n";
        let (update, warning) = parse_output(out);
        assert!(warning.is_none());
        assert_eq!(update.get("x"), Some(&json!(5)));
    }
}
