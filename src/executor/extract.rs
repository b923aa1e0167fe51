use regex::Regex;
use serde_json::Value as JsonValue;

/// Strips an optional fenced block from an LLM reply. Any fence language is
/// accepted; unfenced source passes through trimmed.
pub fn extract_code(reply: &str) -> String {
    let trimmed = reply.trim();
    let re_start = Regex::new(r"^\s*```[\w+-]*\s*\n?").expect("static regex");
    let re_end = Regex::new(r"\n?```\s*$").expect("static regex");

    let start = re_start
        .find(trimmed)
        .map(|m| m.end())
        .unwrap_or(0);
    let end = re_end
        .find(trimmed)
        .map(|m| m.start())
        .unwrap_or(trimmed.len());
    if start <= end {
        trimmed[start..end].trim().to_string()
    } else {
        trimmed.to_string()
    }
}

/// Pulls a JSON document out of a reply: fenced, bare, or embedded in prose
/// (first `{`/`[` to the matching end).
pub fn extract_json(reply: &str) -> Result<JsonValue, serde_json::Error> {
    let code = extract_code(reply);
    if let Ok(parsed) = serde_json::from_str(&code) {
        return Ok(parsed);
    }
    let bytes = code.as_bytes();
    let start = bytes
        .iter()
        .position(|b| *b == b'{' || *b == b'[')
        .unwrap_or(0);
    let end = bytes
        .iter()
        .rposition(|b| *b == b'}' || *b == b']')
        .map(|i| i + 1)
        .unwrap_or(bytes.len());
    if start < end {
        serde_json::from_str(&code[start..end])
    } else {
        serde_json::from_str(&code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn strips_clojure_fences() {
        let reply = indoc! {r#"
            ```clojure
            (+ 1 2)
            ```
        "#};
        assert_eq!(extract_code(reply), "(+ 1 2)");
    }

    #[test]
    fn accepts_any_fence_language_or_none() {
        assert_eq!(extract_code("```lisp\n(f)\n```"), "(f)");
        assert_eq!(extract_code("```\n(f)\n```"), "(f)");
        assert_eq!(extract_code("(f)"), "(f)");
    }

    #[test]
    fn extracts_json_from_prose() {
        let reply = r#"Here is the result: {"value": 1.5} as requested."#;
        assert_eq!(
            extract_json(reply).unwrap(),
            serde_json::json!({"value": 1.5})
        );
    }

    #[test]
    fn extracts_fenced_json_arrays() {
        let reply = "```json\n[1, 2, 3]\n```";
        assert_eq!(extract_json(reply).unwrap(), serde_json::json!([1, 2, 3]));
    }
}
