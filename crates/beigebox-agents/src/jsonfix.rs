//! Forgiving JSON recovery for LLM output.
//!
//! Small models wrap JSON in fences, leave trailing commas, prepend
//! prose, or get truncated mid-object. The ladder tries, in order:
//!
//! 1. the text verbatim
//! 2. with ```json / ``` fences stripped
//! 3. with trailing commas in objects/arrays repaired
//! 4. the first balanced `{…}` block extracted from surrounding prose
//! 5. truncation repair: close however many `{` are left unmatched
//!
//! and finally falls back to a caller-provided default shape.

use serde_json::Value;

/// Run the full ladder; on total failure return `fallback`.
pub fn recover_json(raw: &str, fallback: Value) -> Value {
    try_recover_json(raw).unwrap_or(fallback)
}

/// Run the full ladder; `None` when nothing parses.
pub fn try_recover_json(raw: &str) -> Option<Value> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }

    // 1. Verbatim
    if let Ok(v) = serde_json::from_str(text) {
        return Some(v);
    }

    // 2. Fences stripped
    let unfenced = strip_fences(text);
    if let Ok(v) = serde_json::from_str(&unfenced) {
        return Some(v);
    }

    // 3. Trailing commas repaired
    let decommaed = repair_trailing_commas(&unfenced);
    if let Ok(v) = serde_json::from_str(&decommaed) {
        return Some(v);
    }

    // 4. First balanced {…} block
    if let Some(block) = extract_balanced_object(&unfenced) {
        if let Ok(v) = serde_json::from_str(&block) {
            return Some(v);
        }
        if let Ok(v) = serde_json::from_str(&repair_trailing_commas(&block)) {
            return Some(v);
        }
    }

    // 5. Truncation repair: append closers for unmatched opening braces
    if let Some(repaired) = close_unmatched_braces(&unfenced) {
        if let Ok(v) = serde_json::from_str(&repaired) {
            return Some(v);
        }
        if let Ok(v) = serde_json::from_str(&repair_trailing_commas(&repaired)) {
            return Some(v);
        }
    }

    None
}

fn strip_fences(text: &str) -> String {
    if !text.contains("```") {
        return text.to_string();
    }
    text.lines()
        .filter(|l| !l.trim().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Remove commas immediately before a closing `}` or `]`, outside strings.
fn repair_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = text.chars().collect();

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                // Drop the comma if the next non-whitespace closes a scope
                let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Extract the first `{…}` block with balanced braces, string-aware.
fn extract_balanced_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + c.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// For truncated output: take from the first `{`, count unmatched opening
/// braces outside strings, and append that many closers. An unterminated
/// string gets its quote closed first.
fn close_unmatched_braces(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut fragment = text[start..].trim_end().to_string();

    let mut depth: i64 = 0;
    let mut in_string = false;
    let mut escaped = false;
    for c in fragment.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => depth -= 1,
            _ => {}
        }
    }
    if depth <= 0 {
        return None;
    }

    if in_string {
        fragment.push('"');
    }
    // A dangling comma or colon before the closers would still fail
    while fragment.ends_with(',') || fragment.ends_with(':') {
        fragment.pop();
    }
    for _ in 0..depth {
        fragment.push('}');
    }
    Some(fragment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step1_verbatim() {
        assert_eq!(
            try_recover_json(r#"{"action": "finish"}"#).unwrap(),
            json!({"action": "finish"})
        );
    }

    #[test]
    fn step2_fenced() {
        let raw = "```json\n{\"action\": \"dispatch\", \"tasks\": []}\n```";
        assert_eq!(
            try_recover_json(raw).unwrap(),
            json!({"action": "dispatch", "tasks": []})
        );
    }

    #[test]
    fn step3_trailing_commas() {
        let raw = r#"{"tasks": [{"target": "operator",}, ], "action": "dispatch",}"#;
        let v = try_recover_json(raw).unwrap();
        assert_eq!(v["action"], "dispatch");
        assert_eq!(v["tasks"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn step4_prose_wrapped_object() {
        let raw = "Sure! Here's my plan:\n{\"action\": \"finish\", \"answer\": \"42\"}\nHope that helps.";
        assert_eq!(try_recover_json(raw).unwrap()["answer"], "42");
    }

    #[test]
    fn step4_respects_braces_inside_strings() {
        let raw = r#"noise {"answer": "use {braces} carefully"} trailing"#;
        assert_eq!(try_recover_json(raw).unwrap()["answer"], "use {braces} carefully");
    }

    #[test]
    fn step5_truncated_object_is_closed() {
        let raw = r#"{"action": "dispatch", "tasks": [], "nested": {"a": 1"#;
        let v = try_recover_json(raw).unwrap();
        assert_eq!(v["action"], "dispatch");
        assert_eq!(v["nested"]["a"], 1);
    }

    #[test]
    fn step5_truncated_mid_string() {
        let raw = r#"{"action": "finish", "answer": "partial answ"#;
        let v = try_recover_json(raw).unwrap();
        assert_eq!(v["action"], "finish");
    }

    #[test]
    fn hopeless_input_falls_back() {
        let fallback = json!({"action": "continue"});
        assert_eq!(recover_json("no json here at all", fallback.clone()), fallback);
        assert_eq!(recover_json("", fallback.clone()), fallback);
    }
}
