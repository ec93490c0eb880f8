//! Tolerant JSON extraction from model replies.
//!
//! Models are asked for bare JSON but routinely wrap it in code fences or
//! prose. Extraction tries the raw text, then a fenced block, then the
//! outermost brace span.

pub(crate) fn extract_json(content: &str) -> Option<serde_json::Value> {
    let trimmed = content.trim();

    if let Ok(v) = serde_json::from_str(trimmed) {
        return Some(v);
    }

    if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        if let Some(end) = rest.find("```") {
            if let Ok(v) = serde_json::from_str(rest[..end].trim()) {
                return Some(v);
            }
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if start >= end {
        return None;
    }
    serde_json::from_str(trimmed[start..=end].trim()).ok()
}

/// Strip a surrounding code fence (with optional language tag) from a model
/// reply, leaving the body untouched when there is no fence.
pub(crate) fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    rest.strip_suffix("```").map(str::trim_end).unwrap_or(rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn bare_json_parses() {
        let v = extract_json(r#"{"a": 1}"#).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn fenced_json_parses() {
        let v = extract_json("Here you go:\n```json\n{\"a\": 2}\n```\nEnjoy!").unwrap();
        assert_eq!(v["a"], 2);
    }

    #[test]
    fn embedded_json_parses() {
        let v = extract_json("The answer is {\"a\": 3} as requested.").unwrap();
        assert_eq!(v["a"], 3);
    }

    #[test]
    fn prose_is_none() {
        assert!(extract_json("no structure here").is_none());
    }

    #[test]
    fn fence_stripping() {
        assert_eq!(strip_code_fence("```python\nprint(1)\n```"), "print(1)");
        assert_eq!(strip_code_fence("print(1)"), "print(1)");
    }
}
