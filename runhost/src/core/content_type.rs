//! Content type inference for out-of-band result values.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

pub const JSON: &str = "application/json";
pub const TEXT: &str = "text/plain; charset=utf-8";
pub const HTML: &str = "text/html; charset=utf-8";
pub const XML: &str = "application/xml";

static XML_PROLOG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*<\?xml\b").expect("valid xml regex"));
static HTML_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*<(!doctype\s+html|html)\b").expect("valid html regex")
});

/// A result value ready to be sent as an HTTP body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedBody {
    pub content_type: &'static str,
    pub body: String,
}

/// Render `value`, choosing the content type from the declared result type
/// (`object`/`array` are JSON) or, failing that, by sniffing the content.
pub fn render_result(value: &Value, declared_type: Option<&str>) -> TypedBody {
    let text = match value {
        Value::String(text) => text,
        other => {
            return TypedBody {
                content_type: JSON,
                body: other.to_string(),
            };
        }
    };
    let content_type = match declared_type {
        Some("object") | Some("array") => JSON,
        _ => sniff(text),
    };
    TypedBody {
        content_type,
        body: text.clone(),
    }
}

fn sniff(text: &str) -> &'static str {
    let trimmed = text.trim_start();
    if (trimmed.starts_with('{') || trimmed.starts_with('['))
        && serde_json::from_str::<Value>(trimmed).is_ok()
    {
        return JSON;
    }
    if XML_PROLOG.is_match(text) {
        return XML;
    }
    if HTML_START.is_match(text) {
        return HTML;
    }
    TEXT
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_values_render_as_json() {
        let body = render_result(&json!({ "a": 1 }), None);
        assert_eq!(body.content_type, JSON);
        assert_eq!(body.body, r#"{"a":1}"#);
    }

    #[test]
    fn declared_type_wins_over_sniffing() {
        let body = render_result(&json!("not json at all"), Some("object"));
        assert_eq!(body.content_type, JSON);
    }

    #[test]
    fn strings_are_sniffed() {
        assert_eq!(render_result(&json!(" [1, 2]"), None).content_type, JSON);
        assert_eq!(render_result(&json!("<?xml version=\"1.0\"?><a/>"), None).content_type, XML);
        assert_eq!(render_result(&json!("<!DOCTYPE html><p>"), None).content_type, HTML);
        assert_eq!(render_result(&json!("{ broken"), None).content_type, TEXT);
        assert_eq!(render_result(&json!("plain"), Some("string")).content_type, TEXT);
    }
}
