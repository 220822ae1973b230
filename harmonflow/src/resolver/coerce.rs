//! Type coercion for fully resolved string values.

use regex::Regex;
use serde_json::{Number, Value};
use std::sync::LazyLock;

static INTEGER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?[0-9]+$").expect("valid integer regex"));

static DECIMAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[+-]?([0-9]+\.[0-9]*|\.[0-9]+|[0-9]+)([eE][+-]?[0-9]+)?$")
        .expect("valid decimal regex")
});

/// Coerces a string into a typed value.
///
/// Rules, in order: boolean words, integers, decimals, comma-separated lists
/// (unless the string looks like a path or URL), otherwise the string itself.
/// Integers with a leading zero (`"007"`) stay strings, since they are
/// usually identifiers.
#[must_use]
pub fn coerce_str(raw: &str) -> Value {
    let trimmed = raw.trim();

    if let Some(b) = parse_bool(trimmed) {
        return Value::Bool(b);
    }

    if INTEGER.is_match(trimmed) {
        if has_leading_zero(trimmed) {
            return Value::String(raw.to_string());
        }
        if let Ok(n) = trimmed.parse::<i64>() {
            return Value::Number(n.into());
        }
        return Value::String(raw.to_string());
    }

    if DECIMAL.is_match(trimmed) {
        if let Some(n) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
            return Value::Number(n);
        }
    }

    if trimmed.contains(',') && !looks_like_path(trimmed) {
        return Value::Array(
            trimmed
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| Value::String(s.to_string()))
                .collect(),
        );
    }

    Value::String(raw.to_string())
}

/// Coerces a value; non-strings pass through unchanged.
#[must_use]
pub fn coerce_value(value: Value) -> Value {
    match value {
        Value::String(s) => coerce_str(&s),
        other => other,
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Some(true),
        "false" | "no" | "0" | "off" => Some(false),
        _ => None,
    }
}

fn has_leading_zero(s: &str) -> bool {
    let digits = s.trim_start_matches(['+', '-']);
    digits.len() > 1 && digits.starts_with('0')
}

fn looks_like_path(s: &str) -> bool {
    s.contains('/') || s.contains('\\') || s.contains("://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_booleans_case_insensitive() {
        for s in ["true", "TRUE", "Yes", "on", "1"] {
            assert_eq!(coerce_str(s), json!(true), "{s}");
        }
        for s in ["false", "No", "OFF", "0"] {
            assert_eq!(coerce_str(s), json!(false), "{s}");
        }
    }

    #[test]
    fn test_numbers() {
        assert_eq!(coerce_str("42"), json!(42));
        assert_eq!(coerce_str("-17"), json!(-17));
        assert_eq!(coerce_str("0.75"), json!(0.75));
        assert_eq!(coerce_str("1e3"), json!(1000.0));
    }

    #[test]
    fn test_leading_zero_stays_string() {
        assert_eq!(coerce_str("007"), json!("007"));
        assert_eq!(coerce_str("00123"), json!("00123"));
    }

    #[test]
    fn test_comma_list() {
        assert_eq!(coerce_str("a, b ,c"), json!(["a", "b", "c"]));
        assert_eq!(coerce_str("1,2"), json!(["1", "2"]));
    }

    #[test]
    fn test_paths_and_urls_are_not_lists() {
        assert_eq!(coerce_str("/data/a,b.csv"), json!("/data/a,b.csv"));
        assert_eq!(coerce_str("http://x?a=1,2"), json!("http://x?a=1,2"));
    }

    #[test]
    fn test_plain_string_unchanged() {
        assert_eq!(coerce_str("P12345"), json!("P12345"));
        assert_eq!(coerce_str(""), json!(""));
    }

    #[test]
    fn test_coercion_is_idempotent() {
        for raw in ["true", "42", "0.5", "a,b", "text"] {
            let once = coerce_str(raw);
            let twice = coerce_value(once.clone());
            assert_eq!(once, twice, "{raw}");
        }
    }
}
