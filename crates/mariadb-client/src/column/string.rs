//! Numeric and JSON fallbacks for character columns and DECIMAL literals.

use mariadb_core::{DecodeError, Value};

use super::float;

/// Parse an integer literal. Decimal literals are truncated toward zero;
/// exponent notation goes through floating point.
pub fn parse_integer(
    text: &str,
    type_name: &'static str,
    target: &'static str,
) -> Result<i128, DecodeError> {
    let text = text.trim();
    if let Ok(v) = text.parse::<i128>() {
        return Ok(v);
    }
    if text.contains(['e', 'E']) {
        let v = parse_float(text, type_name, target)?;
        return float::to_integer(v, type_name, target);
    }
    let Some((whole, fraction)) = text.split_once('.') else {
        return Err(DecodeError::unparseable(type_name, target, text));
    };
    if !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DecodeError::unparseable(type_name, target, text));
    }
    match whole {
        "" | "+" | "-" if !fraction.is_empty() => Ok(0),
        _ => whole
            .parse::<i128>()
            .map_err(|_| DecodeError::unparseable(type_name, target, text)),
    }
}

pub fn parse_float(
    text: &str,
    type_name: &'static str,
    target: &'static str,
) -> Result<f64, DecodeError> {
    let text = text.trim();
    text.parse::<f64>()
        .map_err(|_| DecodeError::unparseable(type_name, target, text))
}

/// Boolean reading of a character value: empty, `0` and `false` are false,
/// `1` and `true` are true, other numbers are true when non-zero.
pub fn parse_bool(text: &str) -> Option<bool> {
    let text = text.trim();
    if text.is_empty() || text == "0" || text.eq_ignore_ascii_case("false") {
        return Some(false);
    }
    if text == "1" || text.eq_ignore_ascii_case("true") {
        return Some(true);
    }
    text.parse::<f64>().ok().map(|v| v != 0.0)
}

/// JSON documents map to [`Value::Json`]; malformed ones are kept as text.
pub fn json_value(raw: &[u8]) -> Value {
    match serde_json::from_slice(raw) {
        Ok(doc) => Value::Json(doc),
        Err(e) => {
            tracing::debug!(error = %e, "JSON column is not valid JSON, returning text");
            Value::Text(String::from_utf8_lossy(raw).into_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_integer_forms() {
        assert_eq!(parse_integer(" 17 ", "VARCHAR", "i64").unwrap(), 17);
        assert_eq!(parse_integer("12.75", "DECIMAL", "i64").unwrap(), 12);
        assert_eq!(parse_integer("-3.9", "DECIMAL", "i64").unwrap(), -3);
        assert_eq!(parse_integer("-.5", "DECIMAL", "i64").unwrap(), 0);
        assert_eq!(parse_integer("1.5e3", "VARCHAR", "i64").unwrap(), 1500);
        assert!(parse_integer("abc", "VARCHAR", "i64").is_err());
        assert!(parse_integer("1.2.3", "VARCHAR", "i64").is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool(""), Some(false));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("FALSE"), Some(false));
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("-2"), Some(true));
        assert_eq!(parse_bool("0.0"), Some(false));
        assert_eq!(parse_bool("yes"), None);
    }

    #[test]
    fn test_json_fallback() {
        assert_eq!(json_value(br#"{"a":1}"#), Value::Json(serde_json::json!({"a": 1})));
        assert_eq!(json_value(b"{oops"), Value::Text("{oops".to_string()));
    }
}
