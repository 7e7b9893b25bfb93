//! FLOAT and DOUBLE decoding.

use mariadb_core::DecodeError;

use super::WireFormat;

/// Decode a FLOAT (`double == false`) or DOUBLE column to `f64`.
pub fn decode(
    raw: &[u8],
    format: WireFormat,
    double: bool,
    type_name: &'static str,
    target: &'static str,
) -> Result<f64, DecodeError> {
    match format {
        WireFormat::Text => {
            let text = std::str::from_utf8(raw).map_err(|_| {
                DecodeError::unparseable(type_name, target, String::from_utf8_lossy(raw))
            })?;
            text.trim()
                .parse::<f64>()
                .map_err(|_| DecodeError::unparseable(type_name, target, text))
        }
        WireFormat::Binary => match (double, raw.len()) {
            (false, 4) => Ok(f64::from(f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))),
            (true, 8) => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(raw);
                Ok(f64::from_le_bytes(buf))
            }
            (_, n) => Err(DecodeError::unparseable(type_name, target, format!("{} bytes", n))),
        },
    }
}

/// Truncate toward zero. Non-finite values and magnitudes beyond the wide
/// integer range are overflows.
#[allow(clippy::cast_possible_truncation)]
pub fn to_integer(
    value: f64,
    type_name: &'static str,
    target: &'static str,
) -> Result<i128, DecodeError> {
    // 2^127
    const LIMIT: f64 = 170_141_183_460_469_231_731_687_303_715_884_105_728.0;
    let truncated = value.trunc();
    if !truncated.is_finite() || truncated >= LIMIT || truncated < -LIMIT {
        return Err(DecodeError::overflow(type_name, target, value));
    }
    Ok(truncated as i128)
}

/// Textual rendering; the text protocol literal is returned as sent.
pub fn to_string(raw: &[u8], format: WireFormat, double: bool) -> String {
    match format {
        WireFormat::Text => String::from_utf8_lossy(raw).into_owned(),
        WireFormat::Binary => {
            if !double && raw.len() == 4 {
                f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]).to_string()
            } else if raw.len() == 8 {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(raw);
                f64::from_le_bytes(buf).to_string()
            } else {
                hex::encode(raw)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_float_and_double() {
        let raw = 1.5f32.to_le_bytes();
        assert_eq!(decode(&raw, WireFormat::Binary, false, "FLOAT", "f64").unwrap(), 1.5);
        assert_eq!(to_string(&raw, WireFormat::Binary, false), "1.5");
        let raw = (-2.25f64).to_le_bytes();
        assert_eq!(decode(&raw, WireFormat::Binary, true, "DOUBLE", "f64").unwrap(), -2.25);
        assert!(decode(&raw[..4], WireFormat::Binary, true, "DOUBLE", "f64").is_err());
    }

    #[test]
    fn test_to_integer_truncates() {
        assert_eq!(to_integer(12.9, "DOUBLE", "i64").unwrap(), 12);
        assert_eq!(to_integer(-12.9, "DOUBLE", "i64").unwrap(), -12);
        assert!(to_integer(f64::NAN, "DOUBLE", "i64").is_err());
        assert!(to_integer(1e40, "DOUBLE", "i64").is_err());
    }
}
