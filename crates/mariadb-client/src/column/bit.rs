//! BIT columns. Both wire formats carry the raw big-endian bytes.

use mariadb_core::DecodeError;

pub fn to_u64(raw: &[u8], type_name: &'static str, target: &'static str) -> Result<u64, DecodeError> {
    let significant = raw
        .iter()
        .position(|b| *b != 0)
        .map_or(&raw[raw.len()..], |i| &raw[i..]);
    if significant.len() > 8 {
        return Err(DecodeError::overflow(type_name, target, to_literal(raw)));
    }
    Ok(significant
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

pub fn to_bool(raw: &[u8]) -> bool {
    raw.iter().any(|b| *b != 0)
}

/// Render as `b'1011'`, suppressing leading zero bits.
pub fn to_literal(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len() * 8 + 3);
    out.push_str("b'");
    let mut started = false;
    for byte in raw {
        for shift in (0..8).rev() {
            let set = (byte >> shift) & 1 == 1;
            if set {
                started = true;
            }
            if started {
                out.push(if set { '1' } else { '0' });
            }
        }
    }
    if !started {
        out.push('0');
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_literal() {
        assert_eq!(to_literal(&[0x00, 0x05]), "b'101'");
        assert_eq!(to_literal(&[0x01, 0x00]), "b'100000000'");
        assert_eq!(to_literal(&[0x00]), "b'0'");
        assert_eq!(to_literal(&[]), "b'0'");
    }

    #[test]
    fn test_bit_numeric() {
        assert_eq!(to_u64(&[0x01, 0x02], "BIT", "u64").unwrap(), 0x0102);
        assert_eq!(to_u64(&[0xFF; 8], "BIT", "u64").unwrap(), u64::MAX);
        assert_eq!(to_u64(&[0, 0, 0, 0, 0, 0, 0, 0, 1], "BIT", "u64").unwrap(), 1);
        assert!(to_bool(&[0, 1]));
        assert!(!to_bool(&[0, 0]));
    }
}
