//! Integer column decoding.

use mariadb_core::{DecodeError, Value};

use super::WireFormat;

/// Storage width of an integer column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntWidth {
    /// TINYINT
    Tiny,
    /// SMALLINT
    Short,
    /// MEDIUMINT
    Medium,
    /// INT
    Long,
    /// BIGINT
    LongLong,
}

impl IntWidth {
    /// Bytes used in a binary protocol row. MEDIUMINT travels as 4 bytes.
    pub const fn binary_len(self) -> usize {
        match self {
            IntWidth::Tiny => 1,
            IntWidth::Short => 2,
            IntWidth::Medium | IntWidth::Long => 4,
            IntWidth::LongLong => 8,
        }
    }

    pub const fn type_name(self, unsigned: bool) -> &'static str {
        match (self, unsigned) {
            (IntWidth::Tiny, false) => "TINYINT",
            (IntWidth::Tiny, true) => "TINYINT UNSIGNED",
            (IntWidth::Short, false) => "SMALLINT",
            (IntWidth::Short, true) => "SMALLINT UNSIGNED",
            (IntWidth::Medium, false) => "MEDIUMINT",
            (IntWidth::Medium, true) => "MEDIUMINT UNSIGNED",
            (IntWidth::Long, false) => "INT",
            (IntWidth::Long, true) => "INT UNSIGNED",
            (IntWidth::LongLong, false) => "BIGINT",
            (IntWidth::LongLong, true) => "BIGINT UNSIGNED",
        }
    }
}

/// Decode the raw bytes of an integer column into a wide integer.
pub fn decode(
    raw: &[u8],
    format: WireFormat,
    width: IntWidth,
    unsigned: bool,
    type_name: &'static str,
    target: &'static str,
) -> Result<i128, DecodeError> {
    match format {
        WireFormat::Text => {
            let text = std::str::from_utf8(raw).map_err(|_| {
                DecodeError::unparseable(type_name, target, String::from_utf8_lossy(raw))
            })?;
            text.trim()
                .parse::<i128>()
                .map_err(|_| DecodeError::unparseable(type_name, target, text))
        }
        WireFormat::Binary => {
            if raw.len() != width.binary_len() {
                return Err(DecodeError::unparseable(
                    type_name,
                    target,
                    format!("{} bytes", raw.len()),
                ));
            }
            let mut buf = [0u8; 8];
            buf[..raw.len()].copy_from_slice(raw);
            let bits = u64::from_le_bytes(buf);
            if unsigned {
                return Ok(i128::from(bits));
            }
            // sign-extend from the stored width
            let shift = 64 - 8 * raw.len() as u32;
            Ok(i128::from(((bits << shift) as i64) >> shift))
        }
    }
}

/// Map an integer to the smallest [`Value`] variant covering its column type.
pub fn value(
    v: i128,
    width: IntWidth,
    unsigned: bool,
    type_name: &'static str,
) -> Result<Value, DecodeError> {
    let overflow = || DecodeError::overflow(type_name, "Value", v);
    Ok(match (width, unsigned) {
        (IntWidth::Tiny, false) => Value::TinyInt(i8::try_from(v).map_err(|_| overflow())?),
        (IntWidth::Tiny, true) | (IntWidth::Short, false) => {
            Value::SmallInt(i16::try_from(v).map_err(|_| overflow())?)
        }
        (IntWidth::Short, true) | (IntWidth::Medium, _) | (IntWidth::Long, false) => {
            Value::Int(i32::try_from(v).map_err(|_| overflow())?)
        }
        (IntWidth::Long, true) | (IntWidth::LongLong, false) => {
            Value::BigInt(i64::try_from(v).map_err(|_| overflow())?)
        }
        (IntWidth::LongLong, true) => {
            Value::UnsignedBigInt(u64::try_from(v).map_err(|_| overflow())?)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_sign_extension() {
        let v = decode(&[0xFF], WireFormat::Binary, IntWidth::Tiny, false, "TINYINT", "i64");
        assert_eq!(v.unwrap(), -1);
        let v = decode(&[0xFF], WireFormat::Binary, IntWidth::Tiny, true, "TINYINT", "i64");
        assert_eq!(v.unwrap(), 255);
        let v = decode(
            &[0xFE, 0xFF, 0xFF, 0xFF],
            WireFormat::Binary,
            IntWidth::Medium,
            false,
            "MEDIUMINT",
            "i64",
        );
        assert_eq!(v.unwrap(), -2);
        let raw = u64::MAX.to_le_bytes();
        let v = decode(&raw, WireFormat::Binary, IntWidth::LongLong, true, "BIGINT", "u64");
        assert_eq!(v.unwrap(), i128::from(u64::MAX));
    }

    #[test]
    fn test_text_and_wrong_length() {
        let v = decode(b"-42", WireFormat::Text, IntWidth::Long, false, "INT", "i32");
        assert_eq!(v.unwrap(), -42);
        assert!(decode(b"4x", WireFormat::Text, IntWidth::Long, false, "INT", "i32").is_err());
        assert!(decode(&[1, 2], WireFormat::Binary, IntWidth::Long, false, "INT", "i32").is_err());
    }

    #[test]
    fn test_value_mapping() {
        assert_eq!(value(200, IntWidth::Tiny, true, "TINYINT").unwrap(), Value::SmallInt(200));
        assert_eq!(
            value(i128::from(u32::MAX), IntWidth::Long, true, "INT").unwrap(),
            Value::BigInt(i64::from(u32::MAX))
        );
        assert_eq!(
            value(i128::from(u64::MAX), IntWidth::LongLong, true, "BIGINT").unwrap(),
            Value::UnsignedBigInt(u64::MAX)
        );
        assert!(value(300, IntWidth::Tiny, false, "TINYINT").is_err());
    }
}
