//! DATE, TIME, DATETIME, TIMESTAMP and YEAR decoding.
//!
//! Binary rows carry temporal values as a length byte followed by packed
//! components:
//! - DATE/DATETIME/TIMESTAMP: 0, 4, 7 or 11 bytes
//!   (`year u16, month, day [, hour, minute, second [, micros u32]]`)
//! - TIME: 0, 8 or 12 bytes
//!   (`negative, days u32, hour, minute, second [, micros u32]`)
//!
//! A zero length is the all-zero value.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use mariadb_core::DecodeError;

use super::{ColumnDecoder, WireFormat};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct DateParts {
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
    micros: u32,
}

impl DateParts {
    fn is_zero_date(&self) -> bool {
        self.year == 0 && self.month == 0 && self.day == 0
    }

    fn from_binary(raw: &[u8]) -> Option<Self> {
        let mut parts = DateParts::default();
        match raw.len() {
            0 => return Some(parts),
            4 | 7 | 11 => {}
            _ => return None,
        }
        parts.year = u16::from_le_bytes([raw[0], raw[1]]);
        parts.month = raw[2];
        parts.day = raw[3];
        if raw.len() >= 7 {
            parts.hour = raw[4];
            parts.minute = raw[5];
            parts.second = raw[6];
        }
        if raw.len() == 11 {
            parts.micros = u32::from_le_bytes([raw[7], raw[8], raw[9], raw[10]]);
        }
        Some(parts)
    }

    fn date(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(i32::from(self.year), u32::from(self.month), u32::from(self.day))
    }

    fn datetime(&self) -> Option<NaiveDateTime> {
        self.date()?.and_hms_micro_opt(
            u32::from(self.hour),
            u32::from(self.minute),
            u32::from(self.second),
            self.micros,
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct TimeParts {
    negative: bool,
    days: u32,
    hour: u8,
    minute: u8,
    second: u8,
    micros: u32,
}

impl TimeParts {
    fn from_binary(raw: &[u8]) -> Option<Self> {
        let mut parts = TimeParts::default();
        match raw.len() {
            0 => return Some(parts),
            8 | 12 => {}
            _ => return None,
        }
        parts.negative = raw[0] != 0;
        parts.days = u32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]);
        parts.hour = raw[5];
        parts.minute = raw[6];
        parts.second = raw[7];
        if raw.len() == 12 {
            parts.micros = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
        }
        Some(parts)
    }

    fn span(&self) -> TimeDelta {
        let seconds = i64::from(self.days) * 86_400
            + i64::from(self.hour) * 3_600
            + i64::from(self.minute) * 60
            + i64::from(self.second);
        let span = TimeDelta::seconds(seconds) + TimeDelta::microseconds(i64::from(self.micros));
        if self.negative { -span } else { span }
    }
}

fn utf8<'a>(
    raw: &'a [u8],
    type_name: &'static str,
    target: &'static str,
) -> Result<&'a str, DecodeError> {
    std::str::from_utf8(raw)
        .map_err(|_| DecodeError::unparseable(type_name, target, String::from_utf8_lossy(raw)))
}

fn malformed(raw: &[u8], type_name: &'static str, target: &'static str) -> DecodeError {
    DecodeError::unparseable(type_name, target, format!("{} byte value {}", raw.len(), hex::encode(raw)))
}

/// True for the zero date `0000-00-00`, alone or followed by a time part.
fn is_zero_date_literal(text: &str) -> bool {
    text.strip_prefix("0000-00-00")
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(|c| c == ' ' || c == 'T'))
}

/// Fractional seconds beyond microseconds.
fn has_excess_fraction(text: &str) -> bool {
    text.rsplit_once('.').is_some_and(|(_, fraction)| fraction.len() > 6)
}

/// Fraction digits to render for a column with `decimals` declared.
/// Values above 6 mean "not fixed".
fn fraction_digits(decimals: u8, micros: u32) -> usize {
    match decimals {
        0..=6 => usize::from(decimals),
        _ if micros != 0 => 6,
        _ => 0,
    }
}

fn push_fraction(out: &mut String, micros: u32, digits: usize) {
    if digits > 0 {
        let full = format!("{:06}", micros);
        out.push('.');
        out.push_str(&full[..digits]);
    }
}

/// Pad or truncate the fractional seconds of a text literal.
fn adjust_text_fraction(literal: &str, decimals: u8) -> String {
    if decimals > 6 {
        return literal.to_string();
    }
    let (base, fraction) = literal.split_once('.').unwrap_or((literal, ""));
    let digits = usize::from(decimals);
    let mut out = String::with_capacity(base.len() + digits + 1);
    out.push_str(base);
    if digits > 0 {
        out.push('.');
        out.extend(fraction.chars().chain(std::iter::repeat('0')).take(digits));
    }
    out
}

/// Decode YEAR, applying the two-digit pivot for YEAR(2) columns.
pub fn year(
    raw: &[u8],
    format: WireFormat,
    length: u32,
    type_name: &'static str,
    target: &'static str,
) -> Result<u16, DecodeError> {
    let value = match format {
        WireFormat::Text => {
            let text = utf8(raw, type_name, target)?;
            text.trim()
                .parse::<u16>()
                .map_err(|_| DecodeError::unparseable(type_name, target, text))?
        }
        WireFormat::Binary => match raw {
            [lo, hi] => u16::from_le_bytes([*lo, *hi]),
            _ => return Err(malformed(raw, type_name, target)),
        },
    };
    if length == 2 && value < 100 {
        return Ok(if value <= 69 { value + 2000 } else { value + 1900 });
    }
    Ok(value)
}

/// January 1st of `year`; the zero year has no date.
pub fn year_to_date(year: u16) -> Option<NaiveDate> {
    if year == 0 {
        return None;
    }
    NaiveDate::from_ymd_opt(i32::from(year), 1, 1)
}

/// Literal of a binary YEAR value, two digits for YEAR(2).
pub fn year_literal(
    raw: &[u8],
    length: u32,
    type_name: &'static str,
    target: &'static str,
) -> Result<String, DecodeError> {
    let [lo, hi] = raw else {
        return Err(malformed(raw, type_name, target));
    };
    let value = u16::from_le_bytes([*lo, *hi]);
    if length == 2 {
        Ok(format!("{:02}", value % 100))
    } else {
        Ok(format!("{:04}", value))
    }
}

/// Render a temporal column as text. Zero values render as their zero
/// literal rather than failing.
pub fn to_string(
    raw: &[u8],
    decoder: ColumnDecoder,
    decimals: u8,
    format: WireFormat,
    target: &'static str,
) -> Result<String, DecodeError> {
    let type_name = decoder.type_name();
    if format == WireFormat::Text {
        let literal = utf8(raw, type_name, target)?;
        return Ok(match decoder {
            ColumnDecoder::Date => literal.to_string(),
            _ => adjust_text_fraction(literal, decimals),
        });
    }

    match decoder {
        ColumnDecoder::Date => {
            let p = DateParts::from_binary(raw).ok_or_else(|| malformed(raw, type_name, target))?;
            Ok(format!("{:04}-{:02}-{:02}", p.year, p.month, p.day))
        }
        ColumnDecoder::DateTime { .. } => {
            let p = DateParts::from_binary(raw).ok_or_else(|| malformed(raw, type_name, target))?;
            let mut out = format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                p.year, p.month, p.day, p.hour, p.minute, p.second
            );
            push_fraction(&mut out, p.micros, fraction_digits(decimals, p.micros));
            Ok(out)
        }
        ColumnDecoder::Time => {
            let p = TimeParts::from_binary(raw).ok_or_else(|| malformed(raw, type_name, target))?;
            let hours = u64::from(p.days) * 24 + u64::from(p.hour);
            let mut out = format!(
                "{}{:02}:{:02}:{:02}",
                if p.negative { "-" } else { "" },
                hours,
                p.minute,
                p.second
            );
            push_fraction(&mut out, p.micros, fraction_digits(decimals, p.micros));
            Ok(out)
        }
        _ => Err(DecodeError::unsupported(type_name, target)),
    }
}

/// Decode a DATE column; `None` for the zero date.
pub fn date(
    raw: &[u8],
    format: WireFormat,
    type_name: &'static str,
    target: &'static str,
) -> Result<Option<NaiveDate>, DecodeError> {
    match format {
        WireFormat::Text => {
            let text = utf8(raw, type_name, target)?;
            if is_zero_date_literal(text) {
                return Ok(None);
            }
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .map(Some)
                .map_err(|_| DecodeError::unparseable(type_name, target, text))
        }
        WireFormat::Binary => {
            let p = DateParts::from_binary(raw).ok_or_else(|| malformed(raw, type_name, target))?;
            if p.is_zero_date() {
                return Ok(None);
            }
            p.date()
                .map(Some)
                .ok_or_else(|| malformed(raw, type_name, target))
        }
    }
}

/// Decode a DATETIME or TIMESTAMP column; `None` for zero values.
pub fn datetime(
    raw: &[u8],
    format: WireFormat,
    type_name: &'static str,
    target: &'static str,
) -> Result<Option<NaiveDateTime>, DecodeError> {
    match format {
        WireFormat::Text => {
            let text = utf8(raw, type_name, target)?;
            if is_zero_date_literal(text) {
                return Ok(None);
            }
            if has_excess_fraction(text) {
                return Err(DecodeError::unparseable(type_name, target, text));
            }
            NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                .map(Some)
                .map_err(|_| DecodeError::unparseable(type_name, target, text))
        }
        WireFormat::Binary => {
            let p = DateParts::from_binary(raw).ok_or_else(|| malformed(raw, type_name, target))?;
            if p.is_zero_date() {
                return Ok(None);
            }
            p.datetime()
                .map(Some)
                .ok_or_else(|| malformed(raw, type_name, target))
        }
    }
}

/// Decode a TIME column as a signed span. The zero time is a valid span.
pub fn time(
    raw: &[u8],
    format: WireFormat,
    type_name: &'static str,
    target: &'static str,
) -> Result<TimeDelta, DecodeError> {
    match format {
        WireFormat::Text => {
            let text = utf8(raw, type_name, target)?;
            parse_text_time(text).ok_or_else(|| DecodeError::unparseable(type_name, target, text))
        }
        WireFormat::Binary => TimeParts::from_binary(raw)
            .map(|p| p.span())
            .ok_or_else(|| malformed(raw, type_name, target)),
    }
}

/// Convert a span to a time of day; spans outside one day overflow.
#[allow(clippy::cast_possible_truncation)]
pub fn span_to_time_of_day(
    span: TimeDelta,
    type_name: &'static str,
    target: &'static str,
) -> Result<NaiveTime, DecodeError> {
    let micros = span.num_microseconds().unwrap_or(i64::MAX);
    if !(0..86_400_000_000).contains(&micros) {
        return Err(DecodeError::overflow(type_name, target, span));
    }
    let seconds = (micros / 1_000_000) as u32;
    let nanos = (micros % 1_000_000) as u32 * 1_000;
    NaiveTime::from_num_seconds_from_midnight_opt(seconds, nanos)
        .ok_or_else(|| DecodeError::overflow(type_name, target, span))
}

/// Parse `[-]H+:MM:SS[.ffffff]`. Hours may exceed 24.
pub fn parse_text_time(text: &str) -> Option<TimeDelta> {
    let text = text.trim();
    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let mut fields = body.splitn(3, ':');
    let hours: i64 = fields.next()?.parse().ok()?;
    let minutes: i64 = fields.next()?.parse().ok()?;
    let seconds_field = fields.next()?;
    let (seconds, fraction) = seconds_field.split_once('.').unwrap_or((seconds_field, ""));
    let seconds: i64 = seconds.parse().ok()?;
    if !(0..60).contains(&minutes) || !(0..60).contains(&seconds) {
        return None;
    }
    if fraction.len() > 6 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let micros: i64 = fraction
        .chars()
        .chain(std::iter::repeat('0'))
        .take(6)
        .collect::<String>()
        .parse()
        .ok()?;
    let total = hours.checked_mul(3_600)?.checked_add(minutes * 60 + seconds)?;
    let span = TimeDelta::try_seconds(total)? + TimeDelta::microseconds(micros);
    Some(if negative { -span } else { span })
}

/// Parse a date out of a character column: a date, or the date part of a
/// date-time literal.
pub fn parse_text_date_lenient(
    text: &str,
    type_name: &'static str,
    target: &'static str,
) -> Result<Option<NaiveDate>, DecodeError> {
    let text = text.trim();
    if is_zero_date_literal(text) {
        return Ok(None);
    }
    let date_part = text.get(..10).unwrap_or(text);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .map(Some)
        .map_err(|_| DecodeError::unparseable(type_name, target, text))
}

/// Parse a date-time out of a character column. Accepts a space or `T`
/// separator, and a bare date as midnight.
pub fn parse_text_datetime_lenient(
    text: &str,
    type_name: &'static str,
    target: &'static str,
) -> Result<Option<NaiveDateTime>, DecodeError> {
    let text = text.trim();
    if is_zero_date_literal(text) {
        return Ok(None);
    }
    if has_excess_fraction(text) {
        return Err(DecodeError::unparseable(type_name, target, text));
    }
    let parsed = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        });
    parsed
        .map(Some)
        .ok_or_else(|| DecodeError::unparseable(type_name, target, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mariadb_core::DecodeErrorKind;

    const DT: ColumnDecoder = ColumnDecoder::DateTime { timestamp: false };

    #[test]
    fn test_zero_dates_are_null() {
        assert_eq!(date(b"0000-00-00", WireFormat::Text, "DATE", "NaiveDate").unwrap(), None);
        assert_eq!(date(&[], WireFormat::Binary, "DATE", "NaiveDate").unwrap(), None);
        assert_eq!(date(&[0, 0, 0, 0], WireFormat::Binary, "DATE", "NaiveDate").unwrap(), None);
        assert_eq!(
            datetime(b"0000-00-00 00:00:00", WireFormat::Text, "DATETIME", "NaiveDateTime")
                .unwrap(),
            None
        );
        assert_eq!(datetime(&[], WireFormat::Binary, "DATETIME", "NaiveDateTime").unwrap(), None);
    }

    #[test]
    fn test_zero_date_shapes() {
        assert!(is_zero_date_literal("0000-00-00"));
        assert!(is_zero_date_literal("0000-00-00 00:00:00.000000"));
        assert!(is_zero_date_literal("0000-00-00T00:00:00"));
        for text in ["0", "-", "", "0000-00-001", "00-00-0000", "2024-00-00"] {
            assert!(!is_zero_date_literal(text), "{text}");
        }
        assert!(date(b"0", WireFormat::Text, "DATE", "NaiveDate").is_err());
    }

    #[test]
    fn test_text_datetime_rejects_nanoseconds() {
        let err = datetime(b"2024-01-02 03:04:05.1234567", WireFormat::Text, "DATETIME", "NaiveDateTime")
            .unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::Unparseable);
        assert!(
            parse_text_datetime_lenient("2024-01-02 03:04:05.1234567", "VARCHAR", "NaiveDateTime").is_err()
        );
        let dt = datetime(b"2024-01-02 03:04:05.123456", WireFormat::Text, "DATETIME", "NaiveDateTime")
            .unwrap()
            .unwrap();
        assert_eq!(dt.to_string(), "2024-01-02 03:04:05.123456");
    }

    #[test]
    fn test_binary_datetime_with_micros() {
        let mut raw = vec![0xE8, 0x07, 2, 29, 13, 45, 7];
        raw.extend_from_slice(&123_456u32.to_le_bytes());
        let dt = datetime(&raw, WireFormat::Binary, "DATETIME", "NaiveDateTime")
            .unwrap()
            .unwrap();
        assert_eq!(dt.to_string(), "2024-02-29 13:45:07.123456");
        assert_eq!(
            to_string(&raw, DT, 3, WireFormat::Binary, "String").unwrap(),
            "2024-02-29 13:45:07.123"
        );
        assert!(datetime(&raw[..5], WireFormat::Binary, "DATETIME", "NaiveDateTime").is_err());
    }

    #[test]
    fn test_text_fraction_follows_decimals() {
        assert_eq!(
            to_string(b"2024-01-02 03:04:05.1", DT, 3, WireFormat::Text, "String").unwrap(),
            "2024-01-02 03:04:05.100"
        );
        assert_eq!(
            to_string(b"2024-01-02 03:04:05.123456", DT, 0, WireFormat::Text, "String").unwrap(),
            "2024-01-02 03:04:05"
        );
        assert_eq!(
            to_string(&[], DT, 0, WireFormat::Binary, "String").unwrap(),
            "0000-00-00 00:00:00"
        );
    }

    #[test]
    fn test_time_spans() {
        let span = parse_text_time("-838:59:59.5").unwrap();
        let expected = TimeDelta::seconds(838 * 3600 + 59 * 60 + 59) + TimeDelta::milliseconds(500);
        assert_eq!(span, -expected);
        assert_eq!(parse_text_time("12:61:00"), None);
        assert_eq!(parse_text_time("10:00:00.1234567"), None);
        let err = time(b"10:00:00.1234567", WireFormat::Text, "TIME", "TimeDelta").unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::Unparseable);

        let raw = vec![1, 1, 0, 0, 0, 2, 3, 4];
        let span = time(&raw, WireFormat::Binary, "TIME", "TimeDelta").unwrap();
        assert_eq!(span, -TimeDelta::seconds(86_400 + 2 * 3600 + 3 * 60 + 4));
        assert_eq!(
            to_string(&raw, ColumnDecoder::Time, 0, WireFormat::Binary, "String").unwrap(),
            "-26:03:04"
        );
        assert!(span_to_time_of_day(span, "TIME", "NaiveTime").is_err());
        assert_eq!(time(&[], WireFormat::Binary, "TIME", "TimeDelta").unwrap(), TimeDelta::zero());

        let noon = span_to_time_of_day(TimeDelta::hours(12), "TIME", "NaiveTime").unwrap();
        assert_eq!(noon, NaiveTime::from_hms_opt(12, 0, 0).unwrap());
    }

    #[test]
    fn test_year_pivot() {
        assert_eq!(year(b"69", WireFormat::Text, 2, "YEAR", "i32").unwrap(), 2069);
        assert_eq!(year(b"70", WireFormat::Text, 2, "YEAR", "i32").unwrap(), 1970);
        assert_eq!(year(&[5, 0], WireFormat::Binary, 2, "YEAR", "i32").unwrap(), 2005);
        assert_eq!(year(&[5, 0], WireFormat::Binary, 4, "YEAR", "i32").unwrap(), 5);
        assert_eq!(year_literal(&[0xD5, 0x07], 2, "YEAR", "String").unwrap(), "05");
        assert_eq!(year_to_date(0), None);
        assert_eq!(year_to_date(1999), NaiveDate::from_ymd_opt(1999, 1, 1));
    }

    #[test]
    fn test_lenient_text_parsing() {
        let d = parse_text_date_lenient("2023-05-06 07:08:09", "VARCHAR", "NaiveDate").unwrap();
        assert_eq!(d, NaiveDate::from_ymd_opt(2023, 5, 6));
        let dt = parse_text_datetime_lenient("2023-05-06T07:08:09", "VARCHAR", "NaiveDateTime")
            .unwrap()
            .unwrap();
        assert_eq!(dt.to_string(), "2023-05-06 07:08:09");
        let midnight = parse_text_datetime_lenient("2023-05-06", "VARCHAR", "NaiveDateTime")
            .unwrap()
            .unwrap();
        assert_eq!(midnight.to_string(), "2023-05-06 00:00:00");
        assert!(parse_text_date_lenient("yesterday", "VARCHAR", "NaiveDate").is_err());
    }
}
