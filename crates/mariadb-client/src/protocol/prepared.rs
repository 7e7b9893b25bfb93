//! Prepared statement (binary protocol) payloads.
//!
//! 1. **Prepare**: COM_STMT_PREPARE with the SQL text. The server answers
//!    with a prepare-OK header, then the parameter and result column
//!    definitions.
//! 2. **Execute**: COM_STMT_EXECUTE with the statement id and the binary
//!    parameters. MariaDB accepts the id `0xFFFFFFFF` for "the statement
//!    prepared just before", which lets prepare and execute travel in one
//!    pipeline.
//! 3. **Close**: COM_STMT_CLOSE; the server sends no response.
//!
//! Builders here return command payloads; framing is done by
//! [`PacketIo`](super::PacketIo).

#![allow(clippy::cast_possible_truncation)]

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use mariadb_core::Value;

use super::{CommandCode, PacketReader, PacketWriter};
use crate::column::{FieldType, encode_geometry};

/// Statement id meaning "the statement prepared by the previous command".
pub const LAST_PREPARED_STATEMENT: u32 = 0xFFFF_FFFF;

/// Response header of COM_STMT_PREPARE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmtPrepareOk {
    /// Server-assigned statement id
    pub statement_id: u32,
    /// Result columns (0 for statements without a result set)
    pub num_columns: u16,
    /// Placeholders in the SQL
    pub num_params: u16,
    pub warnings: u16,
}

/// Build a COM_STMT_PREPARE payload.
pub fn build_stmt_prepare_packet(sql: &str) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(1 + sql.len());
    writer.write_u8(CommandCode::StmtPrepare as u8);
    writer.write_bytes(sql.as_bytes());
    writer.into_bytes()
}

/// Build a COM_STMT_EXECUTE payload.
///
/// Layout:
/// - command byte, statement id (u32), cursor flags (0 = no cursor),
///   iteration count (always 1)
/// - when there are parameters: NULL bitmap, new-params-bound flag (1),
///   a (type, flags) pair per parameter, then each non-NULL value
pub fn build_stmt_execute_packet(statement_id: u32, params: &[Value]) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(16 + params.len() * 16);
    writer.write_u8(CommandCode::StmtExecute as u8);
    writer.write_u32_le(statement_id);
    writer.write_u8(0x00);
    writer.write_u32_le(1);

    if !params.is_empty() {
        let mut null_bitmap = vec![0u8; params.len().div_ceil(8)];
        for (i, param) in params.iter().enumerate() {
            if param.is_null() {
                null_bitmap[i / 8] |= 1 << (i % 8);
            }
        }
        writer.write_bytes(&null_bitmap);

        writer.write_u8(1);
        for param in params {
            writer.write_u8(param_type(param) as u8);
            writer.write_u8(if matches!(param, Value::UnsignedBigInt(_)) { 0x80 } else { 0x00 });
        }

        for param in params {
            encode_param(&mut writer, param);
        }
    }
    writer.into_bytes()
}

/// Build a COM_STMT_CLOSE payload.
pub fn build_stmt_close_packet(statement_id: u32) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(5);
    writer.write_u8(CommandCode::StmtClose as u8);
    writer.write_u32_le(statement_id);
    writer.into_bytes()
}

/// Parse the COM_STMT_PREPARE response header:
/// `0x00, id u32, columns u16, params u16, reserved u8, warnings u16`.
pub fn parse_stmt_prepare_ok(data: &[u8]) -> Option<StmtPrepareOk> {
    let mut reader = PacketReader::new(data);
    if reader.read_u8()? != 0x00 {
        return None;
    }
    let statement_id = reader.read_u32_le()?;
    let num_columns = reader.read_u16_le()?;
    let num_params = reader.read_u16_le()?;
    reader.skip(1);
    let warnings = reader.read_u16_le().unwrap_or(0);
    Some(StmtPrepareOk {
        statement_id,
        num_columns,
        num_params,
        warnings,
    })
}

fn param_type(value: &Value) -> FieldType {
    match value {
        Value::Null => FieldType::Null,
        Value::Bool(_) | Value::TinyInt(_) => FieldType::Tiny,
        Value::SmallInt(_) => FieldType::Short,
        Value::Int(_) => FieldType::Long,
        Value::BigInt(_) | Value::UnsignedBigInt(_) => FieldType::LongLong,
        Value::Float(_) => FieldType::Float,
        Value::Double(_) => FieldType::Double,
        Value::Decimal(_) => FieldType::NewDecimal,
        Value::Text(_) => FieldType::VarString,
        Value::Bytes(_) | Value::Geometry(_) => FieldType::Blob,
        Value::Json(_) => FieldType::VarString,
        Value::Date(_) => FieldType::Date,
        Value::Time(_) => FieldType::Time,
        Value::DateTime(_) => FieldType::DateTime,
    }
}

fn encode_param(writer: &mut PacketWriter, value: &Value) {
    match value {
        // carried by the NULL bitmap
        Value::Null => {}
        Value::Bool(b) => writer.write_u8(u8::from(*b)),
        Value::TinyInt(i) => writer.write_u8(*i as u8),
        Value::SmallInt(i) => writer.write_u16_le(*i as u16),
        Value::Int(i) => writer.write_u32_le(*i as u32),
        Value::BigInt(i) => writer.write_u64_le(*i as u64),
        Value::UnsignedBigInt(u) => writer.write_u64_le(*u),
        Value::Float(f) => writer.write_f32_le(*f),
        Value::Double(f) => writer.write_f64_le(*f),
        Value::Decimal(s) | Value::Text(s) => writer.write_lenenc_string(s),
        Value::Bytes(b) => writer.write_lenenc_bytes(b),
        Value::Json(j) => writer.write_lenenc_string(&j.to_string()),
        Value::Geometry(g) => writer.write_lenenc_bytes(&encode_geometry(g)),
        Value::Date(d) => encode_date(writer, *d),
        Value::Time(micros) => encode_time(writer, *micros),
        Value::DateTime(dt) => encode_datetime(writer, *dt),
    }
}

fn encode_date(writer: &mut PacketWriter, date: NaiveDate) {
    writer.write_u8(4);
    writer.write_u16_le(date.year() as u16);
    writer.write_u8(date.month() as u8);
    writer.write_u8(date.day() as u8);
}

/// TIME as a signed span in microseconds.
fn encode_time(writer: &mut PacketWriter, micros: i64) {
    let negative = micros < 0;
    let micros = micros.unsigned_abs();
    let total_seconds = micros / 1_000_000;
    let fraction = (micros % 1_000_000) as u32;
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3_600;
    let minutes = (total_seconds % 3_600) / 60;
    let seconds = total_seconds % 60;

    if total_seconds == 0 && fraction == 0 {
        writer.write_u8(0);
        return;
    }
    writer.write_u8(if fraction == 0 { 8 } else { 12 });
    writer.write_u8(u8::from(negative));
    writer.write_u32_le(days as u32);
    writer.write_u8(hours as u8);
    writer.write_u8(minutes as u8);
    writer.write_u8(seconds as u8);
    if fraction != 0 {
        writer.write_u32_le(fraction);
    }
}

fn encode_datetime(writer: &mut PacketWriter, dt: NaiveDateTime) {
    let micros = dt.nanosecond() / 1_000;
    let has_time = dt.hour() != 0 || dt.minute() != 0 || dt.second() != 0 || micros != 0;
    writer.write_u8(match (has_time, micros != 0) {
        (false, _) => 4,
        (true, false) => 7,
        (true, true) => 11,
    });
    writer.write_u16_le(dt.year() as u16);
    writer.write_u8(dt.month() as u8);
    writer.write_u8(dt.day() as u8);
    if has_time {
        writer.write_u8(dt.hour() as u8);
        writer.write_u8(dt.minute() as u8);
        writer.write_u8(dt.second() as u8);
    }
    if micros != 0 {
        writer.write_u32_le(micros);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{ColumnDefinition, DecodeContext};
    use crate::row::{Row, encode_binary_row};
    use chrono::TimeDelta;
    use std::sync::Arc;

    #[test]
    fn test_build_stmt_prepare_and_close() {
        let packet = build_stmt_prepare_packet("SELECT ?");
        assert_eq!(packet[0], 0x16);
        assert_eq!(&packet[1..], b"SELECT ?");

        let packet = build_stmt_close_packet(0x0102_0304);
        assert_eq!(packet, vec![0x19, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_parse_stmt_prepare_ok() {
        let data = [0x00, 7, 0, 0, 0, 2, 0, 1, 0, 0, 3, 0];
        let ok = parse_stmt_prepare_ok(&data).unwrap();
        assert_eq!(ok.statement_id, 7);
        assert_eq!(ok.num_columns, 2);
        assert_eq!(ok.num_params, 1);
        assert_eq!(ok.warnings, 3);
        assert_eq!(parse_stmt_prepare_ok(&[0xFF, 1, 2]), None);
    }

    #[test]
    fn test_execute_without_params() {
        let packet = build_stmt_execute_packet(LAST_PREPARED_STATEMENT, &[]);
        assert_eq!(packet, vec![0x17, 0xFF, 0xFF, 0xFF, 0xFF, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn test_execute_with_null_and_unsigned() {
        let packet =
            build_stmt_execute_packet(1, &[Value::Int(5), Value::Null, Value::UnsignedBigInt(9)]);
        // header (10) + bitmap (1) + bound flag (1) + types (6)
        assert_eq!(packet[10], 0b0000_0010);
        assert_eq!(packet[11], 1);
        assert_eq!(&packet[12..18], &[0x03, 0x00, 0x06, 0x00, 0x08, 0x80]);
        assert_eq!(&packet[18..22], &5i32.to_le_bytes());
        assert_eq!(&packet[22..30], &9u64.to_le_bytes());
        assert_eq!(packet.len(), 30);
    }

    /// Temporal parameters use the same layout the server sends in binary rows.
    #[test]
    fn test_temporal_params_decode_back() {
        let dt = NaiveDate::from_ymd_opt(2021, 12, 31)
            .unwrap()
            .and_hms_micro_opt(23, 59, 58, 250)
            .unwrap();
        let span = -(TimeDelta::hours(30) + TimeDelta::seconds(5));

        let mut writer = PacketWriter::new();
        encode_datetime(&mut writer, dt);
        let dt_bytes = writer.into_bytes();
        let mut writer = PacketWriter::new();
        encode_time(&mut writer, span.num_microseconds().unwrap());
        let time_bytes = writer.into_bytes();
        assert_eq!(time_bytes[0], 8);

        let columns: Arc<[ColumnDefinition]> = vec![
            ColumnDefinition::new("dt", FieldType::DateTime),
            ColumnDefinition::new("t", FieldType::Time),
        ]
        .into();
        let payload = encode_binary_row(&[Some(dt_bytes), Some(time_bytes)]);
        let row = Row::parse(columns, payload, DecodeContext::binary()).unwrap();
        assert_eq!(row.get::<NaiveDateTime>(0).unwrap(), dt);
        assert_eq!(row.get::<TimeDelta>(1).unwrap(), span);
    }
}
