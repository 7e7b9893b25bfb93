//! Decoder selection and per-target dispatch.

#![allow(clippy::cast_possible_truncation)]

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Utc};
use mariadb_core::{DecodeError, DecodeErrorKind, Geometry, Value};

use super::integer::IntWidth;
use super::{
    ColumnDefinition, DecodeContext, FieldType, WireFormat, bit, column_flags, float, geometry,
    integer, string, temporal,
};
use crate::protocol::{PacketReader, charset};

/// Subtype hint carried by MariaDB extended type info on geometry columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryKind {
    Point,
    LineString,
    Polygon,
}

impl GeometryKind {
    pub fn from_type_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "point" => Some(GeometryKind::Point),
            "linestring" => Some(GeometryKind::LineString),
            "polygon" => Some(GeometryKind::Polygon),
            _ => None,
        }
    }
}

/// Decoder variant, fixed when the column definition is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnDecoder {
    Int { width: IntWidth, unsigned: bool },
    Float,
    Double,
    Decimal { unsigned: bool },
    /// CHAR, VARCHAR, ENUM, SET (and their BINARY/VARBINARY forms)
    String { binary: bool },
    /// BLOB and TEXT families
    Blob { binary: bool },
    Json,
    Date,
    Time,
    DateTime { timestamp: bool },
    Year,
    Bit,
    Geometry { hint: Option<GeometryKind> },
    Null,
}

/// How a value of this column is laid out in a binary protocol row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryLayout {
    Fixed(usize),
    /// One length byte followed by that many bytes (temporal types)
    LengthPrefixed,
    LengthEncoded,
}

impl ColumnDecoder {
    /// Select the decoder for a column.
    pub fn select(
        field_type: FieldType,
        flags: u16,
        charset: u16,
        ext_type_name: Option<&str>,
    ) -> Self {
        let unsigned = flags & column_flags::UNSIGNED != 0;
        let binary = charset == u16::from(charset::BINARY);
        let json_hint = ext_type_name.is_some_and(|name| name.eq_ignore_ascii_case("json"));
        match field_type {
            FieldType::Tiny => ColumnDecoder::Int {
                width: IntWidth::Tiny,
                unsigned,
            },
            FieldType::Short => ColumnDecoder::Int {
                width: IntWidth::Short,
                unsigned,
            },
            FieldType::Int24 => ColumnDecoder::Int {
                width: IntWidth::Medium,
                unsigned,
            },
            FieldType::Long => ColumnDecoder::Int {
                width: IntWidth::Long,
                unsigned,
            },
            FieldType::LongLong => ColumnDecoder::Int {
                width: IntWidth::LongLong,
                unsigned,
            },
            FieldType::Float => ColumnDecoder::Float,
            FieldType::Double => ColumnDecoder::Double,
            FieldType::Decimal | FieldType::NewDecimal => ColumnDecoder::Decimal { unsigned },
            FieldType::Json => ColumnDecoder::Json,
            FieldType::VarChar
            | FieldType::VarString
            | FieldType::String
            | FieldType::Enum
            | FieldType::Set => {
                if json_hint {
                    ColumnDecoder::Json
                } else {
                    ColumnDecoder::String { binary }
                }
            }
            FieldType::TinyBlob
            | FieldType::MediumBlob
            | FieldType::LongBlob
            | FieldType::Blob => {
                if json_hint {
                    ColumnDecoder::Json
                } else {
                    ColumnDecoder::Blob { binary }
                }
            }
            FieldType::Date | FieldType::NewDate => ColumnDecoder::Date,
            FieldType::Time | FieldType::Time2 => ColumnDecoder::Time,
            FieldType::DateTime | FieldType::DateTime2 => {
                ColumnDecoder::DateTime { timestamp: false }
            }
            FieldType::Timestamp | FieldType::Timestamp2 => {
                ColumnDecoder::DateTime { timestamp: true }
            }
            FieldType::Year => ColumnDecoder::Year,
            FieldType::Bit => ColumnDecoder::Bit,
            FieldType::Geometry => ColumnDecoder::Geometry {
                hint: ext_type_name.and_then(GeometryKind::from_type_name),
            },
            FieldType::Null => ColumnDecoder::Null,
        }
    }

    /// Server type name used in decode errors.
    pub const fn type_name(&self) -> &'static str {
        match self {
            ColumnDecoder::Int { width, unsigned } => width.type_name(*unsigned),
            ColumnDecoder::Float => "FLOAT",
            ColumnDecoder::Double => "DOUBLE",
            ColumnDecoder::Decimal { unsigned: false } => "DECIMAL",
            ColumnDecoder::Decimal { unsigned: true } => "DECIMAL UNSIGNED",
            ColumnDecoder::String { binary: false } => "VARCHAR",
            ColumnDecoder::String { binary: true } => "VARBINARY",
            ColumnDecoder::Blob { binary: false } => "TEXT",
            ColumnDecoder::Blob { binary: true } => "BLOB",
            ColumnDecoder::Json => "JSON",
            ColumnDecoder::Date => "DATE",
            ColumnDecoder::Time => "TIME",
            ColumnDecoder::DateTime { timestamp: false } => "DATETIME",
            ColumnDecoder::DateTime { timestamp: true } => "TIMESTAMP",
            ColumnDecoder::Year => "YEAR",
            ColumnDecoder::Bit => "BIT",
            ColumnDecoder::Geometry { .. } => "GEOMETRY",
            ColumnDecoder::Null => "NULL",
        }
    }

    pub(crate) const fn binary_layout(&self) -> BinaryLayout {
        match self {
            ColumnDecoder::Int { width, .. } => BinaryLayout::Fixed(width.binary_len()),
            ColumnDecoder::Float => BinaryLayout::Fixed(4),
            ColumnDecoder::Double => BinaryLayout::Fixed(8),
            ColumnDecoder::Year => BinaryLayout::Fixed(2),
            ColumnDecoder::Null => BinaryLayout::Fixed(0),
            ColumnDecoder::Date | ColumnDecoder::Time | ColumnDecoder::DateTime { .. } => {
                BinaryLayout::LengthPrefixed
            }
            _ => BinaryLayout::LengthEncoded,
        }
    }

    /// Character data that may be parsed into numbers and dates.
    const fn is_character(&self) -> bool {
        matches!(
            self,
            ColumnDecoder::String { binary: false }
                | ColumnDecoder::Blob { binary: false }
                | ColumnDecoder::Json
        )
    }
}

/// Target types a column value can be decoded into.
///
/// `Ok(None)` is a null result: temporal zero values such as
/// `0000-00-00` decode to it rather than to an error.
pub trait FromColumn: Sized {
    const TARGET: &'static str;

    fn decode(
        column: &ColumnDefinition,
        reader: &mut PacketReader<'_>,
        len: usize,
        ctx: &DecodeContext,
    ) -> Result<Option<Self>, DecodeError>;
}

fn utf8<'a>(
    raw: &'a [u8],
    type_name: &'static str,
    target: &'static str,
) -> Result<&'a str, DecodeError> {
    std::str::from_utf8(raw)
        .map_err(|_| DecodeError::unparseable(type_name, target, String::from_utf8_lossy(raw)))
}

fn narrow<T: TryFrom<i128>>(
    value: i128,
    type_name: &'static str,
    target: &'static str,
) -> Result<T, DecodeError> {
    T::try_from(value).map_err(|_| DecodeError::overflow(type_name, target, value))
}

impl ColumnDefinition {
    /// Consume exactly `len` bytes, even when they are not all there.
    fn take<'a>(
        &self,
        reader: &mut PacketReader<'a>,
        len: usize,
        target: &'static str,
    ) -> Result<&'a [u8], DecodeError> {
        match reader.read_bytes(len) {
            Some(raw) => Ok(raw),
            None => {
                let rest = reader.read_rest();
                Err(DecodeError {
                    server_type: self.decoder().type_name(),
                    target,
                    kind: DecodeErrorKind::Unparseable,
                    detail: format!("truncated value: {} of {} bytes", rest.len(), len),
                })
            }
        }
    }

    fn unsupported(&self, target: &'static str) -> DecodeError {
        DecodeError::unsupported(self.decoder().type_name(), target)
    }

    fn integer(
        &self,
        reader: &mut PacketReader<'_>,
        len: usize,
        ctx: &DecodeContext,
        target: &'static str,
    ) -> Result<i128, DecodeError> {
        let raw = self.take(reader, len, target)?;
        let decoder = self.decoder();
        let type_name = decoder.type_name();
        match decoder {
            ColumnDecoder::Int { width, unsigned } => {
                integer::decode(raw, ctx.format, width, unsigned, type_name, target)
            }
            ColumnDecoder::Year => {
                temporal::year(raw, ctx.format, self.length(), type_name, target).map(i128::from)
            }
            ColumnDecoder::Float | ColumnDecoder::Double => {
                let double = decoder == ColumnDecoder::Double;
                let v = float::decode(raw, ctx.format, double, type_name, target)?;
                float::to_integer(v, type_name, target)
            }
            ColumnDecoder::Bit => bit::to_u64(raw, type_name, target).map(i128::from),
            d if matches!(d, ColumnDecoder::Decimal { .. }) || d.is_character() => {
                string::parse_integer(utf8(raw, type_name, target)?, type_name, target)
            }
            _ => Err(self.unsupported(target)),
        }
    }

    fn double(
        &self,
        reader: &mut PacketReader<'_>,
        len: usize,
        ctx: &DecodeContext,
        target: &'static str,
    ) -> Result<f64, DecodeError> {
        let raw = self.take(reader, len, target)?;
        let decoder = self.decoder();
        let type_name = decoder.type_name();
        match decoder {
            ColumnDecoder::Int { width, unsigned } => {
                integer::decode(raw, ctx.format, width, unsigned, type_name, target)
                    .map(|v| v as f64)
            }
            ColumnDecoder::Year => temporal::year(raw, ctx.format, self.length(), type_name, target)
                .map(f64::from),
            ColumnDecoder::Float => float::decode(raw, ctx.format, false, type_name, target),
            ColumnDecoder::Double => float::decode(raw, ctx.format, true, type_name, target),
            ColumnDecoder::Bit => bit::to_u64(raw, type_name, target).map(|v| v as f64),
            d if matches!(d, ColumnDecoder::Decimal { .. }) || d.is_character() => {
                string::parse_float(utf8(raw, type_name, target)?, type_name, target)
            }
            _ => Err(self.unsupported(target)),
        }
    }

    pub fn decode_bool(
        &self,
        reader: &mut PacketReader<'_>,
        len: usize,
        ctx: &DecodeContext,
    ) -> Result<bool, DecodeError> {
        const TARGET: &str = "bool";
        let decoder = self.decoder();
        match decoder {
            ColumnDecoder::Int { .. } | ColumnDecoder::Year => {
                self.integer(reader, len, ctx, TARGET).map(|v| v != 0)
            }
            ColumnDecoder::Float | ColumnDecoder::Double | ColumnDecoder::Decimal { .. } => {
                self.double(reader, len, ctx, TARGET).map(|v| v != 0.0)
            }
            ColumnDecoder::Bit => {
                let raw = self.take(reader, len, TARGET)?;
                Ok(bit::to_bool(raw))
            }
            d if d.is_character() => {
                let raw = self.take(reader, len, TARGET)?;
                let text = utf8(raw, d.type_name(), TARGET)?;
                string::parse_bool(text)
                    .ok_or_else(|| DecodeError::unparseable(d.type_name(), TARGET, text))
            }
            _ => {
                self.take(reader, len, TARGET)?;
                Err(self.unsupported(TARGET))
            }
        }
    }

    pub fn decode_byte(
        &self,
        reader: &mut PacketReader<'_>,
        len: usize,
        ctx: &DecodeContext,
    ) -> Result<i8, DecodeError> {
        let v = self.integer(reader, len, ctx, "i8")?;
        narrow(v, self.decoder().type_name(), "i8")
    }

    pub fn decode_short(
        &self,
        reader: &mut PacketReader<'_>,
        len: usize,
        ctx: &DecodeContext,
    ) -> Result<i16, DecodeError> {
        let v = self.integer(reader, len, ctx, "i16")?;
        narrow(v, self.decoder().type_name(), "i16")
    }

    pub fn decode_int(
        &self,
        reader: &mut PacketReader<'_>,
        len: usize,
        ctx: &DecodeContext,
    ) -> Result<i32, DecodeError> {
        let v = self.integer(reader, len, ctx, "i32")?;
        narrow(v, self.decoder().type_name(), "i32")
    }

    pub fn decode_long(
        &self,
        reader: &mut PacketReader<'_>,
        len: usize,
        ctx: &DecodeContext,
    ) -> Result<i64, DecodeError> {
        let v = self.integer(reader, len, ctx, "i64")?;
        narrow(v, self.decoder().type_name(), "i64")
    }

    pub fn decode_unsigned_long(
        &self,
        reader: &mut PacketReader<'_>,
        len: usize,
        ctx: &DecodeContext,
    ) -> Result<u64, DecodeError> {
        let v = self.integer(reader, len, ctx, "u64")?;
        narrow(v, self.decoder().type_name(), "u64")
    }

    pub fn decode_float(
        &self,
        reader: &mut PacketReader<'_>,
        len: usize,
        ctx: &DecodeContext,
    ) -> Result<f32, DecodeError> {
        let v = self.double(reader, len, ctx, "f32")?;
        if v.is_finite() && v.abs() > f64::from(f32::MAX) {
            return Err(DecodeError::overflow(self.decoder().type_name(), "f32", v));
        }
        Ok(v as f32)
    }

    pub fn decode_double(
        &self,
        reader: &mut PacketReader<'_>,
        len: usize,
        ctx: &DecodeContext,
    ) -> Result<f64, DecodeError> {
        self.double(reader, len, ctx, "f64")
    }

    pub fn decode_string(
        &self,
        reader: &mut PacketReader<'_>,
        len: usize,
        ctx: &DecodeContext,
    ) -> Result<String, DecodeError> {
        const TARGET: &str = "String";
        let raw = self.take(reader, len, TARGET)?;
        let decoder = self.decoder();
        let type_name = decoder.type_name();
        match decoder {
            ColumnDecoder::Int { width, unsigned } => match ctx.format {
                WireFormat::Text => utf8(raw, type_name, TARGET).map(str::to_string),
                WireFormat::Binary => {
                    integer::decode(raw, ctx.format, width, unsigned, type_name, TARGET)
                        .map(|v| v.to_string())
                }
            },
            ColumnDecoder::Year => match ctx.format {
                WireFormat::Text => utf8(raw, type_name, TARGET).map(str::to_string),
                WireFormat::Binary => {
                    temporal::year_literal(raw, self.length(), type_name, TARGET)
                }
            },
            ColumnDecoder::Float | ColumnDecoder::Double => Ok(float::to_string(
                raw,
                ctx.format,
                decoder == ColumnDecoder::Double,
            )),
            ColumnDecoder::Date | ColumnDecoder::Time | ColumnDecoder::DateTime { .. } => {
                temporal::to_string(raw, decoder, self.decimals(), ctx.format, TARGET)
            }
            ColumnDecoder::Bit => Ok(bit::to_literal(raw)),
            ColumnDecoder::Geometry { .. } => geometry::parse(raw)
                .map(|g| g.to_wkt())
                .ok_or_else(|| DecodeError::unparseable(type_name, TARGET, hex::encode(raw))),
            ColumnDecoder::Null => Err(self.unsupported(TARGET)),
            ColumnDecoder::Decimal { .. }
            | ColumnDecoder::String { .. }
            | ColumnDecoder::Blob { .. }
            | ColumnDecoder::Json => Ok(String::from_utf8_lossy(raw).into_owned()),
        }
    }

    /// Decode as a calendar date; `None` for zero dates.
    pub fn decode_date(
        &self,
        reader: &mut PacketReader<'_>,
        len: usize,
        ctx: &DecodeContext,
    ) -> Result<Option<NaiveDate>, DecodeError> {
        const TARGET: &str = "NaiveDate";
        let raw = self.take(reader, len, TARGET)?;
        let decoder = self.decoder();
        let type_name = decoder.type_name();
        match decoder {
            ColumnDecoder::Date => temporal::date(raw, ctx.format, type_name, TARGET),
            ColumnDecoder::DateTime { .. } => {
                temporal::datetime(raw, ctx.format, type_name, TARGET).map(|dt| dt.map(|v| v.date()))
            }
            ColumnDecoder::Year => {
                temporal::year(raw, ctx.format, self.length(), type_name, TARGET)
                    .map(temporal::year_to_date)
            }
            d if d.is_character() => {
                temporal::parse_text_date_lenient(utf8(raw, type_name, TARGET)?, type_name, TARGET)
            }
            _ => Err(self.unsupported(TARGET)),
        }
    }

    /// Decode as a time of day. TIME values outside `00:00:00..24:00:00`
    /// overflow this target; use [`ColumnDefinition::decode_duration`].
    pub fn decode_time(
        &self,
        reader: &mut PacketReader<'_>,
        len: usize,
        ctx: &DecodeContext,
    ) -> Result<Option<NaiveTime>, DecodeError> {
        const TARGET: &str = "NaiveTime";
        let raw = self.take(reader, len, TARGET)?;
        let decoder = self.decoder();
        let type_name = decoder.type_name();
        match decoder {
            ColumnDecoder::Time => {
                let span = temporal::time(raw, ctx.format, type_name, TARGET)?;
                temporal::span_to_time_of_day(span, type_name, TARGET).map(Some)
            }
            ColumnDecoder::DateTime { .. } => {
                temporal::datetime(raw, ctx.format, type_name, TARGET).map(|dt| dt.map(|v| v.time()))
            }
            d if d.is_character() => {
                let text = utf8(raw, type_name, TARGET)?;
                let span = temporal::parse_text_time(text)
                    .ok_or_else(|| DecodeError::unparseable(type_name, TARGET, text))?;
                temporal::span_to_time_of_day(span, type_name, TARGET).map(Some)
            }
            _ => Err(self.unsupported(TARGET)),
        }
    }

    /// Decode a TIME value as a signed span (may exceed 24 hours).
    pub fn decode_duration(
        &self,
        reader: &mut PacketReader<'_>,
        len: usize,
        ctx: &DecodeContext,
    ) -> Result<Option<TimeDelta>, DecodeError> {
        const TARGET: &str = "TimeDelta";
        let raw = self.take(reader, len, TARGET)?;
        let decoder = self.decoder();
        let type_name = decoder.type_name();
        match decoder {
            ColumnDecoder::Time => temporal::time(raw, ctx.format, type_name, TARGET).map(Some),
            d if d.is_character() => {
                let text = utf8(raw, type_name, TARGET)?;
                temporal::parse_text_time(text)
                    .map(Some)
                    .ok_or_else(|| DecodeError::unparseable(type_name, TARGET, text))
            }
            _ => Err(self.unsupported(TARGET)),
        }
    }

    /// Decode as a local date-time; `None` for zero values.
    pub fn decode_datetime(
        &self,
        reader: &mut PacketReader<'_>,
        len: usize,
        ctx: &DecodeContext,
    ) -> Result<Option<NaiveDateTime>, DecodeError> {
        const TARGET: &str = "NaiveDateTime";
        let raw = self.take(reader, len, TARGET)?;
        let decoder = self.decoder();
        let type_name = decoder.type_name();
        match decoder {
            ColumnDecoder::DateTime { .. } => temporal::datetime(raw, ctx.format, type_name, TARGET),
            ColumnDecoder::Date => temporal::date(raw, ctx.format, type_name, TARGET)
                .map(|d| d.and_then(|v| v.and_hms_opt(0, 0, 0))),
            d if d.is_character() => temporal::parse_text_datetime_lenient(
                utf8(raw, type_name, TARGET)?,
                type_name,
                TARGET,
            ),
            _ => Err(self.unsupported(TARGET)),
        }
    }

    /// Decode as an instant, reading the stored value in the session
    /// time zone carried by `ctx`.
    pub fn decode_timestamp(
        &self,
        reader: &mut PacketReader<'_>,
        len: usize,
        ctx: &DecodeContext,
    ) -> Result<Option<DateTime<Utc>>, DecodeError> {
        let Some(local) = self.decode_datetime(reader, len, ctx)? else {
            return Ok(None);
        };
        ctx.timezone
            .from_local_datetime(&local)
            .single()
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .ok_or_else(|| DecodeError::unparseable(self.decoder().type_name(), "DateTime<Utc>", local))
    }

    pub fn decode_bytes(
        &self,
        reader: &mut PacketReader<'_>,
        len: usize,
        ctx: &DecodeContext,
    ) -> Result<Vec<u8>, DecodeError> {
        const TARGET: &str = "Vec<u8>";
        let raw = self.take(reader, len, TARGET)?;
        match self.decoder().binary_layout() {
            BinaryLayout::LengthEncoded => Ok(raw.to_vec()),
            _ if ctx.format == WireFormat::Text => Ok(raw.to_vec()),
            _ => Err(self.unsupported(TARGET)),
        }
    }

    pub fn decode_geometry(
        &self,
        reader: &mut PacketReader<'_>,
        len: usize,
        _ctx: &DecodeContext,
    ) -> Result<Geometry, DecodeError> {
        const TARGET: &str = "Geometry";
        let raw = self.take(reader, len, TARGET)?;
        let decoder = self.decoder();
        match decoder {
            ColumnDecoder::Geometry { .. } | ColumnDecoder::Blob { binary: true } => {
                geometry::parse(raw).ok_or_else(|| {
                    DecodeError::unparseable(decoder.type_name(), TARGET, hex::encode(raw))
                })
            }
            _ => Err(self.unsupported(TARGET)),
        }
    }

    /// Decode into the default [`Value`] mapping of this column.
    pub fn decode_value(
        &self,
        reader: &mut PacketReader<'_>,
        len: usize,
        ctx: &DecodeContext,
    ) -> Result<Value, DecodeError> {
        const TARGET: &str = "Value";
        let raw = self.take(reader, len, TARGET)?;
        let decoder = self.decoder();
        let type_name = decoder.type_name();
        match decoder {
            ColumnDecoder::Int { width, unsigned } => {
                let v = integer::decode(raw, ctx.format, width, unsigned, type_name, TARGET)?;
                integer::value(v, width, unsigned, type_name)
            }
            ColumnDecoder::Float => {
                float::decode(raw, ctx.format, false, type_name, TARGET).map(|v| Value::Float(v as f32))
            }
            ColumnDecoder::Double => {
                float::decode(raw, ctx.format, true, type_name, TARGET).map(Value::Double)
            }
            ColumnDecoder::Decimal { .. } => {
                Ok(Value::Decimal(utf8(raw, type_name, TARGET)?.to_string()))
            }
            ColumnDecoder::String { binary: false } | ColumnDecoder::Blob { binary: false } => {
                Ok(Value::Text(String::from_utf8_lossy(raw).into_owned()))
            }
            ColumnDecoder::String { binary: true } | ColumnDecoder::Blob { binary: true } => {
                Ok(Value::Bytes(raw.to_vec()))
            }
            ColumnDecoder::Json => Ok(string::json_value(raw)),
            ColumnDecoder::Date => temporal::date(raw, ctx.format, type_name, TARGET)
                .map(|d| d.map_or(Value::Null, Value::Date)),
            ColumnDecoder::Time => temporal::time(raw, ctx.format, type_name, TARGET)
                .map(Value::from),
            ColumnDecoder::DateTime { .. } => temporal::datetime(raw, ctx.format, type_name, TARGET)
                .map(|d| d.map_or(Value::Null, Value::DateTime)),
            ColumnDecoder::Year => {
                let year = temporal::year(raw, ctx.format, self.length(), type_name, TARGET)?;
                if ctx.year_is_date {
                    Ok(temporal::year_to_date(year).map_or(Value::Null, Value::Date))
                } else {
                    narrow(i128::from(year), type_name, TARGET).map(Value::SmallInt)
                }
            }
            ColumnDecoder::Bit => {
                if self.length() == 1 {
                    Ok(Value::Bool(bit::to_bool(raw)))
                } else {
                    Ok(Value::Bytes(raw.to_vec()))
                }
            }
            ColumnDecoder::Geometry { hint } => {
                if ctx.geometry_default_type && hint.is_some() {
                    geometry::parse(raw).map(Value::Geometry).ok_or_else(|| {
                        DecodeError::unparseable(type_name, TARGET, hex::encode(raw))
                    })
                } else {
                    Ok(Value::Bytes(raw.to_vec()))
                }
            }
            ColumnDecoder::Null => Ok(Value::Null),
        }
    }
}

macro_rules! from_column {
    ($ty:ty, $target:literal, $method:ident) => {
        impl FromColumn for $ty {
            const TARGET: &'static str = $target;

            fn decode(
                column: &ColumnDefinition,
                reader: &mut PacketReader<'_>,
                len: usize,
                ctx: &DecodeContext,
            ) -> Result<Option<Self>, DecodeError> {
                column.$method(reader, len, ctx).map(Some)
            }
        }
    };
    ($ty:ty, $target:literal, $method:ident, nullable) => {
        impl FromColumn for $ty {
            const TARGET: &'static str = $target;

            fn decode(
                column: &ColumnDefinition,
                reader: &mut PacketReader<'_>,
                len: usize,
                ctx: &DecodeContext,
            ) -> Result<Option<Self>, DecodeError> {
                column.$method(reader, len, ctx)
            }
        }
    };
}

from_column!(bool, "bool", decode_bool);
from_column!(i8, "i8", decode_byte);
from_column!(i16, "i16", decode_short);
from_column!(i32, "i32", decode_int);
from_column!(i64, "i64", decode_long);
from_column!(u64, "u64", decode_unsigned_long);
from_column!(f32, "f32", decode_float);
from_column!(f64, "f64", decode_double);
from_column!(String, "String", decode_string);
from_column!(Vec<u8>, "Vec<u8>", decode_bytes);
from_column!(Geometry, "Geometry", decode_geometry);
from_column!(Value, "Value", decode_value);
from_column!(NaiveDate, "NaiveDate", decode_date, nullable);
from_column!(NaiveTime, "NaiveTime", decode_time, nullable);
from_column!(TimeDelta, "TimeDelta", decode_duration, nullable);
from_column!(NaiveDateTime, "NaiveDateTime", decode_datetime, nullable);
from_column!(DateTime<Utc>, "DateTime<Utc>", decode_timestamp, nullable);
