//! Column metadata and typed column decoding.
//!
//! A [`ColumnDefinition`] is parsed from a column definition packet and
//! carries an immutable [`ColumnDecoder`] selected from the server type,
//! the unsigned flag and the character set. Decoding works on the row
//! payload through a [`PacketReader`](crate::protocol::PacketReader):
//! every decode call consumes exactly the column's length first and only
//! then interprets the bytes, so a failed conversion never desynchronizes
//! the following columns.
//!
//! Both wire formats are supported: the text protocol (every value is an
//! ASCII literal) and the binary protocol used by prepared statements.

mod bit;
mod decoder;
mod definition;
mod float;
mod geometry;
mod integer;
mod string;
mod temporal;

pub(crate) use decoder::BinaryLayout;
pub(crate) use geometry::encode as encode_geometry;
pub use decoder::{ColumnDecoder, FromColumn, GeometryKind};
pub use definition::ColumnDefinition;
pub use integer::IntWidth;

#[cfg(test)]
pub(crate) use geometry::encode_point;

use chrono::{FixedOffset, Offset, Utc};

/// Server field type codes (`MYSQL_TYPE_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Timestamp2 = 0x11,
    DateTime2 = 0x12,
    Time2 = 0x13,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Parse a field type from its wire code.
    ///
    /// Unknown codes map to [`FieldType::String`], which decodes any
    /// payload as a character string.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0x11 => FieldType::Timestamp2,
            0x12 => FieldType::DateTime2,
            0x13 => FieldType::Time2,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFF => FieldType::Geometry,
            _ => FieldType::String,
        }
    }

    /// Get the SQL type name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            FieldType::Decimal | FieldType::NewDecimal => "DECIMAL",
            FieldType::Tiny => "TINYINT",
            FieldType::Short => "SMALLINT",
            FieldType::Long => "INT",
            FieldType::Float => "FLOAT",
            FieldType::Double => "DOUBLE",
            FieldType::Null => "NULL",
            FieldType::Timestamp | FieldType::Timestamp2 => "TIMESTAMP",
            FieldType::LongLong => "BIGINT",
            FieldType::Int24 => "MEDIUMINT",
            FieldType::Date | FieldType::NewDate => "DATE",
            FieldType::Time | FieldType::Time2 => "TIME",
            FieldType::DateTime | FieldType::DateTime2 => "DATETIME",
            FieldType::Year => "YEAR",
            FieldType::VarChar | FieldType::VarString => "VARCHAR",
            FieldType::Bit => "BIT",
            FieldType::Json => "JSON",
            FieldType::Enum => "ENUM",
            FieldType::Set => "SET",
            FieldType::TinyBlob => "TINYBLOB",
            FieldType::MediumBlob => "MEDIUMBLOB",
            FieldType::LongBlob => "LONGBLOB",
            FieldType::Blob => "BLOB",
            FieldType::String => "CHAR",
            FieldType::Geometry => "GEOMETRY",
        }
    }
}

/// Column flags in result set metadata.
#[allow(dead_code)]
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
    pub const ENUM: u16 = 256;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const TIMESTAMP: u16 = 1024;
    pub const SET: u16 = 2048;
}

/// Row wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// Text protocol (COM_QUERY results)
    Text,
    /// Binary protocol (COM_STMT_EXECUTE results)
    Binary,
}

/// Session-level settings that influence decoding.
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext {
    pub format: WireFormat,
    /// YEAR maps to a date (January 1st) instead of a small integer
    pub year_is_date: bool,
    /// Geometry with a point/linestring/polygon hint maps to [`mariadb_core::Geometry`]
    pub geometry_default_type: bool,
    /// Offset of the session time zone, used by timestamp decoding
    pub timezone: FixedOffset,
}

impl DecodeContext {
    pub fn new(format: WireFormat) -> Self {
        Self {
            format,
            year_is_date: true,
            geometry_default_type: false,
            timezone: Utc.fix(),
        }
    }

    pub fn text() -> Self {
        Self::new(WireFormat::Text)
    }

    pub fn binary() -> Self {
        Self::new(WireFormat::Binary)
    }

    pub fn with_format(mut self, format: WireFormat) -> Self {
        self.format = format;
        self
    }
}
