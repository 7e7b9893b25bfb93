//! Column definition packets.

use mariadb_core::error::{Error, ProtocolError};

use super::{ColumnDecoder, FieldType, column_flags};
use crate::protocol::{PacketReader, PacketWriter, charset};

/// Tags inside the MariaDB extended type info block.
const EXT_TYPE_NAME: u8 = 0;
const EXT_TYPE_FORMAT: u8 = 1;

/// Metadata of one result set column.
///
/// The decoder is selected once, when the definition is built, from the
/// field type, the unsigned flag and the character set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    schema: String,
    table_alias: String,
    table: String,
    alias: String,
    column: String,
    charset: u16,
    length: u32,
    field_type: FieldType,
    flags: u16,
    decimals: u8,
    ext_type_name: Option<String>,
    ext_type_format: Option<String>,
    decoder: ColumnDecoder,
    use_alias_as_name: bool,
}

fn protocol_error(msg: &str, data: &[u8]) -> Error {
    Error::Protocol(ProtocolError {
        message: format!("malformed column definition: {}", msg),
        raw_data: Some(data.to_vec()),
    })
}

impl ColumnDefinition {
    /// Parse a column definition packet.
    ///
    /// `extended_type_info` must be set when MARIADB_CLIENT_EXTENDED_TYPE_INFO
    /// was negotiated; the packet then carries an extra block after the
    /// original column name.
    pub fn parse(data: &[u8], extended_type_info: bool) -> mariadb_core::Result<Self> {
        let mut reader = PacketReader::new(data);
        let mut field = |name: &str| {
            reader
                .read_lenenc_string()
                .ok_or_else(|| protocol_error(&format!("missing {}", name), data))
        };
        let _catalog = field("catalog")?;
        let schema = field("schema")?;
        let table_alias = field("table alias")?;
        let table = field("table")?;
        let alias = field("name")?;
        let column = field("original name")?;

        let mut ext_type_name = None;
        let mut ext_type_format = None;
        if extended_type_info {
            let block = reader
                .read_lenenc_bytes()
                .ok_or_else(|| protocol_error("missing extended type info", data))?;
            let mut ext = PacketReader::new(block);
            while let Some(tag) = ext.read_u8() {
                let value = ext
                    .read_lenenc_string()
                    .ok_or_else(|| protocol_error("truncated extended type info", data))?;
                match tag {
                    EXT_TYPE_NAME => ext_type_name = Some(value),
                    EXT_TYPE_FORMAT => ext_type_format = Some(value),
                    other => tracing::debug!(tag = other, "ignoring extended type info entry"),
                }
            }
        }

        // Length of the fixed-size fields, always 0x0c
        let _fixed_len = reader.read_lenenc_int();
        let missing = |name: &str| protocol_error(&format!("missing {}", name), data);
        let charset = reader.read_u16_le().ok_or_else(|| missing("charset"))?;
        let length = reader.read_u32_le().ok_or_else(|| missing("column length"))?;
        let field_type = FieldType::from_u8(reader.read_u8().ok_or_else(|| missing("type"))?);
        let flags = reader.read_u16_le().ok_or_else(|| missing("flags"))?;
        let decimals = reader.read_u8().ok_or_else(|| missing("decimals"))?;

        let mut def = Self {
            schema,
            table_alias,
            table,
            alias,
            column,
            charset,
            length,
            field_type,
            flags,
            decimals,
            ext_type_name,
            ext_type_format,
            decoder: ColumnDecoder::Null,
            use_alias_as_name: false,
        };
        def.select_decoder();
        Ok(def)
    }

    /// A bare column definition, for building result sets by hand.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        let charset = match field_type {
            FieldType::VarChar
            | FieldType::VarString
            | FieldType::String
            | FieldType::Enum
            | FieldType::Set
            | FieldType::Json
            | FieldType::Decimal
            | FieldType::NewDecimal => u16::from(charset::UTF8MB4_GENERAL_CI),
            _ => u16::from(charset::BINARY),
        };
        let mut def = Self {
            schema: String::new(),
            table_alias: String::new(),
            table: String::new(),
            alias: name.clone(),
            column: name,
            charset,
            length: 0,
            field_type,
            flags: 0,
            decimals: 0,
            ext_type_name: None,
            ext_type_format: None,
            decoder: ColumnDecoder::Null,
            use_alias_as_name: false,
        };
        def.select_decoder();
        def
    }

    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self.select_decoder();
        self
    }

    pub fn with_length(mut self, length: u32) -> Self {
        self.length = length;
        self
    }

    pub fn with_charset(mut self, charset: u16) -> Self {
        self.charset = charset;
        self.select_decoder();
        self
    }

    pub fn with_decimals(mut self, decimals: u8) -> Self {
        self.decimals = decimals;
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self.table_alias.clone_from(&self.table);
        self
    }

    pub fn with_extended_type(mut self, name: impl Into<String>) -> Self {
        self.ext_type_name = Some(name.into());
        self.select_decoder();
        self
    }

    fn select_decoder(&mut self) {
        self.decoder = ColumnDecoder::select(
            self.field_type,
            self.flags,
            self.charset,
            self.ext_type_name.as_deref(),
        );
    }

    /// Encode as a column definition packet payload.
    pub fn encode(&self, extended_type_info: bool) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(64);
        w.write_lenenc_string("def");
        w.write_lenenc_string(&self.schema);
        w.write_lenenc_string(&self.table_alias);
        w.write_lenenc_string(&self.table);
        w.write_lenenc_string(&self.alias);
        w.write_lenenc_string(&self.column);
        if extended_type_info {
            let mut ext = PacketWriter::new();
            if let Some(name) = &self.ext_type_name {
                ext.write_u8(EXT_TYPE_NAME);
                ext.write_lenenc_string(name);
            }
            if let Some(format) = &self.ext_type_format {
                ext.write_u8(EXT_TYPE_FORMAT);
                ext.write_lenenc_string(format);
            }
            w.write_lenenc_bytes(ext.as_bytes());
        }
        w.write_lenenc_int(0x0c);
        w.write_u16_le(self.charset);
        w.write_u32_le(self.length);
        w.write_u8(self.field_type as u8);
        w.write_u16_le(self.flags);
        w.write_u8(self.decimals);
        w.write_zeros(2);
        w.into_bytes()
    }

    /// Report the alias under [`ColumnDefinition::column_name`] too.
    pub fn use_alias_as_name(&mut self) {
        self.use_alias_as_name = true;
    }

    pub fn decoder(&self) -> ColumnDecoder {
        self.decoder
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn table_alias(&self) -> &str {
        &self.table_alias
    }

    /// Name the column was selected as (`AS` alias, or the column name).
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Underlying column name; the alias when the column is computed or
    /// aliases were requested as names.
    pub fn column_name(&self) -> &str {
        if self.use_alias_as_name || self.column.is_empty() {
            &self.alias
        } else {
            &self.column
        }
    }

    pub fn charset(&self) -> u16 {
        self.charset
    }

    /// Declared display length.
    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn decimals(&self) -> u8 {
        self.decimals
    }

    pub fn ext_type_name(&self) -> Option<&str> {
        self.ext_type_name.as_deref()
    }

    pub fn ext_type_format(&self) -> Option<&str> {
        self.ext_type_format.as_deref()
    }

    pub fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    pub fn is_not_null(&self) -> bool {
        self.flags & column_flags::NOT_NULL != 0
    }

    /// Binary collation (charset 63).
    pub fn is_binary(&self) -> bool {
        self.charset == u16::from(charset::BINARY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{GeometryKind, IntWidth};

    #[test]
    fn test_parse_encoded_definition() {
        let def = ColumnDefinition::new("id", FieldType::Long)
            .with_flags(column_flags::UNSIGNED | column_flags::NOT_NULL)
            .with_table("users")
            .with_alias("user_id")
            .with_length(10);
        let parsed = ColumnDefinition::parse(&def.encode(false), false).unwrap();
        assert_eq!(parsed, def);
        assert_eq!(parsed.alias(), "user_id");
        assert_eq!(parsed.column_name(), "id");
        assert!(parsed.is_unsigned());
        assert_eq!(
            parsed.decoder(),
            ColumnDecoder::Int {
                width: IntWidth::Long,
                unsigned: true
            }
        );
    }

    #[test]
    fn test_extended_type_info_selects_geometry_hint() {
        let def = ColumnDefinition::new("shape", FieldType::Geometry).with_extended_type("point");
        let parsed = ColumnDefinition::parse(&def.encode(true), true).unwrap();
        assert_eq!(parsed.ext_type_name(), Some("point"));
        assert_eq!(
            parsed.decoder(),
            ColumnDecoder::Geometry {
                hint: Some(GeometryKind::Point)
            }
        );
    }

    #[test]
    fn test_json_hint_on_blob() {
        let def = ColumnDefinition::new("doc", FieldType::Blob)
            .with_charset(u16::from(charset::UTF8MB4_GENERAL_CI))
            .with_extended_type("json");
        assert_eq!(def.decoder(), ColumnDecoder::Json);
        let text = ColumnDefinition::new("body", FieldType::Blob)
            .with_charset(u16::from(charset::UTF8MB4_GENERAL_CI));
        assert_eq!(text.decoder(), ColumnDecoder::Blob { binary: false });
        assert_eq!(
            ColumnDefinition::new("raw", FieldType::Blob).decoder(),
            ColumnDecoder::Blob { binary: true }
        );
    }

    #[test]
    fn test_alias_as_name() {
        let mut def = ColumnDefinition::new("a", FieldType::VarChar).with_alias("b");
        assert_eq!(def.column_name(), "a");
        def.use_alias_as_name();
        assert_eq!(def.column_name(), "b");
        assert_eq!(def.alias(), "b");
    }

    #[test]
    fn test_truncated_definition_is_protocol_error() {
        let def = ColumnDefinition::new("id", FieldType::Long).encode(false);
        let err = ColumnDefinition::parse(&def[..def.len() - 6], false).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
