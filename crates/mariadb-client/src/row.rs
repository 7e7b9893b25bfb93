//! Result rows with lazy, typed column access.

use std::sync::Arc;

use mariadb_core::error::{DecodeError, DecodeErrorKind, Error, ProtocolError, Result};
use mariadb_core::Value;

use crate::column::{BinaryLayout, ColumnDefinition, DecodeContext, FromColumn, WireFormat};
use crate::protocol::{PacketReader, PacketWriter};

/// One row of a result set.
///
/// The payload is scanned once to locate every column; values are decoded
/// on access, so a failed conversion of one column never affects another.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<[ColumnDefinition]>,
    payload: Vec<u8>,
    /// `(start, len)` per column, `None` for SQL NULL
    offsets: Vec<Option<(usize, usize)>>,
    ctx: DecodeContext,
}

fn malformed(message: String, payload: &[u8]) -> Error {
    Error::Protocol(ProtocolError {
        message,
        raw_data: Some(payload.to_vec()),
    })
}

impl Row {
    /// Scan a row packet in the wire format carried by `ctx`.
    pub fn parse(columns: Arc<[ColumnDefinition]>, payload: Vec<u8>, ctx: DecodeContext) -> Result<Self> {
        let offsets = match ctx.format {
            WireFormat::Text => scan_text(&columns, &payload)?,
            WireFormat::Binary => scan_binary(&columns, &payload)?,
        };
        Ok(Self {
            columns,
            payload,
            offsets,
            ctx,
        })
    }

    /// Build a text-protocol row from column literals.
    pub fn from_text<I, V>(columns: Arc<[ColumnDefinition]>, values: I, ctx: DecodeContext) -> Result<Self>
    where
        I: IntoIterator<Item = Option<V>>,
        V: AsRef<[u8]>,
    {
        let mut w = PacketWriter::new();
        for value in values {
            match value {
                None => w.write_u8(0xFB),
                Some(bytes) => w.write_lenenc_bytes(bytes.as_ref()),
            }
        }
        Self::parse(columns, w.into_bytes(), ctx.with_format(WireFormat::Text))
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    /// Index of the column selected as `name` (case-insensitive).
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.alias().eq_ignore_ascii_case(name))
            .or_else(|| {
                self.columns
                    .iter()
                    .position(|c| c.column_name().eq_ignore_ascii_case(name))
            })
    }

    pub fn is_null(&self, index: usize) -> bool {
        matches!(self.offsets.get(index), Some(None))
    }

    /// Raw bytes of a column as sent by the server.
    pub fn raw(&self, index: usize) -> Option<&[u8]> {
        let (start, len) = (*self.offsets.get(index)?)?;
        Some(&self.payload[start..start + len])
    }

    /// Decode a column; SQL NULL (and zero temporal values) become `None`.
    pub fn get_opt<T: FromColumn>(&self, index: usize) -> Result<Option<T>> {
        let slot = self.offsets.get(index).ok_or_else(|| {
            Error::state(format!(
                "column index {} out of bounds (row has {} columns)",
                index,
                self.len()
            ))
        })?;
        let Some((start, len)) = *slot else {
            return Ok(None);
        };
        let mut reader = PacketReader::at(&self.payload, start);
        T::decode(&self.columns[index], &mut reader, len, &self.ctx).map_err(Error::Decode)
    }

    /// Decode a non-null column.
    pub fn get<T: FromColumn>(&self, index: usize) -> Result<T> {
        self.get_opt(index)?.ok_or_else(|| {
            Error::Decode(DecodeError {
                server_type: self.columns[index].decoder().type_name(),
                target: T::TARGET,
                kind: DecodeErrorKind::Unparseable,
                detail: format!("column {} is NULL", self.columns[index].alias()),
            })
        })
    }

    pub fn get_by_name<T: FromColumn>(&self, name: &str) -> Result<T> {
        let index = self
            .column_index(name)
            .ok_or_else(|| Error::state(format!("no column named '{}'", name)))?;
        self.get(index)
    }

    /// Default [`Value`] mapping of a column.
    pub fn value(&self, index: usize) -> Result<Value> {
        Ok(self.get_opt::<Value>(index)?.unwrap_or(Value::Null))
    }

    pub fn values(&self) -> Result<Vec<Value>> {
        (0..self.len()).map(|i| self.value(i)).collect()
    }
}

fn scan_text(columns: &[ColumnDefinition], payload: &[u8]) -> Result<Vec<Option<(usize, usize)>>> {
    let mut reader = PacketReader::new(payload);
    let mut offsets = Vec::with_capacity(columns.len());
    for index in 0..columns.len() {
        if reader.peek() == Some(0xFB) {
            reader.skip(1);
            offsets.push(None);
            continue;
        }
        let len = reader
            .read_lenenc_int()
            .ok_or_else(|| malformed(format!("text row truncated at column {}", index), payload))?;
        let len = usize::try_from(len)
            .map_err(|_| malformed(format!("column {} length overflow", index), payload))?;
        let start = reader.position();
        if !reader.skip(len) {
            return Err(malformed(
                format!("text row truncated in column {}", index),
                payload,
            ));
        }
        offsets.push(Some((start, len)));
    }
    Ok(offsets)
}

fn scan_binary(columns: &[ColumnDefinition], payload: &[u8]) -> Result<Vec<Option<(usize, usize)>>> {
    let mut reader = PacketReader::new(payload);
    if reader.read_u8() != Some(0x00) {
        return Err(malformed("binary row without 0x00 header".to_string(), payload));
    }
    // NULL bitmap, offset by two bits
    let bitmap = reader
        .read_bytes((columns.len() + 9) / 8)
        .ok_or_else(|| malformed("binary row truncated in null bitmap".to_string(), payload))?;

    let mut offsets = Vec::with_capacity(columns.len());
    for (index, column) in columns.iter().enumerate() {
        let bit = index + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            offsets.push(None);
            continue;
        }
        let truncated = || malformed(format!("binary row truncated in column {}", index), payload);
        let len = match column.decoder().binary_layout() {
            BinaryLayout::Fixed(n) => n,
            BinaryLayout::LengthPrefixed => usize::from(reader.read_u8().ok_or_else(truncated)?),
            BinaryLayout::LengthEncoded => {
                let len = reader.read_lenenc_int().ok_or_else(truncated)?;
                usize::try_from(len).map_err(|_| truncated())?
            }
        };
        let start = reader.position();
        if !reader.skip(len) {
            return Err(truncated());
        }
        offsets.push(Some((start, len)));
    }
    Ok(offsets)
}

/// Encode a binary protocol row from already-encoded column values.
pub fn encode_binary_row(values: &[Option<Vec<u8>>]) -> Vec<u8> {
    let mut payload = vec![0x00];
    let mut bitmap = vec![0u8; (values.len() + 9) / 8];
    for (index, value) in values.iter().enumerate() {
        if value.is_none() {
            let bit = index + 2;
            bitmap[bit / 8] |= 1 << (bit % 8);
        }
    }
    payload.extend_from_slice(&bitmap);
    for value in values.iter().flatten() {
        payload.extend_from_slice(value);
    }
    payload
}
