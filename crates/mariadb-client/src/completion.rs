//! Results of executed commands.

use std::collections::VecDeque;
use std::sync::Arc;

use mariadb_core::error::{Error, Result};

use crate::column::ColumnDefinition;
use crate::connection::Connection;
use crate::prepare::PreparedStatement;
use crate::protocol::OkPacket;
use crate::row::Row;

/// Outcome of one statement.
#[derive(Debug)]
pub enum Completion {
    /// Statement without a result set
    Update(OkResult),
    /// Result set
    Rows(ResultSet),
    /// A statement prepared by [`Command::Prepare`](crate::Command::Prepare)
    Prepared(PreparedStatement),
}

impl Completion {
    pub fn affected_rows(&self) -> u64 {
        match self {
            Completion::Update(ok) => ok.affected_rows,
            _ => 0,
        }
    }

    pub fn into_result_set(self) -> Result<ResultSet> {
        match self {
            Completion::Rows(rs) => Ok(rs),
            _ => Err(Error::state("statement did not produce a result set")),
        }
    }

    pub fn into_prepared(self) -> Result<PreparedStatement> {
        match self {
            Completion::Prepared(stmt) => Ok(stmt),
            _ => Err(Error::state("command did not prepare a statement")),
        }
    }
}

/// Update count and server status of a statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkResult {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub warnings: u16,
    pub status: u16,
    pub info: String,
}

impl From<OkPacket> for OkResult {
    fn from(ok: OkPacket) -> Self {
        Self {
            affected_rows: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
            warnings: ok.warnings,
            status: ok.status_flags,
            info: ok.info,
        }
    }
}

/// Rows of one result set.
///
/// A streaming result set (see [`ExecuteOptions::fetch_size`](crate::ExecuteOptions))
/// holds only the fetched rows; [`ResultSet::fetch_more`] reads the next
/// batch from the connection.
#[derive(Debug)]
pub struct ResultSet {
    columns: Arc<[ColumnDefinition]>,
    rows: VecDeque<Row>,
    /// Token of the streaming read still open on the connection
    stream: Option<u64>,
    warnings: u16,
    status: u16,
}

impl ResultSet {
    pub(crate) fn new(columns: Arc<[ColumnDefinition]>, rows: Vec<Row>, stream: Option<u64>) -> Self {
        Self {
            columns,
            rows: rows.into(),
            stream,
            warnings: 0,
            status: 0,
        }
    }

    pub(crate) fn finish(&mut self, warnings: u16, status: u16) {
        self.stream = None;
        self.warnings = warnings;
        self.status = status;
    }

    pub(crate) fn stream_token(&self) -> Option<u64> {
        self.stream
    }

    pub(crate) fn extend(&mut self, rows: Vec<Row>) {
        self.rows.extend(rows);
    }

    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    /// Rows fetched and not yet taken.
    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Take the next fetched row.
    pub fn next_row(&mut self) -> Option<Row> {
        self.rows.pop_front()
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows.into()
    }

    /// More rows remain on the connection.
    pub fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    pub fn warnings(&self) -> u16 {
        self.warnings
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Read the next batch of a streaming result set.
    ///
    /// Returns `false` once the result set is complete. Fails with a state
    /// error if a later command on the connection discarded the remainder.
    pub fn fetch_more(&mut self, conn: &Connection) -> Result<bool> {
        if self.stream.is_none() {
            return Ok(false);
        }
        conn.fetch_more(self)?;
        Ok(self.stream.is_some() || !self.rows.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{DecodeContext, FieldType};

    #[test]
    fn test_result_set_access() {
        let columns: Arc<[ColumnDefinition]> =
            vec![ColumnDefinition::new("n", FieldType::Long)].into();
        let rows = ["1", "2"]
            .iter()
            .map(|v| Row::from_text(columns.clone(), [Some(*v)], DecodeContext::text()).unwrap())
            .collect();
        let mut rs = ResultSet::new(columns, rows, None);
        assert_eq!(rs.len(), 2);
        assert!(!rs.is_streaming());
        assert_eq!(rs.next_row().unwrap().get::<i32>(0).unwrap(), 1);
        assert_eq!(rs.into_rows().len(), 1);
    }

    #[test]
    fn test_completion_conversions() {
        let update = Completion::Update(OkResult {
            affected_rows: 3,
            ..OkResult::default()
        });
        assert_eq!(update.affected_rows(), 3);
        assert!(matches!(update.into_result_set(), Err(Error::State(_))));
    }
}
