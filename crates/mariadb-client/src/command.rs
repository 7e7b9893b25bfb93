//! Commands accepted by a connection.

use mariadb_core::Value;

use crate::prepare::PreparedStatement;

/// One client request.
#[derive(Debug, Clone)]
pub enum Command {
    /// Text protocol query
    Query(String),
    /// Prepare (through the cache) without executing
    Prepare(String),
    /// Prepare through the cache, then execute with binary parameters
    Execute { sql: String, params: Vec<Value> },
    /// Execute an explicit handle; re-prepared if it belongs to an older session
    ExecuteStatement {
        statement: PreparedStatement,
        params: Vec<Value>,
    },
    Ping,
    /// Switch the default database
    InitDb(String),
    /// COM_RESET_CONNECTION
    ResetConnection,
}

impl Command {
    pub fn query(sql: impl Into<String>) -> Self {
        Command::Query(sql.into())
    }

    pub fn execute(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Command::Execute {
            sql: sql.into(),
            params,
        }
    }

    /// SQL text, for commands that carry one.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Command::Query(sql) | Command::Prepare(sql) | Command::Execute { sql, .. } => Some(sql),
            Command::ExecuteStatement { statement, .. } => Some(statement.sql()),
            Command::Ping | Command::InitDb(_) | Command::ResetConnection => None,
        }
    }

    /// Whether the command can be sent again on a new session with the
    /// same effect inside a transaction.
    pub fn is_replayable(&self) -> bool {
        !matches!(self, Command::ResetConnection)
    }

    /// Commands with no effect on the transaction are not recorded.
    pub fn needs_recording(&self) -> bool {
        !matches!(self, Command::Ping | Command::Prepare(_))
    }

    pub fn is_commit(&self) -> bool {
        self.sql().is_some_and(|sql| {
            let sql = sql.trim_start();
            sql.get(..6).is_some_and(|w| w.eq_ignore_ascii_case("commit"))
        })
    }
}

/// Truncate SQL for error messages and logs.
pub(crate) fn sql_excerpt(sql: &str, max: usize) -> String {
    if sql.len() <= max {
        return sql.to_string();
    }
    let mut end = max;
    while !sql.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &sql[..end])
}
