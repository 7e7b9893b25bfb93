//! Transaction isolation levels.

use std::fmt;
use std::str::FromStr;

/// Transaction isolation level.
///
/// The server default for InnoDB is [`IsolationLevel::RepeatableRead`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Dirty reads, non-repeatable reads and phantoms are all possible.
    ReadUncommitted,

    /// Only committed changes of other transactions are visible.
    ReadCommitted,

    /// Consistent snapshot for the duration of the transaction.
    #[default]
    RepeatableRead,

    /// Transactions appear to execute one after another.
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL syntax for this isolation level.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Parses both the SQL form (`READ COMMITTED`) and the server variable
/// form (`READ-COMMITTED`), case-insensitively.
impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace(['-', '_'], " ").to_ascii_uppercase();
        match normalized.as_str() {
            "READ UNCOMMITTED" => Ok(IsolationLevel::ReadUncommitted),
            "READ COMMITTED" => Ok(IsolationLevel::ReadCommitted),
            "REPEATABLE READ" => Ok(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            _ => Err(format!("unknown isolation level '{}'", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_server_variable_form() {
        assert_eq!(
            "REPEATABLE-READ".parse::<IsolationLevel>(),
            Ok(IsolationLevel::RepeatableRead)
        );
        assert_eq!(
            "read committed".parse::<IsolationLevel>(),
            Ok(IsolationLevel::ReadCommitted)
        );
        assert!("SNAPSHOT".parse::<IsolationLevel>().is_err());
        assert_eq!(IsolationLevel::Serializable.to_string(), "SERIALIZABLE");
    }
}
