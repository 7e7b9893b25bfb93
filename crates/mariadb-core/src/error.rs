//! Error types for MariaDB client operations.
//!
//! The taxonomy separates errors by how a caller (or the failover layer)
//! is expected to react to them:
//!
//! - [`Error::Decode`] is local to one column access.
//! - [`Error::Server`] is an explicit error packet, surfaced as-is.
//! - [`Error::Connection`] is split into transient kinds (socket loss,
//!   timeouts, oversized packets) and non-transient kinds (connect/auth).
//! - [`Error::TransactionLost`] means connectivity recovered but the open
//!   transaction did not survive.
//! - [`Error::State`] is a usage error and never triggers reconnection.

use std::fmt;

/// SQL-state used for synthetic connectivity errors.
pub const SQLSTATE_CONNECTION: &str = "08000";
/// SQL-state used when a transaction could not survive a reconnection.
pub const SQLSTATE_TRANSACTION_LOST: &str = "25S03";
/// SQL-state for numeric overflow on decode.
pub const SQLSTATE_NUMERIC_OVERFLOW: &str = "22003";
/// SQL-state for any other invalid conversion on decode.
pub const SQLSTATE_INVALID_CONVERSION: &str = "22018";
/// General error SQL-state.
pub const SQLSTATE_GENERAL: &str = "HY000";

/// The primary error type for all client operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-level failure (socket, handshake, timeout)
    Connection(ConnectionError),
    /// The server replied with an error packet
    Server(ServerError),
    /// Column bytes could not be decoded into the requested type
    Decode(DecodeError),
    /// Reconnected, but the open transaction was lost
    TransactionLost(TransactionLostError),
    /// Invalid use of the API (closed connection, forbidden switch, ...)
    State(StateError),
    /// A pipeline failed part-way through
    Batch(BatchError),
    /// Malformed or unexpected packet
    Protocol(ProtocolError),
    /// Invalid configuration
    Config(ConfigError),
    /// I/O errors outside the connection socket (certificate files, ...)
    Io(std::io::Error),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Authentication failed
    Authentication,
    /// Connection lost during operation
    Disconnected,
    /// Socket read or write exceeded its timeout
    Timeout,
    /// Packet larger than the server's max_allowed_packet
    PacketTooLarge,
    /// SSL/TLS negotiation failed
    Ssl,
    /// DNS resolution failed
    DnsResolution,
    /// Connection refused
    Refused,
}

impl ConnectionErrorKind {
    /// Transient kinds tear down the socket and trigger failover.
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            ConnectionErrorKind::Disconnected
                | ConnectionErrorKind::Timeout
                | ConnectionErrorKind::PacketTooLarge
        )
    }
}

/// An error packet sent by the server.
#[derive(Debug, Clone)]
pub struct ServerError {
    pub code: u16,
    pub sqlstate: String,
    pub message: String,
    /// The statement that failed, when known (possibly truncated)
    pub sql: Option<String>,
}

impl ServerError {
    /// ER_DUP_ENTRY
    pub fn is_duplicate_key(&self) -> bool {
        self.code == 1062
    }

    /// ER_ROW_IS_REFERENCED_2 / ER_NO_REFERENCED_ROW_2
    pub fn is_foreign_key_violation(&self) -> bool {
        self.code == 1451 || self.code == 1452
    }

    /// ER_LOCK_DEADLOCK / ER_LOCK_WAIT_TIMEOUT
    pub fn is_deadlock(&self) -> bool {
        self.code == 1213 || self.code == 1205
    }
}

#[derive(Debug, Clone)]
pub struct DecodeError {
    /// Server column type the bytes came from (e.g. "INT UNSIGNED")
    pub server_type: &'static str,
    /// Requested target representation (e.g. "i32")
    pub target: &'static str,
    pub kind: DecodeErrorKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// Value does not fit in the target type
    Overflow,
    /// Bytes are not a valid literal for the target type
    Unparseable,
    /// The server type cannot be converted to the target at all
    Unsupported,
}

impl DecodeError {
    pub fn overflow(server_type: &'static str, target: &'static str, value: impl fmt::Display) -> Self {
        Self {
            server_type,
            target,
            kind: DecodeErrorKind::Overflow,
            detail: format!("value {} out of range", value),
        }
    }

    pub fn unparseable(
        server_type: &'static str,
        target: &'static str,
        literal: impl fmt::Display,
    ) -> Self {
        Self {
            server_type,
            target,
            kind: DecodeErrorKind::Unparseable,
            detail: format!("value '{}' cannot be decoded", literal),
        }
    }

    pub fn unsupported(server_type: &'static str, target: &'static str) -> Self {
        Self {
            server_type,
            target,
            kind: DecodeErrorKind::Unsupported,
            detail: "conversion not supported".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct TransactionLostError {
    pub message: String,
    /// The transient error that forced the reconnection
    pub cause: Option<Box<Error>>,
}

#[derive(Debug, Clone)]
pub struct StateError {
    pub message: String,
}

/// Per-command outcome of a failed pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Response read and accepted
    Succeeded,
    /// This command produced the surfaced error
    Failed,
    /// Response drained (or abandoned) after the failure; result discarded
    Discarded,
}

#[derive(Debug)]
pub struct BatchError {
    /// One entry per submitted command, in submission order
    pub outcomes: Vec<BatchOutcome>,
    /// The first real error of the pipeline
    pub cause: Box<Error>,
}

impl BatchError {
    /// Index of the command that raised [`BatchError::cause`].
    pub fn failed_index(&self) -> Option<usize> {
        self.outcomes
            .iter()
            .position(|outcome| *outcome == BatchOutcome::Failed)
    }
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Socket-level failures that tear down the connection and are the
    /// sole trigger for failover reconnection.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Connection(e) => e.kind.is_transient(),
            Error::Batch(e) => e.cause.is_transient(),
            _ => false,
        }
    }

    /// Check if this is a connection-level error (transient or not).
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// SQL-state of this error; server-supplied when available.
    pub fn sqlstate(&self) -> &str {
        match self {
            Error::Server(e) if !e.sqlstate.is_empty() => &e.sqlstate,
            Error::Server(_) => SQLSTATE_GENERAL,
            Error::Connection(_) | Error::Io(_) => SQLSTATE_CONNECTION,
            Error::Decode(e) => match e.kind {
                DecodeErrorKind::Overflow => SQLSTATE_NUMERIC_OVERFLOW,
                _ => SQLSTATE_INVALID_CONVERSION,
            },
            Error::TransactionLost(_) => SQLSTATE_TRANSACTION_LOST,
            Error::Batch(e) => e.cause.sqlstate(),
            Error::State(_) | Error::Protocol(_) | Error::Config(_) => SQLSTATE_GENERAL,
        }
    }

    /// Server error code, when the error came from an error packet.
    pub fn code(&self) -> Option<u16> {
        match self {
            Error::Server(e) => Some(e.code),
            Error::Batch(e) => e.cause.code(),
            Error::TransactionLost(e) => e.cause.as_ref().and_then(|c| c.code()),
            _ => None,
        }
    }

    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Error::Connection(ConnectionError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    pub fn state(message: impl Into<String>) -> Self {
        Error::State(StateError {
            message: message.into(),
        })
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(ProtocolError {
            message: message.into(),
            raw_data: None,
        })
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }

    pub fn transaction_lost(message: impl Into<String>, cause: Option<Error>) -> Self {
        Error::TransactionLost(TransactionLostError {
            message: message.into(),
            cause: cause.map(Box::new),
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e),
            Error::Server(e) => write!(f, "{}", e),
            Error::Decode(e) => write!(f, "Decode error: {}", e),
            Error::TransactionLost(e) => write!(f, "{}", e.message),
            Error::State(e) => write!(f, "Invalid state: {}", e.message),
            Error::Batch(e) => write!(f, "{}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::TransactionLost(e) => e
                .cause
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Batch(e) => Some(e.cause.as_ref()),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Server error {} (SQLSTATE {}): {}",
            self.code, self.sqlstate, self.message
        )?;
        if let Some(sql) = &self.sql {
            write!(f, "\nQuery is: {}", sql)?;
        }
        Ok(())
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot decode {} as {}: {}",
            self.server_type, self.target, self.detail
        )
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.failed_index() {
            Some(index) => write!(
                f,
                "Pipeline failed at command {} of {}: {}",
                index + 1,
                self.outcomes.len(),
                self.cause
            ),
            None => write!(f, "Pipeline failed: {}", self.cause),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::Server(err)
    }
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Error::Decode(err)
    }
}

impl From<BatchError> for Error {
    fn from(err: BatchError) -> Self {
        Error::Batch(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let lost = Error::connection(ConnectionErrorKind::Disconnected, "socket closed");
        let timeout = Error::connection(ConnectionErrorKind::Timeout, "read timed out");
        let too_large = Error::connection(ConnectionErrorKind::PacketTooLarge, "packet too large");
        let refused = Error::connection(ConnectionErrorKind::Refused, "refused");
        let auth = Error::connection(ConnectionErrorKind::Authentication, "denied");

        assert!(lost.is_transient());
        assert!(timeout.is_transient());
        assert!(too_large.is_transient());
        assert!(!refused.is_transient());
        assert!(!auth.is_transient());
        assert!(refused.is_connection_error());
        assert!(!Error::state("closed").is_transient());
    }

    #[test]
    fn sqlstate_helpers() {
        let server = Error::Server(ServerError {
            code: 1062,
            sqlstate: "23000".to_string(),
            message: "Duplicate entry".to_string(),
            sql: None,
        });
        assert_eq!(server.sqlstate(), "23000");
        assert_eq!(server.code(), Some(1062));

        let lost = Error::connection(ConnectionErrorKind::Disconnected, "gone");
        assert_eq!(lost.sqlstate(), "08000");
        assert_eq!(lost.code(), None);

        let tx = Error::transaction_lost("transaction lost", Some(lost));
        assert_eq!(tx.sqlstate(), "25S03");

        let overflow = Error::Decode(DecodeError::overflow("INT UNSIGNED", "i32", 3_000_000_000u32));
        assert_eq!(overflow.sqlstate(), "22003");
        let bad = Error::Decode(DecodeError::unparseable("VARCHAR", "i64", "abc"));
        assert_eq!(bad.sqlstate(), "22018");
    }

    #[test]
    fn batch_error_reports_failed_command() {
        let err = BatchError {
            outcomes: vec![
                BatchOutcome::Succeeded,
                BatchOutcome::Failed,
                BatchOutcome::Discarded,
            ],
            cause: Box::new(Error::connection(
                ConnectionErrorKind::Disconnected,
                "socket closed",
            )),
        };
        assert_eq!(err.failed_index(), Some(1));
        assert!(err.to_string().contains("command 2 of 3"));

        let err = Error::Batch(err);
        assert!(err.is_transient());
        assert_eq!(err.sqlstate(), "08000");
    }

    #[test]
    fn server_error_display_includes_query() {
        let err = ServerError {
            code: 1146,
            sqlstate: "42S02".to_string(),
            message: "Table 'test.t' doesn't exist".to_string(),
            sql: Some("SELECT * FROM t".to_string()),
        };
        let text = err.to_string();
        assert!(text.contains("1146"));
        assert!(text.contains("Query is: SELECT * FROM t"));
    }
}
