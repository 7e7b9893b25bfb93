//! MariaDB/MySQL wire protocol.
//!
//! Packets have a 4-byte header:
//! - 3 bytes: payload length (little-endian)
//! - 1 byte: sequence number
//!
//! The maximum frame payload is 2^24 - 1 bytes. Larger payloads span
//! several frames and are reassembled by [`framing::PacketIo`].

pub mod framing;
pub mod prepared;
pub mod reader;
pub mod writer;

pub use framing::PacketIo;
pub use prepared::{StmtPrepareOk, build_stmt_execute_packet, parse_stmt_prepare_ok};
pub use reader::PacketReader;
pub use writer::PacketWriter;

/// Maximum payload size of a single frame (2^24 - 1 bytes).
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// Capability flags (client and server).
///
/// Bits 0..31 are the classic flags. MariaDB servers that clear
/// `CLIENT_MYSQL` (bit 0) advertise extended flags in the greeting's
/// reserved area; they are kept here shifted into bits 32..63.
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_MYSQL: u64 = 1;
    pub const CLIENT_FOUND_ROWS: u64 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u64 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u64 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u64 = 1 << 4;
    pub const CLIENT_COMPRESS: u64 = 1 << 5;
    pub const CLIENT_ODBC: u64 = 1 << 6;
    pub const CLIENT_LOCAL_FILES: u64 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u64 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u64 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u64 = 1 << 10;
    pub const CLIENT_SSL: u64 = 1 << 11;
    pub const CLIENT_IGNORE_SIGPIPE: u64 = 1 << 12;
    pub const CLIENT_TRANSACTIONS: u64 = 1 << 13;
    pub const CLIENT_RESERVED: u64 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u64 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u64 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u64 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u64 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u64 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u64 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u64 = 1 << 21;
    pub const CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS: u64 = 1 << 22;
    pub const CLIENT_SESSION_TRACK: u64 = 1 << 23;
    pub const CLIENT_DEPRECATE_EOF: u64 = 1 << 24;
    pub const CLIENT_ZSTD_COMPRESSION_ALGORITHM: u64 = 1 << 26;

    pub const MARIADB_CLIENT_PROGRESS: u64 = 1 << 32;
    pub const MARIADB_CLIENT_COM_MULTI: u64 = 1 << 33;
    pub const MARIADB_CLIENT_STMT_BULK_OPERATIONS: u64 = 1 << 34;
    pub const MARIADB_CLIENT_EXTENDED_TYPE_INFO: u64 = 1 << 35;
    pub const MARIADB_CLIENT_CACHE_METADATA: u64 = 1 << 36;

    /// Flags every connection requires from the server.
    pub const REQUIRED: u64 = CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_RESULTS;

    /// Flags requested whenever the server offers them.
    pub const OPTIONAL: u64 = CLIENT_IGNORE_SPACE
        | CLIENT_FOUND_ROWS
        | CLIENT_LONG_FLAG
        | CLIENT_PS_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CLIENT_CONNECT_ATTRS
        | CLIENT_SESSION_TRACK
        | CLIENT_DEPRECATE_EOF
        | MARIADB_CLIENT_EXTENDED_TYPE_INFO;
}

/// Command codes (COM_xxx) sent as the first payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandCode {
    /// Close the connection
    Quit = 0x01,
    /// Switch the default database
    InitDb = 0x02,
    /// Text protocol query
    Query = 0x03,
    /// Kill a thread (superseded by `KILL` statements)
    ProcessKill = 0x0c,
    /// Ping server
    Ping = 0x0e,
    /// Change user
    ChangeUser = 0x11,
    /// Prepare statement
    StmtPrepare = 0x16,
    /// Execute prepared statement
    StmtExecute = 0x17,
    /// Send long data for prepared statement
    StmtSendLongData = 0x18,
    /// Close prepared statement
    StmtClose = 0x19,
    /// Reset prepared statement
    StmtReset = 0x1a,
    /// Set option
    SetOption = 0x1b,
    /// Fetch cursor rows
    StmtFetch = 0x1c,
    /// Reset session state
    ResetConnection = 0x1f,
}

/// Server status flags.
#[allow(dead_code)]
pub mod server_status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_NO_GOOD_INDEX_USED: u16 = 0x0010;
    pub const SERVER_STATUS_NO_INDEX_USED: u16 = 0x0020;
    pub const SERVER_STATUS_CURSOR_EXISTS: u16 = 0x0040;
    pub const SERVER_STATUS_LAST_ROW_SENT: u16 = 0x0080;
    pub const SERVER_STATUS_DB_DROPPED: u16 = 0x0100;
    pub const SERVER_STATUS_NO_BACKSLASH_ESCAPES: u16 = 0x0200;
    pub const SERVER_STATUS_METADATA_CHANGED: u16 = 0x0400;
    pub const SERVER_QUERY_WAS_SLOW: u16 = 0x0800;
    pub const SERVER_PS_OUT_PARAMS: u16 = 0x1000;
    pub const SERVER_STATUS_IN_TRANS_READONLY: u16 = 0x2000;
    pub const SERVER_SESSION_STATE_CHANGED: u16 = 0x4000;
}

/// Session state tracking entry types (OK packet, CLIENT_SESSION_TRACK).
#[allow(dead_code)]
pub mod session_track {
    pub const SYSTEM_VARIABLES: u8 = 0x00;
    pub const SCHEMA: u8 = 0x01;
    pub const STATE_CHANGE: u8 = 0x02;
    pub const GTIDS: u8 = 0x03;
    pub const TRANSACTION_CHARACTERISTICS: u8 = 0x04;
    pub const TRANSACTION_STATE: u8 = 0x05;
}

/// Collation ids.
#[allow(dead_code)]
pub mod charset {
    pub const LATIN1_SWEDISH_CI: u8 = 8;
    pub const UTF8_GENERAL_CI: u8 = 33;
    pub const UTF8MB4_GENERAL_CI: u8 = 45;
    pub const BINARY: u8 = 63;
    pub const UTF8MB4_UNICODE_CI: u8 = 224;
    pub const UTF8MB4_0900_AI_CI: u8 = 255;

    /// Collation ids that belong to a 4-byte UTF-8 character set.
    pub fn is_utf8mb4(collation: u8) -> bool {
        collation == UTF8MB4_GENERAL_CI
            || collation == 46
            || (224..=247).contains(&collation)
            || collation == UTF8MB4_0900_AI_CI
    }
}

/// A packet frame header.
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    /// Payload length (3 bytes, max 16MB - 1)
    pub payload_length: u32,
    /// Sequence number (wraps at 255)
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Total header size in bytes.
    pub const SIZE: usize = 4;

    /// Parse a frame header from 4 bytes.
    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        let payload_length =
            u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16);
        Self {
            payload_length,
            sequence_id: bytes[3],
        }
    }

    /// Encode the header to 4 bytes.
    pub fn to_bytes(&self) -> [u8; 4] {
        let len = self.payload_length.to_le_bytes();
        [len[0], len[1], len[2], self.sequence_id]
    }
}

/// Server response packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// OK packet (0x00)
    Ok,
    /// Error packet (0xFF)
    Error,
    /// EOF packet (0xFE, payload < 9 bytes)
    Eof,
    /// Local infile request (0xFB)
    LocalInfile,
    /// Data packet (row, column definition, ...)
    Data,
}

impl PacketType {
    /// Detect packet type from the first byte of payload.
    pub fn from_first_byte(byte: u8, payload_len: usize) -> Self {
        match byte {
            0x00 => PacketType::Ok,
            0xFF => PacketType::Error,
            0xFE if payload_len < 9 => PacketType::Eof,
            0xFB => PacketType::LocalInfile,
            _ => PacketType::Data,
        }
    }
}

/// Parsed OK packet.
#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    /// Number of affected rows
    pub affected_rows: u64,
    /// Last insert ID
    pub last_insert_id: u64,
    /// Server status flags
    pub status_flags: u16,
    /// Number of warnings
    pub warnings: u16,
    /// Info string (if any)
    pub info: String,
    /// New default schema reported through session tracking
    pub schema_change: Option<String>,
}

/// Parsed Error packet.
#[derive(Debug, Clone)]
pub struct ErrPacket {
    /// Error code
    pub error_code: u16,
    /// SQL state (5 characters)
    pub sql_state: String,
    /// Error message
    pub error_message: String,
}

/// Parsed EOF packet (absent when CLIENT_DEPRECATE_EOF is negotiated).
#[derive(Debug, Clone, Copy)]
pub struct EofPacket {
    /// Number of warnings
    pub warnings: u16,
    /// Server status flags
    pub status_flags: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::cast_possible_truncation)]
    fn test_packet_header_max_size() {
        let header = PacketHeader {
            payload_length: MAX_PACKET_SIZE as u32,
            sequence_id: 255,
        };
        assert_eq!(header.to_bytes(), [0xFF, 0xFF, 0xFF, 255]);
        let parsed = PacketHeader::from_bytes(&[0x56, 0x34, 0x12, 7]);
        assert_eq!(parsed.payload_length, 0x0012_3456);
        assert_eq!(parsed.sequence_id, 7);
    }

    #[test]
    fn test_packet_type_detection() {
        assert_eq!(PacketType::from_first_byte(0x00, 10), PacketType::Ok);
        assert_eq!(PacketType::from_first_byte(0xFF, 10), PacketType::Error);
        assert_eq!(PacketType::from_first_byte(0xFE, 5), PacketType::Eof);
        assert_eq!(PacketType::from_first_byte(0xFE, 100), PacketType::Data);
        assert_eq!(PacketType::from_first_byte(0x42, 10), PacketType::Data);
    }

    #[test]
    fn test_required_capabilities() {
        use capabilities::*;
        assert_eq!(CLIENT_PROTOCOL_41, 512);
        assert_eq!(CLIENT_SSL, 2048);
        assert_eq!(CLIENT_MULTI_STATEMENTS, 65536);
        assert_eq!(CLIENT_SESSION_TRACK, 1 << 23);
        assert_eq!(REQUIRED & CLIENT_MULTI_STATEMENTS, 0);
        assert!(charset::is_utf8mb4(charset::UTF8MB4_UNICODE_CI));
        assert!(!charset::is_utf8mb4(charset::UTF8_GENERAL_CI));
    }
}
