//! Per-connection session state.

use std::time::Duration;

use bitflags::bitflags;
use mariadb_core::IsolationLevel;

use crate::column::DecodeContext;
use crate::handshake::ServerVersion;
use crate::protocol::{OkPacket, capabilities, server_status};

bitflags! {
    /// Session settings changed by the application since connect.
    ///
    /// After a failover only the dirty settings are copied onto the new
    /// connection; the rest keep the new session's defaults.
    #[derive(Default)]
    pub struct StateFlags: u8 {
        const AUTOCOMMIT = 0b0000_0001;
        const DATABASE = 0b0000_0010;
        const NETWORK_TIMEOUT = 0b0000_0100;
        const READ_ONLY = 0b0000_1000;
        const ISOLATION = 0b0001_0000;
    }
}

/// Negotiated and mutable state of one session.
#[derive(Debug, Clone)]
pub struct SessionContext {
    server_capabilities: u64,
    client_capabilities: u64,
    server_status: u16,
    thread_id: u32,
    server_version: ServerVersion,
    collation: u8,
    database: Option<String>,
    isolation: Option<IsolationLevel>,
    read_only: bool,
    network_timeout: Option<Duration>,
    dirty: StateFlags,
    decode: DecodeContext,
}

/// The application-visible settings of a session, for failover resync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub dirty: StateFlags,
    pub autocommit: bool,
    pub database: Option<String>,
    pub isolation: Option<IsolationLevel>,
    pub read_only: bool,
    pub network_timeout: Option<Duration>,
}

impl SessionContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        server_capabilities: u64,
        client_capabilities: u64,
        server_status: u16,
        thread_id: u32,
        server_version: ServerVersion,
        collation: u8,
        database: Option<String>,
        decode: DecodeContext,
    ) -> Self {
        Self {
            server_capabilities,
            client_capabilities,
            server_status,
            thread_id,
            server_version,
            collation,
            database,
            isolation: None,
            read_only: false,
            network_timeout: None,
            dirty: StateFlags::empty(),
            decode,
        }
    }

    pub fn server_capabilities(&self) -> u64 {
        self.server_capabilities
    }

    pub fn client_capabilities(&self) -> u64 {
        self.client_capabilities
    }

    /// Negotiated capability check.
    pub fn has_capability(&self, flag: u64) -> bool {
        self.client_capabilities & flag != 0
    }

    pub fn server_status(&self) -> u16 {
        self.server_status
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn server_version(&self) -> &ServerVersion {
        &self.server_version
    }

    pub fn is_mariadb(&self) -> bool {
        self.server_version.mariadb
    }

    pub fn collation(&self) -> u8 {
        self.collation
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn network_timeout(&self) -> Option<Duration> {
        self.network_timeout
    }

    pub fn autocommit(&self) -> bool {
        self.server_status & server_status::SERVER_STATUS_AUTOCOMMIT != 0
    }

    pub fn in_transaction(&self) -> bool {
        self.server_status & server_status::SERVER_STATUS_IN_TRANS != 0
    }

    pub fn more_results(&self) -> bool {
        self.server_status & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }

    pub fn deprecate_eof(&self) -> bool {
        self.has_capability(capabilities::CLIENT_DEPRECATE_EOF)
    }

    pub fn extended_type_info(&self) -> bool {
        self.has_capability(capabilities::MARIADB_CLIENT_EXTENDED_TYPE_INFO)
    }

    pub fn session_track(&self) -> bool {
        self.has_capability(capabilities::CLIENT_SESSION_TRACK)
    }

    pub fn decode_context(&self) -> DecodeContext {
        self.decode
    }

    pub fn dirty(&self) -> StateFlags {
        self.dirty
    }

    pub(crate) fn set_status(&mut self, status: u16) {
        self.server_status = status;
    }

    /// Apply an OK packet: status flags and tracked schema changes.
    pub(crate) fn apply_ok(&mut self, ok: &OkPacket) {
        self.server_status = ok.status_flags;
        if let Some(schema) = &ok.schema_change {
            self.database = (!schema.is_empty()).then(|| schema.clone());
        }
    }

    pub(crate) fn set_autocommit(&mut self, autocommit: bool) {
        if autocommit {
            self.server_status |= server_status::SERVER_STATUS_AUTOCOMMIT;
        } else {
            self.server_status &= !server_status::SERVER_STATUS_AUTOCOMMIT;
        }
        self.dirty |= StateFlags::AUTOCOMMIT;
    }

    pub(crate) fn set_database(&mut self, database: &str) {
        self.database = Some(database.to_string());
        self.dirty |= StateFlags::DATABASE;
    }

    pub(crate) fn set_isolation(&mut self, level: IsolationLevel) {
        self.isolation = Some(level);
        self.dirty |= StateFlags::ISOLATION;
    }

    pub(crate) fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
        self.dirty |= StateFlags::READ_ONLY;
    }

    pub(crate) fn set_network_timeout(&mut self, timeout: Option<Duration>) {
        self.network_timeout = timeout;
        self.dirty |= StateFlags::NETWORK_TIMEOUT;
    }

    /// Initial isolation level from the configuration; not a user change.
    pub(crate) fn init_isolation(&mut self, level: Option<IsolationLevel>) {
        self.isolation = level;
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = StateFlags::empty();
    }

    pub fn state(&self) -> SessionState {
        SessionState {
            dirty: self.dirty,
            autocommit: self.autocommit(),
            database: self.database.clone(),
            isolation: self.isolation,
            read_only: self.read_only,
            network_timeout: self.network_timeout,
        }
    }
}
