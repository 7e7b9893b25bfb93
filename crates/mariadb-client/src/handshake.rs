//! Connection handshake.
//!
//! ```text
//! AwaitingGreeting -> NegotiatingTls (optional) -> AwaitingChallenge
//!     -> Authenticating(plugin) <-> SwitchingPlugin -> Authenticated | Failed
//! ```
//!
//! The handshake runs once per socket. A failure anywhere leaves the
//! socket unusable; callers reconnect from scratch.

#![allow(clippy::cast_possible_truncation)]

use std::sync::OnceLock;

use mariadb_core::error::{ConnectionErrorKind, Error, Result, ServerError};
use regex::Regex;

use crate::auth::{self, AuthContext, AuthPlugin, AuthStep};
use crate::column::DecodeContext;
use crate::config::{Configuration, HostAddress};
use crate::context::SessionContext;
use crate::protocol::framing::DEFAULT_MAX_ALLOWED_PACKET;
use crate::protocol::{PacketIo, PacketReader, PacketWriter, capabilities, charset};
use crate::tls::{self, NetStream};

/// Server version from the greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerVersion {
    pub raw: String,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub mariadb: bool,
}

impl ServerVersion {
    /// Parse a version string such as `8.0.36` or `5.5.5-10.6.12-MariaDB-log`.
    ///
    /// MariaDB 10+ prefixes its real version with `5.5.5-` for the sake of
    /// old replication clients.
    pub fn parse(raw: &str) -> Self {
        static RE: OnceLock<Option<Regex>> = OnceLock::new();
        let re = RE.get_or_init(|| Regex::new(r"^(?:5\.5\.5-)?(\d+)\.(\d+)\.(\d+)").ok());
        let mariadb = raw.to_ascii_lowercase().contains("mariadb");
        let caps = re.as_ref().and_then(|re| re.captures(raw));
        let part = |i: usize| {
            caps.as_ref()
                .and_then(|c| c.get(i))
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0)
        };
        Self {
            raw: raw.to_string(),
            major: part(1),
            minor: part(2),
            patch: part(3),
            mariadb,
        }
    }

    /// Version is at least `major.minor.patch`.
    pub fn at_least(&self, major: u32, minor: u32, patch: u32) -> bool {
        (self.major, self.minor, self.patch) >= (major, minor, patch)
    }
}

/// Initial handshake packet (protocol 10).
#[derive(Debug, Clone)]
pub struct Greeting {
    pub server_version: ServerVersion,
    pub thread_id: u32,
    /// Scramble, without the trailing NUL
    pub seed: Vec<u8>,
    /// Classic flags in bits 0..31, MariaDB extended flags in 32..63
    pub capabilities: u64,
    pub collation: u8,
    pub status: u16,
    pub auth_plugin: String,
}

fn greeting_error(message: &str, data: &[u8]) -> Error {
    Error::Protocol(mariadb_core::ProtocolError {
        message: format!("malformed handshake packet: {}", message),
        raw_data: Some(data.to_vec()),
    })
}

fn server_error(data: &[u8]) -> Error {
    match PacketReader::new(data).parse_err_packet() {
        Some(err) => Error::Server(ServerError {
            code: err.error_code,
            sqlstate: err.sql_state,
            message: err.error_message,
            sql: None,
        }),
        None => Error::protocol("malformed error packet"),
    }
}

impl Greeting {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.first() == Some(&0xFF) {
            // e.g. "Too many connections" or host blocked
            return Err(server_error(data));
        }
        let mut reader = PacketReader::new(data);
        let protocol = reader
            .read_u8()
            .ok_or_else(|| greeting_error("empty", data))?;
        if protocol != 10 {
            return Err(greeting_error(
                &format!("unsupported protocol version {}", protocol),
                data,
            ));
        }
        let version = reader
            .read_null_string()
            .ok_or_else(|| greeting_error("missing server version", data))?;
        let thread_id = reader
            .read_u32_le()
            .ok_or_else(|| greeting_error("missing thread id", data))?;
        let mut seed = reader
            .read_bytes(8)
            .ok_or_else(|| greeting_error("missing scramble", data))?
            .to_vec();
        reader.skip(1);
        let caps_low = reader
            .read_u16_le()
            .ok_or_else(|| greeting_error("missing capabilities", data))?;
        let collation = reader.read_u8().unwrap_or(charset::UTF8MB4_GENERAL_CI);
        let status = reader.read_u16_le().unwrap_or(0);
        let caps_high = reader.read_u16_le().unwrap_or(0);
        let mut caps = u64::from(caps_low) | (u64::from(caps_high) << 16);

        let seed_len = usize::from(reader.read_u8().unwrap_or(0));
        reader.skip(6);
        let mariadb_caps = reader.read_u32_le().unwrap_or(0);
        if caps & capabilities::CLIENT_MYSQL == 0 {
            caps |= u64::from(mariadb_caps) << 32;
        }

        if caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            let len = seed_len.saturating_sub(8).max(13);
            let part = match reader.read_bytes(len) {
                Some(part) => part,
                None => reader.read_rest(),
            };
            let part = part.strip_suffix(&[0]).unwrap_or(part);
            seed.extend_from_slice(part);
        }
        let auth_plugin = if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            reader.read_null_string().unwrap_or_default()
        } else {
            String::new()
        };

        let mut server_version = ServerVersion::parse(&version);
        server_version.mariadb |= caps & capabilities::CLIENT_MYSQL == 0;
        Ok(Self {
            server_version,
            thread_id,
            seed,
            capabilities: caps,
            collation,
            status,
            auth_plugin,
        })
    }
}

/// Capabilities the client asks for, given what the server offers.
pub fn select_capabilities(config: &Configuration, server_caps: u64) -> Result<u64> {
    let missing = capabilities::REQUIRED & !server_caps;
    if missing != 0 {
        return Err(Error::connection(
            ConnectionErrorKind::Connect,
            format!("server lacks required capabilities {:#x}", missing),
        ));
    }
    let mut caps = config.capability_flags() & server_caps;
    // MariaDB servers read extended flags only when CLIENT_MYSQL is clear
    caps &= !capabilities::CLIENT_MYSQL;
    Ok(caps)
}

/// Prefer a 4-byte UTF-8 collation unless the server predates it.
pub fn select_collation(version: &ServerVersion, server_collation: u8) -> u8 {
    if version.major == 5 && version.minor <= 1 {
        charset::UTF8_GENERAL_CI
    } else if charset::is_utf8mb4(server_collation) {
        server_collation
    } else {
        charset::UTF8MB4_UNICODE_CI
    }
}

/// Handshake progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingGreeting,
    NegotiatingTls,
    AwaitingChallenge,
    Authenticating(String),
    SwitchingPlugin,
    Authenticated,
    Failed,
}

/// An authenticated socket with its session.
#[derive(Debug)]
pub struct Established {
    pub io: PacketIo<NetStream>,
    pub session: SessionContext,
}

/// Drives one handshake over a freshly opened socket.
#[derive(Debug)]
pub struct Handshake<'a> {
    config: &'a Configuration,
    host: &'a HostAddress,
    state: HandshakeState,
}

impl<'a> Handshake<'a> {
    pub fn new(config: &'a Configuration, host: &'a HostAddress) -> Self {
        Self {
            config,
            host,
            state: HandshakeState::AwaitingGreeting,
        }
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    fn transition(&mut self, next: HandshakeState) {
        tracing::trace!(host = %self.host, from = ?self.state, to = ?next, "handshake");
        self.state = next;
    }

    /// Run the handshake; on error the state is [`HandshakeState::Failed`].
    pub fn run(&mut self, io: PacketIo<NetStream>) -> Result<Established> {
        let result = self.run_inner(io);
        if result.is_err() {
            self.transition(HandshakeState::Failed);
        }
        result
    }

    fn run_inner(&mut self, mut io: PacketIo<NetStream>) -> Result<Established> {
        let greeting = Greeting::parse(&io.read_packet()?)?;
        tracing::debug!(
            host = %self.host,
            thread_id = greeting.thread_id,
            version = %greeting.server_version.raw,
            plugin = %greeting.auth_plugin,
            "server greeting"
        );

        let caps = select_capabilities(self.config, greeting.capabilities)?;
        let collation = select_collation(&greeting.server_version, greeting.collation);
        let max_packet = DEFAULT_MAX_ALLOWED_PACKET as u32;

        let use_tls = tls::validate_ssl_mode(self.config.ssl_mode, greeting.capabilities)?;
        let caps = if use_tls {
            self.transition(HandshakeState::NegotiatingTls);
            tls::validate_tls_config(self.config.ssl_mode, &self.config.tls)?;
            io.write_packet(&tls::build_ssl_request_packet(caps, max_packet, collation))?;
            io.flush()?;
            let (config, host) = (self.config, self.host);
            io = io.map_stream(|s| s.upgrade(&config.tls, &host.host, config.ssl_mode))?;
            caps | capabilities::CLIENT_SSL
        } else {
            caps & !capabilities::CLIENT_SSL
        };

        self.transition(HandshakeState::AwaitingChallenge);
        let credentials = self.config.credentials.credentials(self.host)?;
        let password = credentials.password.unwrap_or_default();
        let mut seed = greeting.seed.clone();
        let mut plugin = auth::plugin_for(&greeting.auth_plugin)?;
        let secure = io.get_ref().is_tls();

        let initial = plugin.initial_response(&AuthContext {
            password: &password,
            seed: &seed,
            secure,
        })?;
        let response = self.handshake_response(
            caps,
            max_packet,
            collation,
            &credentials.user,
            &initial,
            plugin.as_ref(),
            greeting.capabilities,
        );
        io.write_packet(&response)?;
        io.flush()?;
        self.transition(HandshakeState::Authenticating(plugin.name().to_string()));

        let status = loop {
            let packet = io.read_packet()?;
            match packet.first().copied() {
                Some(0x00) => {
                    let ok = PacketReader::new(&packet)
                        .parse_ok_packet(caps & capabilities::CLIENT_SESSION_TRACK != 0)
                        .ok_or_else(|| Error::protocol("malformed OK packet after authentication"))?;
                    break ok.status_flags;
                }
                Some(0xFF) => return Err(server_error(&packet)),
                Some(0xFE) => {
                    self.transition(HandshakeState::SwitchingPlugin);
                    let mut reader = PacketReader::new(&packet[1..]);
                    let name = reader.read_null_string().unwrap_or_default();
                    let data = reader.read_rest();
                    seed = data.strip_suffix(&[0]).unwrap_or(data).to_vec();
                    plugin = auth::plugin_for(&name)?;
                    tracing::debug!(plugin = %name, "authentication plugin switch");
                    let response = plugin.initial_response(&AuthContext {
                        password: &password,
                        seed: &seed,
                        secure,
                    })?;
                    io.write_packet(&response)?;
                    io.flush()?;
                    self.transition(HandshakeState::Authenticating(name));
                }
                Some(0x01) => {
                    let ctx = AuthContext {
                        password: &password,
                        seed: &seed,
                        secure,
                    };
                    if let AuthStep::Send(data) = plugin.more_data(&ctx, &packet[1..])? {
                        io.write_packet(&data)?;
                        io.flush()?;
                    }
                }
                other => {
                    return Err(Error::protocol(format!(
                        "unexpected authentication packet {:?}",
                        other
                    )));
                }
            }
        };
        self.transition(HandshakeState::Authenticated);

        let decode = DecodeContext {
            year_is_date: self.config.year_is_date_type,
            geometry_default_type: self.config.geometry_default_type,
            timezone: self.config.timezone.unwrap_or(DecodeContext::text().timezone),
            ..DecodeContext::text()
        };
        let database = if caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
            self.config.database.clone()
        } else {
            None
        };
        let session = SessionContext::new(
            greeting.capabilities,
            caps,
            status,
            greeting.thread_id,
            greeting.server_version,
            collation,
            database,
            decode,
        );
        Ok(Established { io, session })
    }

    #[allow(clippy::too_many_arguments)]
    fn handshake_response(
        &self,
        caps: u64,
        max_packet: u32,
        collation: u8,
        user: &str,
        auth_response: &[u8],
        plugin: &dyn AuthPlugin,
        server_caps: u64,
    ) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(128);
        w.write_u32_le(caps as u32);
        w.write_u32_le(max_packet);
        w.write_u8(collation);
        w.write_zeros(19);
        if server_caps & capabilities::CLIENT_MYSQL == 0 {
            w.write_u32_le((caps >> 32) as u32);
        } else {
            w.write_zeros(4);
        }
        w.write_null_string(user);

        if caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            w.write_lenenc_bytes(auth_response);
        } else {
            // scrambles are at most 32 bytes
            w.write_u8(auth_response.len() as u8);
            w.write_bytes(auth_response);
        }
        if caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
            w.write_null_string(self.config.database.as_deref().unwrap_or(""));
        }
        if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            w.write_null_string(plugin.name());
        }
        if caps & capabilities::CLIENT_CONNECT_ATTRS != 0 {
            let mut attrs = PacketWriter::new();
            for (key, value) in self.connection_attributes() {
                attrs.write_lenenc_string(&key);
                attrs.write_lenenc_string(&value);
            }
            w.write_lenenc_bytes(attrs.as_bytes());
        }
        w.into_bytes()
    }

    fn connection_attributes(&self) -> Vec<(String, String)> {
        let mut attrs = vec![
            ("_client_name".to_string(), env!("CARGO_PKG_NAME").to_string()),
            ("_client_version".to_string(), env!("CARGO_PKG_VERSION").to_string()),
            ("_os".to_string(), std::env::consts::OS.to_string()),
            ("_pid".to_string(), std::process::id().to_string()),
            ("_server_host".to_string(), self.host.host.clone()),
        ];
        attrs.extend(
            self.config
                .connection_attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        attrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::server_status;

    /// Greeting as sent by a MariaDB 10.6 server.
    fn mariadb_greeting(plugin: &str) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_u8(10);
        w.write_null_string("5.5.5-10.6.12-MariaDB-log");
        w.write_u32_le(42);
        w.write_bytes(b"abcdefgh");
        w.write_u8(0);
        let caps = (capabilities::REQUIRED
            | capabilities::CLIENT_PLUGIN_AUTH
            | capabilities::CLIENT_CONNECT_WITH_DB
            | capabilities::CLIENT_SSL) as u32;
        w.write_u16_le(caps as u16);
        w.write_u8(charset::UTF8MB4_GENERAL_CI);
        w.write_u16_le(server_status::SERVER_STATUS_AUTOCOMMIT);
        w.write_u16_le((caps >> 16) as u16);
        w.write_u8(21);
        w.write_zeros(6);
        w.write_u32_le((capabilities::MARIADB_CLIENT_EXTENDED_TYPE_INFO >> 32) as u32);
        w.write_bytes(b"ijklmnopqrst");
        w.write_u8(0);
        w.write_null_string(plugin);
        w.into_bytes()
    }

    #[test]
    fn test_parse_mariadb_greeting() {
        let greeting = Greeting::parse(&mariadb_greeting("mysql_native_password")).unwrap();
        assert_eq!(greeting.thread_id, 42);
        assert_eq!(greeting.seed, b"abcdefghijklmnopqrst");
        assert_eq!(greeting.auth_plugin, "mysql_native_password");
        assert!(greeting.server_version.mariadb);
        assert_eq!(
            (greeting.server_version.major, greeting.server_version.minor),
            (10, 6)
        );
        assert_ne!(
            greeting.capabilities & capabilities::MARIADB_CLIENT_EXTENDED_TYPE_INFO,
            0
        );
        assert_eq!(greeting.status, server_status::SERVER_STATUS_AUTOCOMMIT);
    }

    #[test]
    fn test_greeting_error_packet() {
        let mut w = PacketWriter::new();
        w.write_u8(0xFF);
        w.write_u16_le(1040);
        w.write_bytes(b"#08004Too many connections");
        let err = Greeting::parse(&w.into_bytes()).unwrap_err();
        assert_eq!(err.code(), Some(1040));
        assert_eq!(err.sqlstate(), "08004");
    }

    #[test]
    fn test_server_version_parsing() {
        let v = ServerVersion::parse("8.0.36");
        assert_eq!((v.major, v.minor, v.patch), (8, 0, 36));
        assert!(!v.mariadb);
        assert!(v.at_least(8, 0, 5));
        assert!(!v.at_least(8, 1, 0));

        let v = ServerVersion::parse("5.5.5-10.11.2-MariaDB");
        assert_eq!((v.major, v.minor, v.patch), (10, 11, 2));
        assert!(v.mariadb);
        assert_eq!(ServerVersion::parse("garbage").major, 0);
    }

    #[test]
    fn test_collation_selection() {
        let legacy = ServerVersion::parse("5.1.73");
        assert_eq!(select_collation(&legacy, charset::LATIN1_SWEDISH_CI), charset::UTF8_GENERAL_CI);
        let modern = ServerVersion::parse("10.6.12-MariaDB");
        assert_eq!(
            select_collation(&modern, charset::LATIN1_SWEDISH_CI),
            charset::UTF8MB4_UNICODE_CI
        );
        assert_eq!(
            select_collation(&modern, charset::UTF8MB4_GENERAL_CI),
            charset::UTF8MB4_GENERAL_CI
        );
    }

    #[test]
    fn test_capability_selection() {
        let config = Configuration::new();
        let server = capabilities::REQUIRED
            | capabilities::CLIENT_MULTI_STATEMENTS
            | capabilities::CLIENT_COMPRESS
            | capabilities::CLIENT_SESSION_TRACK;
        let caps = select_capabilities(&config, server).unwrap();
        assert_eq!(caps & capabilities::REQUIRED, capabilities::REQUIRED);
        assert_eq!(caps & capabilities::CLIENT_MULTI_STATEMENTS, 0);
        assert_eq!(caps & capabilities::CLIENT_COMPRESS, 0);
        assert_ne!(caps & capabilities::CLIENT_SESSION_TRACK, 0);

        let caps = select_capabilities(&config.allow_multi_queries(true), server).unwrap();
        assert_ne!(caps & capabilities::CLIENT_MULTI_STATEMENTS, 0);

        let err = select_capabilities(&Configuration::new(), capabilities::CLIENT_PROTOCOL_41)
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
