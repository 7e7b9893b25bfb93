//! Connection configuration.
//!
//! [`Configuration`] carries everything a connection (or the failover
//! layer) needs: hosts, credentials, TLS, timeouts, feature toggles and
//! decoding preferences. It is built with consuming setters or parsed
//! from a `mariadb://` URL.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::FixedOffset;
use mariadb_core::IsolationLevel;
use mariadb_core::error::{Error, Result};
use regex::Regex;

use crate::protocol::capabilities;

/// Default MariaDB port.
pub const DEFAULT_PORT: u16 = 3306;

/// One server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostAddress {
    pub host: String,
    pub port: u16,
    /// Writable primary (`true`) or read-only replica
    pub primary: bool,
}

impl HostAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            primary: true,
        }
    }

    pub fn replica(host: impl Into<String>, port: u16) -> Self {
        Self {
            primary: false,
            ..Self::new(host, port)
        }
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parses `host`, `host:port` and `[v6]:port`. The result is a primary.
impl FromStr for HostAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let end = rest
                .find(']')
                .ok_or_else(|| Error::config(format!("unterminated IPv6 address '{}'", s)))?;
            let port = rest[end + 1..].strip_prefix(':');
            (&rest[..end], port)
        } else {
            match s.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        };
        if host.is_empty() {
            return Err(Error::config(format!("missing host in '{}'", s)));
        }
        let port = match port {
            Some(p) => p
                .parse()
                .map_err(|_| Error::config(format!("invalid port in '{}'", s)))?,
            None => DEFAULT_PORT,
        };
        Ok(Self::new(host, port))
    }
}

/// High-availability mode over the configured host list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HaMode {
    /// Single host, no failover
    #[default]
    None,
    /// Primaries tried in declaration order
    Sequential,
    /// Random primary
    LoadBalance,
    /// One primary slot and one replica slot
    Replication,
}

impl HaMode {
    fn from_url_part(part: Option<&str>) -> Result<Self> {
        match part.map(str::to_ascii_lowercase).as_deref() {
            None => Ok(HaMode::None),
            Some("sequential") => Ok(HaMode::Sequential),
            Some("loadbalance" | "load-balance") => Ok(HaMode::LoadBalance),
            Some("replication") => Ok(HaMode::Replication),
            Some(other) => Err(Error::config(format!("unknown HA mode '{}'", other))),
        }
    }
}

/// TLS mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Do not use TLS
    #[default]
    Disable,
    /// TLS if the server offers it
    Preferred,
    /// Require TLS, no certificate verification beyond the trust store
    Required,
    /// Require TLS and verify the server certificate
    VerifyCa,
    /// Require TLS and verify the certificate matches the host name
    VerifyIdentity,
}

impl SslMode {
    pub const fn should_try_ssl(self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    pub const fn is_required(self) -> bool {
        matches!(
            self,
            SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity
        )
    }
}

impl FromStr for SslMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "disable" | "false" => Ok(SslMode::Disable),
            "preferred" | "trust" => Ok(SslMode::Preferred),
            "required" | "true" => Ok(SslMode::Required),
            "verify_ca" => Ok(SslMode::VerifyCa),
            "verify_identity" | "verify_full" => Ok(SslMode::VerifyIdentity),
            _ => Err(Error::config(format!("unknown ssl mode '{}'", s))),
        }
    }
}

/// Certificates and verification options for TLS.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// PEM file with the CA certificate(s) to trust
    pub ca_cert_path: Option<PathBuf>,
    /// Client certificate for mutual TLS
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    /// SNI / verification name, when it differs from the host
    pub server_name: Option<String>,
    /// Accept any server certificate
    pub danger_skip_verify: bool,
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn client_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_cert_path = Some(path.into());
        self
    }

    pub fn client_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_key_path = Some(path.into());
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Skip certificate verification. Only for testing.
    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.danger_skip_verify = skip;
        self
    }
}

/// User name and password.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Source of credentials, queried on every handshake.
pub trait CredentialProvider: Send + Sync + fmt::Debug {
    fn credentials(&self, host: &HostAddress) -> Result<Credentials>;
}

/// Credentials fixed at configuration time.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials(pub Credentials);

impl CredentialProvider for StaticCredentials {
    fn credentials(&self, _host: &HostAddress) -> Result<Credentials> {
        Ok(self.0.clone())
    }
}

/// Opens the TCP socket for a host.
pub trait SocketFactory: Send + Sync + fmt::Debug {
    fn connect(&self, host: &HostAddress, timeout: Duration) -> io::Result<TcpStream>;
}

/// Resolves the host and connects to the first address that accepts.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpSocketFactory;

impl SocketFactory for TcpSocketFactory {
    fn connect(&self, host: &HostAddress, timeout: Duration) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in (host.host.as_str(), host.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address found for {}", host),
            )
        }))
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Hosts in declaration order
    pub hosts: Vec<HostAddress>,
    pub ha_mode: HaMode,
    pub credentials: Arc<dyn CredentialProvider>,
    /// Initial default database
    pub database: Option<String>,
    pub ssl_mode: SslMode,
    pub tls: TlsConfig,
    pub connect_timeout: Duration,
    /// Read/write timeout of the socket (`None` blocks indefinitely)
    pub socket_timeout: Option<Duration>,
    /// Send pipelined commands without waiting for each response
    pub pipelining: bool,
    /// Bulk statement execution (requests CLIENT_MULTI_STATEMENTS)
    pub use_bulk_stmts: bool,
    /// Rewrite batches into multi-statements (requests CLIENT_MULTI_STATEMENTS)
    pub rewrite_batched_statements: bool,
    pub allow_multi_queries: bool,
    pub cache_prep_stmts: bool,
    pub prep_stmt_cache_size: usize,
    /// Replay the open transaction after an invisible reconnection
    pub transaction_replay: bool,
    pub transaction_replay_size: usize,
    /// Host selection rounds when every host is down
    pub retries_all_down: u32,
    /// How long a failed host stays on the deny-list
    pub deny_timeout: Duration,
    pub year_is_date_type: bool,
    pub geometry_default_type: bool,
    /// Session time zone; the server default when unset
    pub timezone: Option<FixedOffset>,
    pub autocommit: bool,
    pub isolation: Option<IsolationLevel>,
    /// Extra connection attributes sent with the handshake
    pub connection_attributes: BTreeMap<String, String>,
    pub log_packets: bool,
    pub max_packet_log_bytes: usize,
    pub socket_factory: Arc<dyn SocketFactory>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            hosts: vec![HostAddress::new("localhost", DEFAULT_PORT)],
            ha_mode: HaMode::None,
            credentials: Arc::new(StaticCredentials::default()),
            database: None,
            ssl_mode: SslMode::default(),
            tls: TlsConfig::default(),
            connect_timeout: Duration::from_secs(30),
            socket_timeout: None,
            pipelining: true,
            use_bulk_stmts: false,
            rewrite_batched_statements: false,
            allow_multi_queries: false,
            cache_prep_stmts: true,
            prep_stmt_cache_size: 250,
            transaction_replay: false,
            transaction_replay_size: 64,
            retries_all_down: 120,
            deny_timeout: Duration::from_secs(60),
            year_is_date_type: true,
            geometry_default_type: false,
            timezone: None,
            autocommit: true,
            isolation: None,
            connection_attributes: BTreeMap::new(),
            log_packets: false,
            max_packet_log_bytes: 1024,
            socket_factory: Arc::new(TcpSocketFactory),
        }
    }
}

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?i:mariadb|mysql)(?::(?P<mode>[A-Za-z-]+))?://(?:(?P<user>[^:@/]*)(?::(?P<password>[^@/]*))?@)?(?P<hosts>[^/?]*)(?:/(?P<db>[^?]*))?(?:\?(?P<query>.*))?$",
        )
        .unwrap_or_else(|_| unreachable!("static pattern"))
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!("invalid boolean for '{}': '{}'", key, value))),
    }
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::config(format!("invalid number for '{}': '{}'", key, value)))
}

fn parse_offset(value: &str) -> Result<FixedOffset> {
    if value.eq_ignore_ascii_case("utc") || value == "Z" {
        return FixedOffset::east_opt(0).ok_or_else(|| Error::config("invalid timezone"));
    }
    let (sign, rest) = match value.as_bytes().first() {
        Some(b'+') => (1, &value[1..]),
        Some(b'-') => (-1, &value[1..]),
        _ => return Err(Error::config(format!("invalid timezone '{}'", value))),
    };
    let (h, m) = rest.split_once(':').unwrap_or((rest, "0"));
    let seconds = parse_num::<i32>("timezone", h)? * 3600 + parse_num::<i32>("timezone", m)? * 60;
    FixedOffset::east_opt(sign * seconds)
        .ok_or_else(|| Error::config(format!("invalid timezone '{}'", value)))
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `mariadb[:mode]://[user[:password]@]host[:port][,host...][/db][?key=value&...]`.
    ///
    /// In replication mode the first host is the primary and the others
    /// are replicas.
    pub fn from_url(url: &str) -> Result<Self> {
        let caps = url_regex()
            .captures(url.trim())
            .ok_or_else(|| Error::config(format!("invalid connection url '{}'", url)))?;

        let mut config = Configuration::new();
        config.ha_mode = HaMode::from_url_part(caps.name("mode").map(|m| m.as_str()))?;

        let hosts = caps.name("hosts").map_or("", |m| m.as_str());
        config.hosts = hosts
            .split(',')
            .filter(|h| !h.trim().is_empty())
            .map(HostAddress::from_str)
            .collect::<Result<Vec<_>>>()?;
        if config.ha_mode == HaMode::Replication {
            for host in config.hosts.iter_mut().skip(1) {
                host.primary = false;
            }
        }

        if let Some(user) = caps.name("user") {
            config = config.user_password(
                user.as_str(),
                caps.name("password").map(|p| p.as_str().to_string()),
            );
        }
        if let Some(db) = caps.name("db").filter(|d| !d.as_str().is_empty()) {
            config.database = Some(db.as_str().to_string());
        }

        if let Some(query) = caps.name("query") {
            for pair in query.as_str().split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, "true"));
                config.apply_option(key, value)?;
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn apply_option(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "sslMode" | "ssl_mode" => self.ssl_mode = value.parse()?,
            "serverSslCert" | "ssl_ca" => self.tls.ca_cert_path = Some(value.into()),
            "connectTimeout" => {
                self.connect_timeout = Duration::from_millis(parse_num(key, value)?);
            }
            "socketTimeout" => {
                let ms: u64 = parse_num(key, value)?;
                self.socket_timeout = (ms > 0).then(|| Duration::from_millis(ms));
            }
            "pipelining" => self.pipelining = parse_bool(key, value)?,
            "useBulkStmts" => self.use_bulk_stmts = parse_bool(key, value)?,
            "rewriteBatchedStatements" => {
                self.rewrite_batched_statements = parse_bool(key, value)?;
            }
            "allowMultiQueries" => self.allow_multi_queries = parse_bool(key, value)?,
            "cachePrepStmts" => self.cache_prep_stmts = parse_bool(key, value)?,
            "prepStmtCacheSize" => self.prep_stmt_cache_size = parse_num(key, value)?,
            "transactionReplay" => self.transaction_replay = parse_bool(key, value)?,
            "transactionReplaySize" => self.transaction_replay_size = parse_num(key, value)?,
            "retriesAllDown" => self.retries_all_down = parse_num(key, value)?,
            "denyTimeout" => self.deny_timeout = Duration::from_millis(parse_num(key, value)?),
            "yearIsDateType" => self.year_is_date_type = parse_bool(key, value)?,
            "geometryDefaultType" => {
                self.geometry_default_type = value.eq_ignore_ascii_case("default");
            }
            "timezone" => self.timezone = Some(parse_offset(value)?),
            "autocommit" => self.autocommit = parse_bool(key, value)?,
            "transactionIsolation" => {
                self.isolation = Some(value.parse().map_err(Error::config)?);
            }
            "logPackets" => self.log_packets = parse_bool(key, value)?,
            "maxQuerySizeToLog" => self.max_packet_log_bytes = parse_num(key, value)?,
            "connectionAttributes" => {
                for attr in value.split(',') {
                    if let Some((k, v)) = attr.split_once(':') {
                        self.connection_attributes.insert(k.to_string(), v.to_string());
                    }
                }
            }
            other => tracing::warn!(option = other, "ignoring unknown connection option"),
        }
        Ok(())
    }

    /// Check the combination of settings.
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(Error::config("at least one host is required"));
        }
        if self.ha_mode == HaMode::None && self.hosts.len() > 1 {
            return Err(Error::config(
                "several hosts need an HA mode (sequential, loadbalance or replication)",
            ));
        }
        if self.ha_mode == HaMode::Replication && !self.hosts.iter().any(|h| h.primary) {
            return Err(Error::config("replication mode needs a primary host"));
        }
        if self.transaction_replay && self.transaction_replay_size == 0 {
            return Err(Error::config("transaction_replay_size must be positive"));
        }
        Ok(())
    }

    /// Replace the host list with a single primary.
    pub fn host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.hosts = vec![HostAddress::new(host, port)];
        self
    }

    pub fn hosts(mut self, hosts: Vec<HostAddress>) -> Self {
        self.hosts = hosts;
        self
    }

    pub fn ha_mode(mut self, mode: HaMode) -> Self {
        self.ha_mode = mode;
        self
    }

    pub fn user_password(mut self, user: impl Into<String>, password: Option<String>) -> Self {
        self.credentials = Arc::new(StaticCredentials(Credentials {
            user: user.into(),
            password,
        }));
        self
    }

    pub fn credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = provider;
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    pub fn tls_config(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn socket_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn pipelining(mut self, enabled: bool) -> Self {
        self.pipelining = enabled;
        self
    }

    pub fn use_bulk_stmts(mut self, enabled: bool) -> Self {
        self.use_bulk_stmts = enabled;
        self
    }

    pub fn rewrite_batched_statements(mut self, enabled: bool) -> Self {
        self.rewrite_batched_statements = enabled;
        self
    }

    pub fn allow_multi_queries(mut self, enabled: bool) -> Self {
        self.allow_multi_queries = enabled;
        self
    }

    pub fn cache_prep_stmts(mut self, enabled: bool) -> Self {
        self.cache_prep_stmts = enabled;
        self
    }

    pub fn prep_stmt_cache_size(mut self, size: usize) -> Self {
        self.prep_stmt_cache_size = size;
        self
    }

    pub fn transaction_replay(mut self, enabled: bool) -> Self {
        self.transaction_replay = enabled;
        self
    }

    pub fn transaction_replay_size(mut self, size: usize) -> Self {
        self.transaction_replay_size = size;
        self
    }

    pub fn retries_all_down(mut self, retries: u32) -> Self {
        self.retries_all_down = retries;
        self
    }

    pub fn deny_timeout(mut self, timeout: Duration) -> Self {
        self.deny_timeout = timeout;
        self
    }

    pub fn year_is_date_type(mut self, enabled: bool) -> Self {
        self.year_is_date_type = enabled;
        self
    }

    pub fn geometry_default_type(mut self, enabled: bool) -> Self {
        self.geometry_default_type = enabled;
        self
    }

    pub fn timezone(mut self, offset: FixedOffset) -> Self {
        self.timezone = Some(offset);
        self
    }

    pub fn autocommit(mut self, enabled: bool) -> Self {
        self.autocommit = enabled;
        self
    }

    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.connection_attributes.insert(key.into(), value.into());
        self
    }

    pub fn log_packets(mut self, enabled: bool, max_bytes: usize) -> Self {
        self.log_packets = enabled;
        self.max_packet_log_bytes = max_bytes;
        self
    }

    pub fn socket_factory(mut self, factory: Arc<dyn SocketFactory>) -> Self {
        self.socket_factory = factory;
        self
    }

    /// Whether statements may contain several queries.
    pub fn multi_statements(&self) -> bool {
        self.use_bulk_stmts || self.rewrite_batched_statements || self.allow_multi_queries
    }

    /// Capabilities requested before intersecting with the server's.
    pub fn capability_flags(&self) -> u64 {
        let mut flags = capabilities::REQUIRED | capabilities::OPTIONAL;
        if self.multi_statements() {
            flags |= capabilities::CLIENT_MULTI_STATEMENTS;
        }
        if self.database.is_some() {
            flags |= capabilities::CLIENT_CONNECT_WITH_DB;
        }
        if self.ssl_mode.should_try_ssl() {
            flags |= capabilities::CLIENT_SSL;
        }
        flags
    }

    pub fn primaries(&self) -> impl Iterator<Item = &HostAddress> {
        self.hosts.iter().filter(|h| h.primary)
    }

    pub fn replicas(&self) -> impl Iterator<Item = &HostAddress> {
        self.hosts.iter().filter(|h| !h.primary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = Configuration::new()
            .host("db.example.com", 3307)
            .user_password("app", Some("secret".to_string()))
            .database("shop")
            .connect_timeout(Duration::from_secs(10))
            .ssl_mode(SslMode::Required)
            .attribute("program_name", "billing");

        assert_eq!(config.hosts, vec![HostAddress::new("db.example.com", 3307)]);
        assert_eq!(config.database.as_deref(), Some("shop"));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.ssl_mode, SslMode::Required);
        assert_eq!(
            config.connection_attributes.get("program_name").map(String::as_str),
            Some("billing")
        );
        let creds = config.credentials.credentials(&config.hosts[0]).unwrap();
        assert_eq!(creds.user, "app");
        assert_eq!(creds.password.as_deref(), Some("secret"));
        assert!(!format!("{:?}", creds).contains("secret"));
    }

    #[test]
    fn test_default_config() {
        let config = Configuration::default();
        assert_eq!(config.hosts[0].to_string(), "localhost:3306");
        assert_eq!(config.ha_mode, HaMode::None);
        assert!(config.pipelining);
        assert_eq!(config.prep_stmt_cache_size, 250);
        assert_eq!(config.transaction_replay_size, 64);
        assert_eq!(config.retries_all_down, 120);
        assert_eq!(config.deny_timeout, Duration::from_secs(60));
        assert!(config.year_is_date_type);
        assert!(!config.geometry_default_type);
        assert_eq!(config.max_packet_log_bytes, 1024);
    }

    #[test]
    fn test_ssl_mode_properties() {
        assert!(!SslMode::Disable.should_try_ssl());
        assert!(!SslMode::Disable.is_required());
        assert!(SslMode::Preferred.should_try_ssl());
        assert!(!SslMode::Preferred.is_required());
        assert!(SslMode::Required.is_required());
        assert!(SslMode::VerifyCa.is_required());
        assert!(SslMode::VerifyIdentity.is_required());
        assert_eq!("verify-ca".parse::<SslMode>().unwrap(), SslMode::VerifyCa);
    }

    #[test]
    fn test_multi_statements_capability() {
        use crate::protocol::capabilities::*;

        let plain = Configuration::new().capability_flags();
        assert_eq!(plain & CLIENT_MULTI_STATEMENTS, 0);
        assert_ne!(plain & CLIENT_PROTOCOL_41, 0);
        assert_ne!(plain & CLIENT_MULTI_RESULTS, 0);

        let bulk = Configuration::new().use_bulk_stmts(true).capability_flags();
        assert_ne!(bulk & CLIENT_MULTI_STATEMENTS, 0);
        let rewrite = Configuration::new()
            .rewrite_batched_statements(true)
            .capability_flags();
        assert_ne!(rewrite & CLIENT_MULTI_STATEMENTS, 0);
    }

    #[test]
    fn test_host_address_parsing() {
        let h: HostAddress = "db1:3307".parse().unwrap();
        assert_eq!(h, HostAddress::new("db1", 3307));
        let h: HostAddress = "db2".parse().unwrap();
        assert_eq!(h.port, DEFAULT_PORT);
        let h: HostAddress = "[::1]:3310".parse().unwrap();
        assert_eq!(h.host, "::1");
        assert_eq!(h.to_string(), "[::1]:3310");
        assert!("db:port".parse::<HostAddress>().is_err());
    }

    #[test]
    fn test_from_url_replication() {
        let config = Configuration::from_url(
            "mariadb:replication://app:pw@primary:3306,replica1,replica2:3307/shop?transactionReplay=true&denyTimeout=500",
        )
        .unwrap();
        assert_eq!(config.ha_mode, HaMode::Replication);
        assert_eq!(config.hosts.len(), 3);
        assert!(config.hosts[0].primary);
        assert!(!config.hosts[1].primary);
        assert_eq!(config.hosts[2].port, 3307);
        assert_eq!(config.primaries().count(), 1);
        assert_eq!(config.replicas().count(), 2);
        assert_eq!(config.database.as_deref(), Some("shop"));
        assert!(config.transaction_replay);
        assert_eq!(config.deny_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_from_url_options() {
        let config = Configuration::from_url(
            "mariadb://localhost/?timezone=-05:30&transactionIsolation=READ-COMMITTED&sslMode=preferred",
        )
        .unwrap();
        assert_eq!(config.ha_mode, HaMode::None);
        assert_eq!(config.database, None);
        assert_eq!(config.timezone.unwrap().local_minus_utc(), -(5 * 3600 + 30 * 60));
        assert_eq!(config.isolation, Some(IsolationLevel::ReadCommitted));
        assert_eq!(config.ssl_mode, SslMode::Preferred);
    }

    #[test]
    fn test_invalid_urls() {
        assert!(Configuration::from_url("postgres://localhost").is_err());
        assert!(Configuration::from_url("mariadb:mirror://h1,h2").is_err());
        assert!(Configuration::from_url("mariadb://h1,h2").is_err());
        assert!(Configuration::from_url("mariadb://h1?pipelining=maybe").is_err());
    }
}
