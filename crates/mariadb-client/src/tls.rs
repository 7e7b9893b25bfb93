//! TLS upgrade of a connection.
//!
//! After the server greeting, a client that wants TLS sends a short SSL
//! request (capabilities with `CLIENT_SSL`, max packet size, collation,
//! 23 zero bytes), performs the TLS handshake on the same socket, and
//! continues with the full handshake response over the encrypted stream.
//!
//! The rustls implementation is behind the `tls` feature; without it any
//! attempt to upgrade fails with an SSL connection error.

#![allow(clippy::cast_possible_truncation)]

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

use mariadb_core::error::{ConnectionError, ConnectionErrorKind, Error, Result};

use crate::config::{SslMode, TlsConfig};
use crate::protocol::{PacketWriter, capabilities};

#[cfg(feature = "tls")]
use std::sync::Arc;

/// Build the SSL request payload sent before the TLS handshake.
pub fn build_ssl_request_packet(client_caps: u64, max_packet_size: u32, collation: u8) -> Vec<u8> {
    let caps = client_caps | capabilities::CLIENT_SSL;
    let mut writer = PacketWriter::with_capacity(32);
    writer.write_u32_le(caps as u32);
    writer.write_u32_le(max_packet_size);
    writer.write_u8(collation);
    writer.write_zeros(19);
    // MariaDB extended capabilities live in the last 4 reserved bytes
    writer.write_u32_le((caps >> 32) as u32);
    writer.into_bytes()
}

pub const fn server_supports_ssl(server_caps: u64) -> bool {
    server_caps & capabilities::CLIENT_SSL != 0
}

/// Decide whether to upgrade, given what the server offers.
///
/// Fails (non-transient) when TLS is required and the server lacks it;
/// this runs before any credential leaves the client.
pub fn validate_ssl_mode(ssl_mode: SslMode, server_caps: u64) -> Result<bool> {
    let server_supports = server_supports_ssl(server_caps);
    match ssl_mode {
        SslMode::Disable => Ok(false),
        SslMode::Preferred => Ok(server_supports),
        SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity => {
            if server_supports {
                Ok(true)
            } else {
                Err(tls_error("TLS required but the server does not support it"))
            }
        }
    }
}

/// Check that the TLS settings are usable with the requested mode.
pub fn validate_tls_config(ssl_mode: SslMode, tls_config: &TlsConfig) -> Result<()> {
    if tls_config.client_cert_path.is_some() != tls_config.client_key_path.is_some() {
        return Err(tls_error(
            "client certificate and client key must be configured together",
        ));
    }
    if matches!(ssl_mode, SslMode::VerifyCa | SslMode::VerifyIdentity)
        && tls_config.ca_cert_path.is_none()
        && !tls_config.danger_skip_verify
    {
        return Err(tls_error(
            "certificate verification needs a CA certificate (or skip_verify)",
        ));
    }
    Ok(())
}

fn tls_error(message: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Ssl,
        message: message.into(),
        source: None,
    })
}

/// Transport under the packet layer: plain TCP or TLS over TCP.
#[derive(Debug)]
pub enum NetStream {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream<TcpStream>>),
}

impl NetStream {
    pub fn tcp(&self) -> &TcpStream {
        match self {
            NetStream::Plain(s) => s,
            #[cfg(feature = "tls")]
            NetStream::Tls(s) => &s.stream,
        }
    }

    pub fn is_tls(&self) -> bool {
        !matches!(self, NetStream::Plain(_))
    }

    /// Upgrade a plain stream to TLS.
    pub fn upgrade(self, tls_config: &TlsConfig, host: &str, ssl_mode: SslMode) -> Result<Self> {
        match self {
            NetStream::Plain(tcp) => {
                let tls = TlsStream::connect(tcp, tls_config, host, ssl_mode)?;
                Ok(Self::from_tls(tls))
            }
            #[cfg(feature = "tls")]
            tls @ NetStream::Tls(_) => Ok(tls),
        }
    }

    #[cfg(feature = "tls")]
    fn from_tls(tls: TlsStream<TcpStream>) -> Self {
        NetStream::Tls(Box::new(tls))
    }

    #[cfg(not(feature = "tls"))]
    fn from_tls(tls: TlsStream<TcpStream>) -> Self {
        NetStream::Plain(tls.inner)
    }

    /// Handle that can shut the socket down from another thread.
    pub fn shutdown_handle(&self) -> io::Result<TcpStream> {
        self.tcp().try_clone()
    }

    pub fn shutdown(&self) {
        let _ = self.tcp().shutdown(Shutdown::Both);
    }
}

impl Read for NetStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            NetStream::Plain(s) => s.read(buf),
            #[cfg(feature = "tls")]
            NetStream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for NetStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            NetStream::Plain(s) => s.write(buf),
            #[cfg(feature = "tls")]
            NetStream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            NetStream::Plain(s) => s.flush(),
            #[cfg(feature = "tls")]
            NetStream::Tls(s) => s.flush(),
        }
    }
}

/// TLS over a blocking stream, using rustls.
#[cfg(feature = "tls")]
pub struct TlsStream<S: Read + Write> {
    conn: rustls::ClientConnection,
    stream: S,
}

#[cfg(feature = "tls")]
impl<S: Read + Write> std::fmt::Debug for TlsStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsStream")
            .field("protocol_version", &self.conn.protocol_version())
            .field("is_handshaking", &self.conn.is_handshaking())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> TlsStream<S> {
    /// Run the TLS handshake over `stream`.
    pub fn connect(
        mut stream: S,
        tls_config: &TlsConfig,
        host: &str,
        ssl_mode: SslMode,
    ) -> Result<Self> {
        let config = build_client_config(tls_config, ssl_mode)?;
        let sni = tls_config.server_name.as_deref().unwrap_or(host);
        let server_name = sni
            .to_string()
            .try_into()
            .map_err(|e| tls_error(format!("invalid server name '{}': {}", sni, e)))?;

        let mut conn = rustls::ClientConnection::new(Arc::new(config), server_name)
            .map_err(|e| tls_error(format!("cannot start TLS session: {}", e)))?;

        while conn.is_handshaking() {
            while conn.wants_write() {
                conn.write_tls(&mut stream)
                    .map_err(|e| tls_error(format!("TLS handshake write failed: {}", e)))?;
            }
            if conn.wants_read() {
                let n = conn
                    .read_tls(&mut stream)
                    .map_err(|e| tls_error(format!("TLS handshake read failed: {}", e)))?;
                if n == 0 {
                    return Err(tls_error("server closed the connection during TLS handshake"));
                }
                conn.process_new_packets()
                    .map_err(|e| tls_error(format!("TLS handshake failed: {}", e)))?;
            }
        }
        tracing::debug!(version = ?conn.protocol_version(), "TLS established");
        Ok(TlsStream { conn, stream })
    }

    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        self.conn.protocol_version()
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> Read for TlsStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) if n > 0 => return Ok(n),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            if !self.conn.wants_read() {
                return Ok(0);
            }
            if self.conn.read_tls(&mut self.stream)? == 0 {
                return Ok(0);
            }
            self.conn
                .process_new_packets()
                .map_err(|e| io::Error::other(format!("TLS error: {}", e)))?;
        }
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> Write for TlsStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.conn.writer().write(buf)?;
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.stream)?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.conn.writer().flush()?;
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.stream)?;
        }
        self.stream.flush()
    }
}

#[cfg(feature = "tls")]
fn build_client_config(tls_config: &TlsConfig, ssl_mode: SslMode) -> Result<rustls::ClientConfig> {
    use rustls::RootCertStore;

    if ssl_mode == SslMode::Disable {
        return Err(tls_error("TLS upgrade requested with ssl mode disabled"));
    }
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| tls_error(format!("cannot select TLS versions: {}", e)))?;

    if tls_config.danger_skip_verify {
        tracing::warn!("TLS certificate verification disabled");
        let builder = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerifier));
        return add_client_auth(builder, tls_config);
    }

    let mut roots = RootCertStore::empty();
    match &tls_config.ca_cert_path {
        Some(path) => {
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| tls_error(format!("invalid CA certificate: {}", e)))?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    add_client_auth(builder.with_root_certificates(roots), tls_config)
}

#[cfg(feature = "tls")]
fn load_certs(
    path: &std::path::Path,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| tls_error(format!("cannot open '{}': {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut io::BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("cannot parse '{}': {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(tls_error(format!("no certificate in '{}'", path.display())));
    }
    Ok(certs)
}

#[cfg(feature = "tls")]
fn add_client_auth(
    builder: rustls::ConfigBuilder<rustls::ClientConfig, rustls::client::WantsClientCert>,
    tls_config: &TlsConfig,
) -> Result<rustls::ClientConfig> {
    let (Some(cert_path), Some(key_path)) =
        (&tls_config.client_cert_path, &tls_config.client_key_path)
    else {
        return Ok(builder.with_no_client_auth());
    };
    let certs = load_certs(cert_path)?;
    let file = std::fs::File::open(key_path)
        .map_err(|e| tls_error(format!("cannot open '{}': {}", key_path.display(), e)))?;
    let key = rustls_pemfile::private_key(&mut io::BufReader::new(file))
        .map_err(|e| tls_error(format!("cannot parse client key: {}", e)))?
        .ok_or_else(|| tls_error(format!("no private key in '{}'", key_path.display())))?;
    builder
        .with_client_auth_cert(certs, key)
        .map_err(|e| tls_error(format!("invalid client certificate: {}", e)))
}

#[cfg(feature = "tls")]
mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error as RustlsError, SignatureScheme};

    /// Accepts any server certificate.
    #[derive(Debug)]
    pub(super) struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, RustlsError> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

/// Without the `tls` feature an upgrade always fails.
#[cfg(not(feature = "tls"))]
#[derive(Debug)]
pub struct TlsStream<S> {
    inner: S,
}

#[cfg(not(feature = "tls"))]
impl<S> TlsStream<S> {
    pub fn connect(
        stream: S,
        _tls_config: &TlsConfig,
        _host: &str,
        _ssl_mode: SslMode,
    ) -> Result<Self> {
        drop(stream);
        Err(tls_error(
            "TLS support requires the `tls` feature of mariadb-client",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PacketReader, charset};

    #[test]
    fn test_build_ssl_request_packet() {
        let caps = capabilities::REQUIRED | capabilities::MARIADB_CLIENT_EXTENDED_TYPE_INFO;
        let payload = build_ssl_request_packet(caps, 16 * 1024 * 1024, charset::UTF8MB4_GENERAL_CI);
        assert_eq!(payload.len(), 32);

        let mut reader = PacketReader::new(&payload);
        let low = u64::from(reader.read_u32_le().unwrap());
        assert_ne!(low & capabilities::CLIENT_SSL, 0);
        assert_eq!(reader.read_u32_le(), Some(16 * 1024 * 1024));
        assert_eq!(reader.read_u8(), Some(charset::UTF8MB4_GENERAL_CI));
        reader.skip(19);
        let high = u64::from(reader.read_u32_le().unwrap()) << 32;
        assert_eq!(high, capabilities::MARIADB_CLIENT_EXTENDED_TYPE_INFO);
    }

    #[test]
    fn test_validate_ssl_mode() {
        assert!(!validate_ssl_mode(SslMode::Disable, capabilities::CLIENT_SSL).unwrap());
        assert!(!validate_ssl_mode(SslMode::Preferred, 0).unwrap());
        assert!(validate_ssl_mode(SslMode::Preferred, capabilities::CLIENT_SSL).unwrap());
        assert!(validate_ssl_mode(SslMode::Required, capabilities::CLIENT_SSL).unwrap());

        for mode in [SslMode::Required, SslMode::VerifyCa, SslMode::VerifyIdentity] {
            let err = validate_ssl_mode(mode, capabilities::CLIENT_PROTOCOL_41).unwrap_err();
            assert!(!err.is_transient());
            match err {
                Error::Connection(e) => assert_eq!(e.kind, ConnectionErrorKind::Ssl),
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }

    #[test]
    fn test_validate_tls_config() {
        let config = TlsConfig::new();
        assert!(validate_tls_config(SslMode::Required, &config).is_ok());
        assert!(validate_tls_config(SslMode::VerifyCa, &config).is_err());
        assert!(validate_tls_config(SslMode::VerifyIdentity, &config).is_err());

        let config = TlsConfig::new().ca_cert("/etc/mysql/ca.pem");
        assert!(validate_tls_config(SslMode::VerifyCa, &config).is_ok());
        assert!(validate_tls_config(SslMode::VerifyCa, &TlsConfig::new().skip_verify(true)).is_ok());

        let half = TlsConfig::new()
            .ca_cert("/etc/mysql/ca.pem")
            .client_cert("/etc/mysql/client.pem");
        assert!(validate_tls_config(SslMode::VerifyCa, &half).is_err());
        let full = half.client_key("/etc/mysql/client-key.pem");
        assert!(validate_tls_config(SslMode::VerifyCa, &full).is_ok());
    }
}
