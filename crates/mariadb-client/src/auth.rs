//! Authentication plugins.
//!
//! The server names a plugin in its greeting (or in an auth-switch
//! request) and sends a seed. The client answers with the plugin's
//! response to that seed; some plugins continue with "more data"
//! exchanges (`0x01` packets) before the final OK or error.
//!
//! # mysql_native_password
//!
//! ```text
//! SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))
//! ```
//!
//! # caching_sha2_password
//!
//! Fast path, when the server has the password hash cached:
//! ```text
//! SHA256(password) XOR SHA256(SHA256(SHA256(password)) + seed)
//! ```
//! Full authentication sends the password in clear over TLS, or RSA
//! encrypted with the server's public key otherwise.

use std::fmt;

use mariadb_core::error::{ConnectionErrorKind, Error, Result};
use rand::rngs::OsRng;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Plugin names.
pub mod plugins {
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    pub const SHA256_PASSWORD: &str = "sha256_password";
    /// Sends the password in clear; refused unless the channel is TLS
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
}

/// First byte of caching_sha2_password "more data" packets.
pub mod caching_sha2 {
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// sha256_password request for the server public key.
const SHA256_REQUEST_PUBLIC_KEY: u8 = 0x01;

/// What a plugin sees of the connection.
#[derive(Clone, Copy)]
pub struct AuthContext<'a> {
    pub password: &'a str,
    /// Scramble from the greeting or the auth-switch request
    pub seed: &'a [u8],
    /// The channel is TLS
    pub secure: bool,
}

impl fmt::Debug for AuthContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("seed_len", &self.seed.len())
            .field("secure", &self.secure)
            .finish_non_exhaustive()
    }
}

/// Reaction to a "more data" packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// Send this payload and keep reading
    Send(Vec<u8>),
    /// Nothing to send; the server follows with OK or error
    Wait,
}

/// One challenge-response authentication method.
pub trait AuthPlugin: Send + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Response to the server seed.
    fn initial_response(&mut self, ctx: &AuthContext<'_>) -> Result<Vec<u8>>;

    /// Handle an auth-more-data payload (without its `0x01` marker).
    fn more_data(&mut self, ctx: &AuthContext<'_>, data: &[u8]) -> Result<AuthStep> {
        let _ = ctx;
        Err(auth_error(format!(
            "unexpected additional data for {} (first byte {:#04x})",
            self.name(),
            data.first().copied().unwrap_or(0)
        )))
    }
}

/// Look up a plugin by the name the server sent.
pub fn plugin_for(name: &str) -> Result<Box<dyn AuthPlugin>> {
    match name {
        // servers without CLIENT_PLUGIN_AUTH send no name
        plugins::MYSQL_NATIVE_PASSWORD | "" => Ok(Box::new(NativePassword)),
        plugins::CACHING_SHA2_PASSWORD => Ok(Box::new(CachingSha2Password::default())),
        plugins::SHA256_PASSWORD => Ok(Box::new(Sha256Password::default())),
        plugins::MYSQL_CLEAR_PASSWORD => Ok(Box::new(ClearPassword)),
        other => Err(auth_error(format!(
            "authentication plugin '{}' is not supported",
            other
        ))),
    }
}

pub(crate) fn auth_error(message: impl Into<String>) -> Error {
    Error::connection(ConnectionErrorKind::Authentication, message)
}

#[derive(Debug)]
struct NativePassword;

impl AuthPlugin for NativePassword {
    fn name(&self) -> &'static str {
        plugins::MYSQL_NATIVE_PASSWORD
    }

    fn initial_response(&mut self, ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        Ok(mysql_native_password(ctx.password, ctx.seed))
    }
}

#[derive(Debug)]
struct ClearPassword;

impl AuthPlugin for ClearPassword {
    fn name(&self) -> &'static str {
        plugins::MYSQL_CLEAR_PASSWORD
    }

    fn initial_response(&mut self, ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        if !ctx.secure {
            return Err(auth_error(
                "mysql_clear_password would send the password in clear over an unencrypted channel",
            ));
        }
        Ok(nul_terminated(ctx.password))
    }
}

#[derive(Debug, Default)]
struct CachingSha2Password {
    awaiting_public_key: bool,
}

impl AuthPlugin for CachingSha2Password {
    fn name(&self) -> &'static str {
        plugins::CACHING_SHA2_PASSWORD
    }

    fn initial_response(&mut self, ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        Ok(caching_sha2_password(ctx.password, ctx.seed))
    }

    fn more_data(&mut self, ctx: &AuthContext<'_>, data: &[u8]) -> Result<AuthStep> {
        if self.awaiting_public_key {
            self.awaiting_public_key = false;
            return sha256_password_rsa(ctx.password, ctx.seed, data).map(AuthStep::Send);
        }
        match data.first().copied() {
            Some(caching_sha2::FAST_AUTH_SUCCESS) => Ok(AuthStep::Wait),
            Some(caching_sha2::PERFORM_FULL_AUTH) if ctx.secure => {
                Ok(AuthStep::Send(nul_terminated(ctx.password)))
            }
            Some(caching_sha2::PERFORM_FULL_AUTH) => {
                tracing::debug!("caching_sha2_password full authentication, requesting public key");
                self.awaiting_public_key = true;
                Ok(AuthStep::Send(vec![caching_sha2::REQUEST_PUBLIC_KEY]))
            }
            other => Err(auth_error(format!(
                "unexpected caching_sha2_password status {:?}",
                other
            ))),
        }
    }
}

#[derive(Debug, Default)]
struct Sha256Password {
    awaiting_public_key: bool,
}

impl AuthPlugin for Sha256Password {
    fn name(&self) -> &'static str {
        plugins::SHA256_PASSWORD
    }

    fn initial_response(&mut self, ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        if ctx.secure {
            return Ok(nul_terminated(ctx.password));
        }
        if ctx.password.is_empty() {
            return Ok(vec![0]);
        }
        self.awaiting_public_key = true;
        Ok(vec![SHA256_REQUEST_PUBLIC_KEY])
    }

    fn more_data(&mut self, ctx: &AuthContext<'_>, data: &[u8]) -> Result<AuthStep> {
        if !self.awaiting_public_key {
            return Err(auth_error("unexpected additional data for sha256_password"));
        }
        self.awaiting_public_key = false;
        sha256_password_rsa(ctx.password, ctx.seed, data).map(AuthStep::Send)
    }
}

fn nul_terminated(password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(password.len() + 1);
    out.extend_from_slice(password.as_bytes());
    out.push(0);
    out
}

/// The scramble without the NUL the server appends to it.
fn strip_seed(seed: &[u8]) -> &[u8] {
    match seed {
        [head @ .., 0] if head.len() == 20 => head,
        _ => seed,
    }
}

/// mysql_native_password response; empty for an empty password.
pub fn mysql_native_password(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let seed = &seed[..seed.len().min(20)];

    let stage1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();
    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// caching_sha2_password fast-path response; empty for an empty password.
pub fn caching_sha2_password(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let seed = strip_seed(seed);

    let hash: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    let hash_hash: [u8; 32] = Sha256::digest(hash).into();
    let mut hasher = Sha256::new();
    hasher.update(hash_hash);
    hasher.update(seed);
    let scramble: [u8; 32] = hasher.finalize().into();

    hash.iter().zip(scramble.iter()).map(|(a, b)| a ^ b).collect()
}

/// Password (NUL-terminated) XOR the repeated seed.
pub fn xor_password_with_seed(password: &str, seed: &[u8]) -> Vec<u8> {
    let mut out = nul_terminated(password);
    if !seed.is_empty() {
        for (i, b) in out.iter_mut().enumerate() {
            *b ^= seed[i % seed.len()];
        }
    }
    out
}

/// Encrypt the seed-masked password with the server's RSA public key
/// (PEM, SPKI or PKCS#1), OAEP padding.
pub fn sha256_password_rsa(password: &str, seed: &[u8], public_key_pem: &[u8]) -> Result<Vec<u8>> {
    let seed = strip_seed(seed);
    if seed.is_empty() {
        return Err(auth_error("empty seed for RSA password exchange"));
    }
    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|_| auth_error("server public key is not PEM text"))?;
    let key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| auth_error(format!("cannot parse server public key: {}", e)))?;

    key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &xor_password_with_seed(password, seed))
        .map_err(|e| auth_error(format!("RSA encryption failed: {}", e)))
}

/// Random bytes for a scramble.
pub fn generate_nonce(length: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; length];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(password: &'a str, seed: &'a [u8], secure: bool) -> AuthContext<'a> {
        AuthContext {
            password,
            seed,
            secure,
        }
    }

    #[test]
    fn test_native_password_known_vector() {
        // server side: unmask with SHA1(seed + stored) and compare SHA1(stage1)
        let seed: Vec<u8> = (1..=20).collect();
        let response = mysql_native_password("secret", &seed);
        assert_eq!(response.len(), 20);

        let stage2: [u8; 20] = Sha1::digest(Sha1::digest(b"secret")).into();
        let mut hasher = Sha1::new();
        hasher.update(&seed);
        hasher.update(stage2);
        let mask: [u8; 20] = hasher.finalize().into();
        let stage1: Vec<u8> = response.iter().zip(mask.iter()).map(|(a, b)| a ^ b).collect();
        assert_eq!(Sha1::digest(&stage1).as_slice(), stage2.as_slice());

        assert!(mysql_native_password("", &seed).is_empty());
    }

    #[test]
    fn test_caching_sha2_strips_trailing_nul() {
        let mut seed = vec![7u8; 20];
        let plain = caching_sha2_password("secret", &seed);
        seed.push(0);
        assert_eq!(caching_sha2_password("secret", &seed), plain);
        assert_eq!(plain.len(), 32);
        assert!(caching_sha2_password("", &seed).is_empty());
    }

    #[test]
    fn test_plugin_registry() {
        assert_eq!(plugin_for("").unwrap().name(), plugins::MYSQL_NATIVE_PASSWORD);
        assert_eq!(
            plugin_for(plugins::CACHING_SHA2_PASSWORD).unwrap().name(),
            plugins::CACHING_SHA2_PASSWORD
        );
        let err = plugin_for("auth_gssapi_client").unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("auth_gssapi_client"));
    }

    #[test]
    fn test_clear_password_requires_tls() {
        let mut plugin = plugin_for(plugins::MYSQL_CLEAR_PASSWORD).unwrap();
        assert!(plugin.initial_response(&ctx("pw", b"", false)).is_err());
        assert_eq!(plugin.initial_response(&ctx("pw", b"", true)).unwrap(), b"pw\0");
    }

    #[test]
    fn test_caching_sha2_exchange() {
        let seed = [3u8; 20];
        let mut plugin = plugin_for(plugins::CACHING_SHA2_PASSWORD).unwrap();
        let insecure = ctx("pw", &seed, false);
        assert_eq!(plugin.initial_response(&insecure).unwrap().len(), 32);
        assert_eq!(plugin.more_data(&insecure, &[0x03]).unwrap(), AuthStep::Wait);
        assert_eq!(
            plugin.more_data(&insecure, &[0x04]).unwrap(),
            AuthStep::Send(vec![caching_sha2::REQUEST_PUBLIC_KEY])
        );
        // the next packet must be a PEM key
        assert!(plugin.more_data(&insecure, b"not a key").is_err());

        let mut plugin = plugin_for(plugins::CACHING_SHA2_PASSWORD).unwrap();
        let secure = ctx("pw", &seed, true);
        assert_eq!(
            plugin.more_data(&secure, &[0x04]).unwrap(),
            AuthStep::Send(b"pw\0".to_vec())
        );
    }

    #[test]
    fn test_sha256_password_initial_response() {
        let seed = [9u8; 20];
        let mut plugin = plugin_for(plugins::SHA256_PASSWORD).unwrap();
        assert_eq!(plugin.initial_response(&ctx("pw", &seed, true)).unwrap(), b"pw\0");
        let mut plugin = plugin_for(plugins::SHA256_PASSWORD).unwrap();
        assert_eq!(plugin.initial_response(&ctx("", &seed, false)).unwrap(), vec![0]);
        let mut plugin = plugin_for(plugins::SHA256_PASSWORD).unwrap();
        assert_eq!(plugin.initial_response(&ctx("pw", &seed, false)).unwrap(), vec![1]);
    }

    #[test]
    fn test_xor_password_with_seed() {
        let seed = [1, 2, 3, 4, 5, 6, 7, 8];
        let masked = xor_password_with_seed("test", &seed);
        assert_eq!(masked.len(), 5);
        assert_eq!(masked[4], 5);
        let recovered: Vec<u8> = masked
            .iter()
            .enumerate()
            .map(|(i, &b)| b ^ seed[i % seed.len()])
            .collect();
        assert_eq!(recovered, b"test\0");
    }

    #[test]
    fn test_generate_nonce() {
        let a = generate_nonce(20);
        assert_eq!(a.len(), 20);
        assert_ne!(a, generate_nonce(20));
    }
}
