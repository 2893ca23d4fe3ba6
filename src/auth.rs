//! Control-port authentication.
//!
//! This module turns a `PROTOCOLINFO` reply into an authentication decision and
//! holds the material for the SAFECOOKIE challenge/response exchange.
//!
//! # Method Selection
//!
//! ```text
//!   password configured? ── yes ──▶ HASHEDPASSWORD offered? ── yes ──▶ AUTHENTICATE "<password>"
//!          │                                  │ no (logged)
//!          ▼ no                               ▼
//!   NULL offered? ─────────────── yes ──▶ AUTHENTICATE
//!          │ no
//!          ▼
//!   SAFECOOKIE offered? ────────── yes ──▶ AUTHCHALLENGE SAFECOOKIE <client nonce>
//!          │ no
//!          ▼
//!   no usable method (attempt aborted)
//! ```
//!
//! # SAFECOOKIE
//!
//! ```text
//!   ServerHash = HMAC-SHA256(SAFECOOKIE_SERVER_KEY, cookie | client nonce | server nonce)
//!   ClientHash = HMAC-SHA256(SAFECOOKIE_CLIENT_KEY, cookie | client nonce | server nonce)
//! ```
//!
//! The daemon proves it holds the cookie by sending `ServerHash`; only then do
//! we answer with `ClientHash`. Cookie and nonces live for one attempt and are
//! zeroized on drop.

use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};

use hmac::{Hmac, Mac};
use rand::{CryptoRng, RngCore};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::LogLevel;
use crate::error::{Error, Result};
use crate::logger::plog;
use crate::reply::{
    parse_reply_mapping, parse_reply_mapping_raw, quote_string, sanitize, split_reply_line,
    ControlReply,
};

/// Size of the authentication cookie file, in bytes.
pub const COOKIE_SIZE: usize = 32;

/// Size of the client and server nonces, in bytes.
pub const NONCE_SIZE: usize = 32;

/// HMAC key for the hash the daemon sends to prove it knows the cookie.
pub const SAFECOOKIE_SERVER_KEY: &[u8] =
    b"Tor safe cookie authentication server-to-controller hash";

/// HMAC key for the hash we send to prove we know the cookie.
pub const SAFECOOKIE_CLIENT_KEY: &[u8] =
    b"Tor safe cookie authentication controller-to-server hash";

type HmacSha256 = Hmac<Sha256>;

fn keyed_mac(
    key: &[u8],
    cookie: &[u8],
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::Authentication(format!("invalid HMAC key: {}", e)))?;
    mac.update(cookie);
    mac.update(client_nonce);
    mac.update(server_nonce);
    Ok(mac)
}

/// Computes `HMAC-SHA256(key, cookie | client_nonce | server_nonce)`.
///
/// # Example
///
/// ```rust
/// use onion_control::auth::{compute_response, SAFECOOKIE_CLIENT_KEY, SAFECOOKIE_SERVER_KEY};
///
/// let cookie = [1u8; 32];
/// let client = [2u8; 32];
/// let server = [3u8; 32];
/// let a = compute_response(SAFECOOKIE_SERVER_KEY, &cookie, &client, &server).unwrap();
/// let b = compute_response(SAFECOOKIE_CLIENT_KEY, &cookie, &client, &server).unwrap();
/// assert_ne!(a, b);
/// ```
pub fn compute_response(
    key: &[u8],
    cookie: &[u8],
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> Result<[u8; 32]> {
    let digest = keyed_mac(key, cookie, client_nonce, server_nonce)?
        .finalize()
        .into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// A wrapper for sensitive password data that clears itself on drop.
///
/// Debug output shows `[REDACTED]` instead of the password.
///
/// # Example
///
/// ```rust
/// use onion_control::SecurePassword;
///
/// let password = SecurePassword::new("my_secret_password".to_string());
/// assert_eq!(password.as_str(), "my_secret_password");
///
/// let debug = format!("{:?}", password);
/// assert!(debug.contains("REDACTED"));
/// assert!(!debug.contains("my_secret"));
/// ```
#[derive(Clone)]
pub struct SecurePassword(String);

impl SecurePassword {
    /// Creates a new secure password wrapper.
    pub fn new(password: String) -> Self {
        Self(password)
    }

    /// Returns a reference to the password string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Builds the `AUTHENTICATE "<password>"` command with quotes and
    /// backslashes escaped.
    pub fn authenticate_command(&self) -> String {
        format!("AUTHENTICATE {}", quote_string(&self.0))
    }
}

impl Drop for SecurePassword {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SecurePassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecurePassword([REDACTED])")
    }
}

/// What the daemon told us in its `PROTOCOLINFO` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolInfo {
    /// Offered authentication methods (`METHODS=`).
    pub methods: BTreeSet<String>,
    /// Cookie file path (`COOKIEFILE=`), if advertised.
    pub cookie_file: Option<PathBuf>,
    /// Daemon version (`VERSION Tor=`), if advertised.
    pub version: Option<String>,
}

/// The authentication method chosen for an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// `AUTHENTICATE "<password>"`.
    HashedPassword,
    /// `AUTHENTICATE` with no argument.
    Null,
    /// `AUTHCHALLENGE SAFECOOKIE`, reading the cookie from this path.
    SafeCookie(PathBuf),
}

impl ProtocolInfo {
    /// Extracts the `AUTH` and `VERSION` lines of a `PROTOCOLINFO` reply.
    ///
    /// Lines of any other type, and lines whose arguments do not parse, are
    /// skipped.
    pub fn parse(reply: &ControlReply) -> Self {
        let mut info = ProtocolInfo::default();

        for line in &reply.lines {
            let (kind, args) = split_reply_line(line);
            match kind {
                "AUTH" => {
                    let mut mapping = parse_reply_mapping_raw(args);
                    if let Some(methods) = mapping.remove("METHODS") {
                        info.methods = String::from_utf8_lossy(&methods)
                            .split(',')
                            .filter(|m| !m.is_empty())
                            .map(str::to_string)
                            .collect();
                    }
                    if let Some(path) = mapping.remove("COOKIEFILE") {
                        info.cookie_file = Some(path_from_bytes(path));
                    }
                }
                "VERSION" => {
                    if let Some(version) = parse_reply_mapping(args).remove("Tor") {
                        plog(
                            LogLevel::Debug,
                            &format!("tor: Connected to Tor version {}", sanitize(&version)),
                        );
                        info.version = Some(version);
                    }
                }
                _ => {}
            }
        }

        for method in &info.methods {
            plog(
                LogLevel::Debug,
                &format!("tor: Supported authentication method: {}", sanitize(method)),
            );
        }

        info
    }

    /// Returns true if the daemon offered `method`.
    pub fn supports(&self, method: &str) -> bool {
        self.methods.contains(method)
    }

    /// Picks the authentication method, in priority order.
    ///
    /// A configured password is used only with HASHEDPASSWORD; if that is not
    /// offered the remaining methods are still considered.
    pub fn select_method(&self, have_password: bool) -> Result<AuthMethod> {
        if have_password {
            if self.supports("HASHEDPASSWORD") {
                plog(LogLevel::Debug, "tor: Using HASHEDPASSWORD authentication");
                return Ok(AuthMethod::HashedPassword);
            }
            plog(
                LogLevel::Notice,
                "tor: Password provided with control_pass, but HASHEDPASSWORD authentication is not available",
            );
        }

        if self.supports("NULL") {
            plog(LogLevel::Debug, "tor: Using NULL authentication");
            return Ok(AuthMethod::Null);
        }

        if self.supports("SAFECOOKIE") {
            let path = self.cookie_file.clone().ok_or_else(|| {
                Error::Cookie("SAFECOOKIE offered without a COOKIEFILE".to_string())
            })?;
            plog(
                LogLevel::Debug,
                &format!(
                    "tor: Using SAFECOOKIE authentication, reading cookie authentication from {}",
                    path.display()
                ),
            );
            return Ok(AuthMethod::SafeCookie(path));
        }

        if self.supports("HASHEDPASSWORD") {
            return Err(Error::Authentication(
                "the only supported authentication mechanism left is password, but no password provided with control_pass".to_string(),
            ));
        }

        Err(Error::Authentication(
            "no supported authentication method".to_string(),
        ))
    }
}

/// Builds a path from decoded reply bytes without a UTF-8 round trip.
#[cfg(unix)]
fn path_from_bytes(bytes: Vec<u8>) -> PathBuf {
    use std::os::unix::ffi::OsStringExt;
    PathBuf::from(std::ffi::OsString::from_vec(bytes))
}

#[cfg(not(unix))]
fn path_from_bytes(bytes: Vec<u8>) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(&bytes).into_owned())
}

/// Reads an authentication cookie, which must be exactly [`COOKIE_SIZE`] bytes.
pub fn read_cookie(path: &Path) -> Result<[u8; COOKIE_SIZE]> {
    let file = std::fs::File::open(path).map_err(|e| {
        Error::Cookie(format!(
            "authentication cookie {} could not be opened (check permissions): {}",
            path.display(),
            e
        ))
    })?;

    let mut data = Vec::with_capacity(COOKIE_SIZE + 1);
    file.take(COOKIE_SIZE as u64 + 1).read_to_end(&mut data)?;

    let result = if data.len() == COOKIE_SIZE {
        let mut cookie = [0u8; COOKIE_SIZE];
        cookie.copy_from_slice(&data);
        Ok(cookie)
    } else {
        Err(Error::Cookie(format!(
            "authentication cookie {} is not exactly {} bytes",
            path.display(),
            COOKIE_SIZE
        )))
    };
    data.zeroize();
    result
}

/// Cookie and client nonce for one SAFECOOKIE attempt.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SafeCookie {
    cookie: [u8; COOKIE_SIZE],
    client_nonce: [u8; NONCE_SIZE],
}

impl std::fmt::Debug for SafeCookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SafeCookie([REDACTED])")
    }
}

impl SafeCookie {
    /// Pairs `cookie` with a fresh client nonce drawn from `rng`.
    pub fn new<R: RngCore + CryptoRng>(cookie: [u8; COOKIE_SIZE], rng: &mut R) -> Self {
        let mut client_nonce = [0u8; NONCE_SIZE];
        rng.fill_bytes(&mut client_nonce);
        Self {
            cookie,
            client_nonce,
        }
    }

    /// Reads the cookie at `path` and generates a client nonce.
    pub fn load<R: RngCore + CryptoRng>(path: &Path, rng: &mut R) -> Result<Self> {
        let mut cookie = read_cookie(path)?;
        let material = Self::new(cookie, rng);
        cookie.zeroize();
        Ok(material)
    }

    /// The client nonce sent with the challenge.
    pub fn client_nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.client_nonce
    }

    /// `AUTHCHALLENGE SAFECOOKIE <client nonce hex>`.
    pub fn challenge_command(&self) -> String {
        format!("AUTHCHALLENGE SAFECOOKIE {}", hex::encode(self.client_nonce))
    }

    /// Verifies the daemon's `AUTHCHALLENGE` reply and builds the
    /// `AUTHENTICATE <client hash hex>` command.
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] if the reply is not a parseable `AUTHCHALLENGE` line
    /// - [`Error::Authentication`] if the server nonce is not [`NONCE_SIZE`]
    ///   bytes or the server hash does not match our cookie
    pub fn respond(&self, reply: &ControlReply) -> Result<String> {
        let line = reply
            .lines
            .first()
            .ok_or_else(|| Error::Protocol("empty reply to AUTHCHALLENGE".to_string()))?;
        let (kind, args) = split_reply_line(line);
        if kind != "AUTHCHALLENGE" {
            return Err(Error::Protocol("invalid reply to AUTHCHALLENGE".to_string()));
        }

        let mapping = parse_reply_mapping(args);
        if mapping.is_empty() {
            return Err(Error::Protocol(format!(
                "error parsing AUTHCHALLENGE parameters: {}",
                sanitize(args)
            )));
        }

        let decode = |key: &str| -> Result<Vec<u8>> {
            hex::decode(mapping.get(key).map(String::as_str).unwrap_or_default()).map_err(|e| {
                Error::Protocol(format!("AUTHCHALLENGE {} is not valid hex: {}", key, e))
            })
        };
        let server_hash = decode("SERVERHASH")?;
        let server_nonce = decode("SERVERNONCE")?;
        plog(
            LogLevel::Debug,
            &format!(
                "tor: AUTHCHALLENGE ServerHash {} ServerNonce {}",
                hex::encode(&server_hash),
                hex::encode(&server_nonce)
            ),
        );

        if server_nonce.len() != NONCE_SIZE {
            return Err(Error::Authentication(format!(
                "ServerNonce is not {} bytes",
                NONCE_SIZE
            )));
        }

        keyed_mac(
            SAFECOOKIE_SERVER_KEY,
            &self.cookie,
            &self.client_nonce,
            &server_nonce,
        )?
        .verify_slice(&server_hash)
        .map_err(|_| {
            Error::Authentication(format!(
                "ServerHash {} does not match the expected ServerHash",
                hex::encode(&server_hash)
            ))
        })?;

        let client_hash = compute_response(
            SAFECOOKIE_CLIENT_KEY,
            &self.cookie,
            &self.client_nonce,
            &server_nonce,
        )?;
        Ok(format!("AUTHENTICATE {}", hex::encode(client_hash)))
    }
}
