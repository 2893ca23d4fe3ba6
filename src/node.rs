//! The node-side collaborators of the control worker.
//!
//! The controller never touches node state directly. It talks to three
//! narrow interfaces:
//!
//! | Trait | Used for |
//! |-------|----------|
//! | [`AddressRegistry`] | advertising / withdrawing the onion address |
//! | [`NetworkSettings`] | routing onion traffic through the local proxy |
//! | [`KeyStore`] | loading and persisting the service private key |
//!
//! [`LocalAddresses`], [`ProxyTable`] and [`FileKeyStore`] are the
//! implementations used by the `onion-control` binary. The first two are
//! in-memory tables that log every change; a node embedding this crate
//! supplies its own.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use zeroize::{Zeroize, Zeroizing};

use crate::config::LogLevel;
use crate::error::{Error, Result};
use crate::logger::plog;

/// Name of the private key file inside the data directory.
pub const PRIVATE_KEY_FILE: &str = "onion_private_key";

/// Largest private key file we are willing to read.
pub const MAX_KEY_FILE_SIZE: u64 = 64 * 1024;

/// Port of the daemon's SOCKS proxy on the loopback interface.
pub const ONION_PROXY_PORT: u16 = 9050;

/// Host suffix of onion service addresses.
pub const ONION_SUFFIX: &str = ".onion";

/// The daemon's loopback SOCKS proxy, `127.0.0.1:9050`.
pub fn default_onion_proxy() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, ONION_PROXY_PORT))
}

/// Network an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Network {
    /// Onion services, reached through the daemon's SOCKS proxy.
    Onion,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Onion => write!(f, "onion"),
        }
    }
}

/// How an advertised address was learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddressKind {
    /// Added programmatically, as the onion address is.
    Manual,
}

/// An externally reachable onion service endpoint.
///
/// # Example
///
/// ```rust
/// use onion_control::OnionAddress;
///
/// let addr = OnionAddress::from_service_id("abc", 31569);
/// assert_eq!(addr.host(), "abc.onion");
/// assert_eq!(addr.to_string(), "abc.onion:31569");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OnionAddress {
    host: String,
    port: u16,
}

impl OnionAddress {
    /// Derives the address from a `ServiceID` returned by `ADD_ONION`.
    pub fn from_service_id(service_id: &str, port: u16) -> Self {
        Self {
            host: format!("{}{}", service_id, ONION_SUFFIX),
            port,
        }
    }

    /// `<service-id>.onion`.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Virtual port of the service.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Always [`Network::Onion`].
    pub fn network(&self) -> Network {
        Network::Onion
    }
}

impl fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The node's set of advertised listening addresses.
pub trait AddressRegistry {
    /// Starts advertising `address`.
    fn register(&mut self, address: &OnionAddress, kind: AddressKind);

    /// Stops advertising `address`. Unknown addresses are ignored.
    fn unregister(&mut self, address: &OnionAddress);
}

/// The node's outbound proxy configuration.
pub trait NetworkSettings {
    /// Routes outbound connections to `network` through `proxy`.
    fn set_proxy(&mut self, network: Network, proxy: SocketAddr);

    /// Marks `network` as limited (no outbound connections) or not.
    fn set_limited(&mut self, network: Network, limited: bool);
}

/// Persistent storage for the onion service private key.
pub trait KeyStore {
    /// Loads the stored key, or `None` if nothing is stored.
    fn load(&self) -> Result<Option<Zeroizing<String>>>;

    /// Replaces the stored key.
    fn store(&mut self, key: &str) -> Result<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory address registry. Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct LocalAddresses {
    inner: Arc<Mutex<BTreeMap<OnionAddress, AddressKind>>>,
}

impl LocalAddresses {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently advertised addresses, in order.
    pub fn addresses(&self) -> Vec<OnionAddress> {
        lock(&self.inner).keys().cloned().collect()
    }

    /// Whether `address` is currently advertised.
    pub fn contains(&self, address: &OnionAddress) -> bool {
        lock(&self.inner).contains_key(address)
    }
}

impl AddressRegistry for LocalAddresses {
    fn register(&mut self, address: &OnionAddress, kind: AddressKind) {
        if lock(&self.inner).insert(address.clone(), kind).is_none() {
            plog(
                LogLevel::Notice,
                &format!("Advertising local address {}", address),
            );
        }
    }

    fn unregister(&mut self, address: &OnionAddress) {
        if lock(&self.inner).remove(address).is_some() {
            plog(
                LogLevel::Notice,
                &format!("Removed local address {}", address),
            );
        }
    }
}

#[derive(Debug)]
struct ProxyState {
    proxies: BTreeMap<Network, SocketAddr>,
    limited: BTreeSet<Network>,
}

/// In-memory proxy configuration. Clones share the same table.
///
/// The onion network starts out limited: nothing can reach it until a proxy
/// has been configured.
#[derive(Debug, Clone)]
pub struct ProxyTable {
    inner: Arc<Mutex<ProxyState>>,
}

impl Default for ProxyTable {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ProxyState {
                proxies: BTreeMap::new(),
                limited: BTreeSet::from([Network::Onion]),
            })),
        }
    }
}

impl ProxyTable {
    /// A table with no proxies and the onion network limited.
    pub fn new() -> Self {
        Self::default()
    }

    /// Proxy configured for `network`, if any.
    pub fn proxy(&self, network: Network) -> Option<SocketAddr> {
        lock(&self.inner).proxies.get(&network).copied()
    }

    /// Whether connections to `network` are currently disallowed.
    pub fn is_limited(&self, network: Network) -> bool {
        lock(&self.inner).limited.contains(&network)
    }
}

impl NetworkSettings for ProxyTable {
    fn set_proxy(&mut self, network: Network, proxy: SocketAddr) {
        lock(&self.inner).proxies.insert(network, proxy);
        plog(
            LogLevel::Info,
            &format!("Using proxy {} for {} connections", proxy, network),
        );
    }

    fn set_limited(&mut self, network: Network, limited: bool) {
        let mut state = lock(&self.inner);
        if limited {
            state.limited.insert(network);
        } else {
            state.limited.remove(&network);
        }
    }
}

/// Keeps the private key in `<data_dir>/onion_private_key`.
///
/// Writes go to a temporary file which is then renamed over the key file, so
/// a crash never leaves a truncated key behind. On Unix the file is created
/// with mode `0600`.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    /// Stores the key under `data_dir`.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(PRIVATE_KEY_FILE),
        }
    }

    /// Location of the key file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyStore for FileKeyStore {
    fn load(&self) -> Result<Option<Zeroizing<String>>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::KeyStore(format!(
                    "cannot open {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let mut data = Vec::new();
        file.take(MAX_KEY_FILE_SIZE + 1)
            .read_to_end(&mut data)
            .map_err(|e| Error::KeyStore(format!("cannot read {}: {}", self.path.display(), e)))?;
        if data.len() as u64 > MAX_KEY_FILE_SIZE {
            data.zeroize();
            return Err(Error::KeyStore(format!(
                "{} is larger than {} bytes",
                self.path.display(),
                MAX_KEY_FILE_SIZE
            )));
        }

        let key = match String::from_utf8(data) {
            Ok(text) => Zeroizing::new(text),
            Err(e) => {
                e.into_bytes().zeroize();
                return Err(Error::KeyStore(format!(
                    "{} is not valid UTF-8",
                    self.path.display()
                )));
            }
        };

        let trimmed = key.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        // The key is sent as a single ADD_ONION argument.
        if trimmed
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(Error::KeyStore(format!(
                "{} contains whitespace or control characters",
                self.path.display()
            )));
        }
        Ok(Some(Zeroizing::new(trimmed.to_string())))
    }

    fn store(&mut self, key: &str) -> Result<()> {
        let temp_path = self.path.with_extension("tmp");

        #[cfg(unix)]
        let mut file = {
            use std::os::unix::fs::OpenOptionsExt;
            std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&temp_path)
                .map_err(|e| Error::KeyStore(format!("cannot create temp key file: {}", e)))?
        };

        #[cfg(not(unix))]
        let mut file = std::fs::File::create(&temp_path)
            .map_err(|e| Error::KeyStore(format!("cannot create temp key file: {}", e)))?;

        file.write_all(key.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| Error::KeyStore(format!("cannot write temp key file: {}", e)))?;
        drop(file);

        std::fs::rename(&temp_path, &self.path)
            .map_err(|e| Error::KeyStore(format!("cannot rename temp key file: {}", e)))?;

        Ok(())
    }
}
