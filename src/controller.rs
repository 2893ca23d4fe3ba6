//! Onion service controller.
//!
//! [`ServiceController`] is the state machine that takes a fresh control-port
//! connection through discovery, authentication and provisioning. It performs
//! no I/O on the connection itself: the worker loop feeds it connection events
//! and replies, and sends whatever [`Command`] it returns.
//!
//! # State Machine
//!
//! ```text
//!                      on_connected()
//!   ┌──────┐         PROTOCOLINFO 1        ┌───────────────────────┐
//!   │ Idle │──────────────────────────────▶│ AwaitingProtocolInfo  │
//!   └──────┘                               └───────────┬───────────┘
//!      ▲                   SAFECOOKIE                  │ NULL / HASHEDPASSWORD
//!      │          ┌────────────────────────────────────┤
//!      │          ▼                                    │
//!      │  ┌───────────────────────┐  AUTHENTICATE      ▼
//!      │  │ AwaitingAuthChallenge │──<client hash>─▶┌──────────────────────┐
//!      │  └───────────────────────┘                 │ AwaitingAuthenticate │
//!      │                                            └──────────┬───────────┘
//!      │                                                       │ ADD_ONION
//!      │                                                       ▼
//!      │   ┌─────────────┐     register address    ┌──────────────────────┐
//!      │   │ Provisioned │◀────────────────────────│   AwaitingAddOnion   │
//!      │   └──────┬──────┘                         └──────────────────────┘
//!      │          │
//!      └──────────┴── on_disconnected(): unregister address, back to Idle
//! ```
//!
//! Any failure (non-250 reply, unusable method, cookie problems, hash
//! mismatch, missing `ServiceID`) is logged and drops the controller back to
//! [`ControllerState::Idle`]. Nothing is retried on the same connection; the
//! next connection starts over.
//!
//! # Invariants
//!
//! - At most one address is registered, and only after a successful
//!   `ADD_ONION` reply.
//! - The registered address is withdrawn on disconnection and when the
//!   controller is dropped.
//! - A SAFECOOKIE cookie and nonce belong to a single attempt.

use std::fmt;

use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::auth::{AuthMethod, ProtocolInfo, SafeCookie, SecurePassword};
use crate::config::{Config, LogLevel};
use crate::error::{Error, Result};
use crate::logger::plog;
use crate::node::{
    default_onion_proxy, AddressKind, AddressRegistry, KeyStore, Network, NetworkSettings,
    OnionAddress,
};
use crate::reply::{parse_reply_mapping, sanitize, ControlReply, REPLY_UNRECOGNIZED};

/// Which command a reply answers. Queued with each command on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// `PROTOCOLINFO 1`
    ProtocolInfo,
    /// `AUTHCHALLENGE SAFECOOKIE <nonce>`
    AuthChallenge,
    /// `AUTHENTICATE [<secret>]`
    Authenticate,
    /// `ADD_ONION <key> Port=...`
    AddOnion,
}

/// Where the controller is in the provisioning sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Not connected, or the last handshake failed.
    Idle,
    /// `PROTOCOLINFO 1` sent.
    AwaitingProtocolInfo,
    /// SAFECOOKIE challenge sent.
    AwaitingAuthChallenge,
    /// `AUTHENTICATE` sent.
    AwaitingAuthenticate,
    /// `ADD_ONION` sent.
    AwaitingAddOnion,
    /// The service exists and its address is registered.
    Provisioned,
}

impl Step {
    fn awaited_in(self) -> ControllerState {
        match self {
            Step::ProtocolInfo => ControllerState::AwaitingProtocolInfo,
            Step::AuthChallenge => ControllerState::AwaitingAuthChallenge,
            Step::Authenticate => ControllerState::AwaitingAuthenticate,
            Step::AddOnion => ControllerState::AwaitingAddOnion,
        }
    }
}

/// A command line to send, and the step its reply belongs to.
///
/// Debug output omits the line, which may carry a password or private key.
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    /// Command text, without the line terminator.
    pub line: String,
    /// Step the reply will be handed back with.
    pub step: Step,
}

impl Command {
    fn new(line: String, step: Step) -> Self {
        Self { line, step }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

/// Node-facing settings the controller needs.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Node listening port; used as both the virtual and the target port.
    pub listen_port: u16,
    /// Control-port password for HASHEDPASSWORD.
    pub password: Option<SecurePassword>,
    /// Externally configured onion proxy. When set, the controller leaves
    /// proxy settings alone.
    pub onion_proxy: Option<String>,
    /// Key type requested as `NEW:<key_type>` when no key is stored.
    pub key_type: String,
}

impl ControllerSettings {
    /// Picks the controller's fields out of the full configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            listen_port: config.listen_port,
            password: config
                .control_pass
                .as_ref()
                .map(|p| SecurePassword::new(p.clone())),
            onion_proxy: config.onion_proxy.clone(),
            key_type: config.key_type.clone(),
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// The node collaborators the controller drives.
pub struct NodeContext {
    /// Where the onion address is advertised.
    pub registry: Box<dyn AddressRegistry + Send>,
    /// Proxy settings for the onion network.
    pub network: Box<dyn NetworkSettings + Send>,
    /// Persistent storage for the service private key.
    pub keys: Box<dyn KeyStore + Send>,
}

/// Drives one control connection from `PROTOCOLINFO` to a registered onion
/// address.
pub struct ServiceController {
    settings: ControllerSettings,
    node: NodeContext,
    state: ControllerState,
    private_key: Option<Zeroizing<String>>,
    service_id: Option<String>,
    advertised: Option<OnionAddress>,
    cookie: Option<SafeCookie>,
}

impl ServiceController {
    /// Creates an idle controller, loading any stored private key.
    ///
    /// A key that cannot be read is logged and ignored; a fresh one will be
    /// requested.
    pub fn new(settings: ControllerSettings, node: NodeContext) -> Self {
        let private_key = match node.keys.load() {
            Ok(key) => key,
            Err(e) => {
                plog(
                    LogLevel::Warn,
                    &format!("tor: Cannot load service private key: {}", e),
                );
                None
            }
        };
        if private_key.is_some() {
            plog(LogLevel::Debug, "tor: Using stored service private key");
        }

        Self {
            settings,
            node,
            state: ControllerState::Idle,
            private_key,
            service_id: None,
            advertised: None,
            cookie: None,
        }
    }

    /// Current handshake state.
    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// The currently registered address, if provisioned.
    pub fn advertised(&self) -> Option<&OnionAddress> {
        self.advertised.as_ref()
    }

    /// Service ID from the last successful `ADD_ONION`.
    pub fn service_id(&self) -> Option<&str> {
        self.service_id.as_deref()
    }

    /// Whether a private key is held (stored or freshly issued).
    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }

    /// A connection came up: start over with `PROTOCOLINFO 1`.
    pub fn on_connected(&mut self) -> Command {
        self.withdraw();
        self.state = ControllerState::AwaitingProtocolInfo;
        Command::new("PROTOCOLINFO 1".to_string(), Step::ProtocolInfo)
    }

    /// The connection went down: withdraw the address and go idle.
    pub fn on_disconnected(&mut self) {
        self.withdraw();
        self.state = ControllerState::Idle;
    }

    /// Handles the reply to the command sent for `step`.
    ///
    /// Returns the next command to send, if any. Failures are logged here and
    /// leave the controller idle.
    pub fn handle_reply(&mut self, step: Step, reply: &ControlReply) -> Option<Command> {
        if self.state != step.awaited_in() {
            plog(
                LogLevel::Debug,
                &format!(
                    "tor: Ignoring {:?} reply {} while {:?}",
                    step, reply.code, self.state
                ),
            );
            return None;
        }

        let result = match step {
            Step::ProtocolInfo => self.protocolinfo_reply(reply),
            Step::AuthChallenge => self.authchallenge_reply(reply),
            Step::Authenticate => self.authenticate_reply(reply),
            Step::AddOnion => self.add_onion_reply(reply).map(|()| None),
        };

        match result {
            Ok(next) => next,
            Err(e) => {
                plog(LogLevel::Warn, &format!("tor: {}", e));
                self.cookie = None;
                self.state = ControllerState::Idle;
                None
            }
        }
    }

    fn protocolinfo_reply(&mut self, reply: &ControlReply) -> Result<Option<Command>> {
        if !reply.is_ok() {
            return Err(Error::Protocol(format!(
                "requesting protocol info failed ({})",
                reply.code
            )));
        }

        let info = ProtocolInfo::parse(reply);
        let command = match info.select_method(self.settings.password.is_some())? {
            AuthMethod::HashedPassword => {
                let password = self.settings.password.as_ref().ok_or_else(|| {
                    Error::Authentication("no control password configured".to_string())
                })?;
                self.state = ControllerState::AwaitingAuthenticate;
                Command::new(password.authenticate_command(), Step::Authenticate)
            }
            AuthMethod::Null => {
                self.state = ControllerState::AwaitingAuthenticate;
                Command::new("AUTHENTICATE".to_string(), Step::Authenticate)
            }
            AuthMethod::SafeCookie(path) => {
                let cookie = SafeCookie::load(&path, &mut OsRng)?;
                let line = cookie.challenge_command();
                self.cookie = Some(cookie);
                self.state = ControllerState::AwaitingAuthChallenge;
                Command::new(line, Step::AuthChallenge)
            }
        };
        Ok(Some(command))
    }

    fn authchallenge_reply(&mut self, reply: &ControlReply) -> Result<Option<Command>> {
        let cookie = self
            .cookie
            .take()
            .ok_or_else(|| Error::Authentication("no SAFECOOKIE attempt in progress".to_string()))?;

        if !reply.is_ok() {
            return Err(Error::Authentication(format!(
                "SAFECOOKIE authentication challenge failed ({})",
                reply.code
            )));
        }
        plog(
            LogLevel::Debug,
            "tor: SAFECOOKIE authentication challenge successful",
        );

        let line = cookie.respond(reply)?;
        self.state = ControllerState::AwaitingAuthenticate;
        Ok(Some(Command::new(line, Step::Authenticate)))
    }

    fn authenticate_reply(&mut self, reply: &ControlReply) -> Result<Option<Command>> {
        if !reply.is_ok() {
            return Err(Error::Authentication(format!(
                "authentication failed ({})",
                reply.code
            )));
        }
        plog(LogLevel::Debug, "tor: Authentication successful");

        if self.settings.onion_proxy.is_none() {
            let proxy = default_onion_proxy();
            self.node.network.set_proxy(Network::Onion, proxy);
            self.node.network.set_limited(Network::Onion, false);
        }

        let key_spec = match &self.private_key {
            Some(key) => Zeroizing::new(key.as_str().to_owned()),
            None => Zeroizing::new(format!("NEW:{}", self.settings.key_type)),
        };
        let port = self.settings.listen_port;
        self.state = ControllerState::AwaitingAddOnion;
        Ok(Some(Command::new(
            format!("ADD_ONION {} Port={},127.0.0.1:{}", key_spec.as_str(), port, port),
            Step::AddOnion,
        )))
    }

    fn add_onion_reply(&mut self, reply: &ControlReply) -> Result<()> {
        if !reply.is_ok() {
            let hint = if reply.code == REPLY_UNRECOGNIZED {
                " (unrecognized command; the daemon is too old for ADD_ONION)"
            } else {
                ""
            };
            return Err(Error::Provisioning(format!(
                "ADD_ONION failed ({}){}: {}",
                reply.code,
                hint,
                redacted_lines(reply)
            )));
        }
        plog(LogLevel::Debug, "tor: ADD_ONION successful");

        let mut service_id = None;
        let mut private_key = None;
        for line in &reply.lines {
            let mut mapping = parse_reply_mapping(line);
            if let Some(id) = mapping.remove("ServiceID") {
                service_id = Some(id);
            }
            if let Some(key) = mapping.remove("PrivateKey") {
                private_key = Some(Zeroizing::new(key));
            }
        }

        let service_id = service_id.ok_or_else(|| {
            Error::Protocol(format!(
                "error parsing ADD_ONION parameters: {}",
                redacted_lines(reply)
            ))
        })?;

        if let Some(key) = private_key {
            self.private_key = Some(key);
        }
        // A reused key comes back without PrivateKey=; write it anyway.
        if let Some(key) = &self.private_key {
            match self.node.keys.store(key) {
                Ok(()) => plog(LogLevel::Debug, "tor: Cached service private key"),
                Err(e) => plog(
                    LogLevel::Warn,
                    &format!("tor: Error writing service private key: {}", e),
                ),
            }
        }

        let address = OnionAddress::from_service_id(&service_id, self.settings.listen_port);
        plog(
            LogLevel::Notice,
            &format!(
                "tor: Got service ID {}, advertising service {}",
                sanitize(&service_id),
                sanitize(&address.to_string())
            ),
        );

        self.withdraw();
        self.node.registry.register(&address, AddressKind::Manual);
        self.advertised = Some(address);
        self.service_id = Some(service_id);
        self.state = ControllerState::Provisioned;
        Ok(())
    }

    fn withdraw(&mut self) {
        self.cookie = None;
        if let Some(address) = self.advertised.take() {
            self.node.registry.unregister(&address);
        }
        self.service_id = None;
    }
}

impl Drop for ServiceController {
    fn drop(&mut self) {
        self.withdraw();
    }
}

fn redacted_lines(reply: &ControlReply) -> String {
    reply
        .lines
        .iter()
        .map(|line| {
            if line.starts_with("PrivateKey=") {
                "PrivateKey=[REDACTED]".to_string()
            } else {
                sanitize(line)
            }
        })
        .collect::<Vec<_>>()
        .join(" | ")
}


#[cfg(test)]
mod tests {
    use super::testing::{NodeCall, Recorder};
    use super::*;
    use crate::auth::{compute_response, SAFECOOKIE_CLIENT_KEY, SAFECOOKIE_SERVER_KEY};
    use std::io::Write;

    const PORT: u16 = 31569;

    fn reply(code: u16, lines: &[&str]) -> ControlReply {
        ControlReply::new(code, lines.iter().map(|l| l.to_string()).collect())
    }

    fn settings() -> ControllerSettings {
        ControllerSettings {
            listen_port: PORT,
            password: None,
            onion_proxy: None,
            key_type: "ED25519-V3".to_string(),
        }
    }

    fn controller(recorder: &Recorder, settings: ControllerSettings) -> ServiceController {
        ServiceController::new(settings, recorder.context())
    }

    fn provision(ctrl: &mut ServiceController) {
        let cmd = ctrl.on_connected();
        assert_eq!(cmd.line, "PROTOCOLINFO 1");
        let cmd = ctrl
            .handle_reply(
                Step::ProtocolInfo,
                &reply(250, &["PROTOCOLINFO 1", "AUTH METHODS=NULL", "OK"]),
            )
            .unwrap();
        assert_eq!(cmd.line, "AUTHENTICATE");
        let cmd = ctrl
            .handle_reply(Step::Authenticate, &reply(250, &["OK"]))
            .unwrap();
        assert_eq!(cmd.step, Step::AddOnion);
        assert!(ctrl
            .handle_reply(
                Step::AddOnion,
                &reply(250, &["ServiceID=abc", "PrivateKey=xyz", "OK"])
            )
            .is_none());
    }

    #[test]
    fn test_null_auth_provisions_service() {
        let recorder = Recorder::default();
        let mut ctrl = controller(&recorder, settings());
        assert_eq!(ctrl.state(), ControllerState::Idle);

        let cmd = ctrl.on_connected();
        assert_eq!(cmd.step, Step::ProtocolInfo);
        assert_eq!(ctrl.state(), ControllerState::AwaitingProtocolInfo);

        let cmd = ctrl
            .handle_reply(
                Step::ProtocolInfo,
                &reply(250, &["PROTOCOLINFO 1", "AUTH METHODS=NULL", r#"VERSION Tor="0.4.8.9""#, "OK"]),
            )
            .unwrap();
        assert_eq!(cmd.line, "AUTHENTICATE");
        assert_eq!(ctrl.state(), ControllerState::AwaitingAuthenticate);

        let cmd = ctrl
            .handle_reply(Step::Authenticate, &reply(250, &["OK"]))
            .unwrap();
        assert_eq!(
            cmd.line,
            format!("ADD_ONION NEW:ED25519-V3 Port={},127.0.0.1:{}", PORT, PORT)
        );
        assert_eq!(ctrl.state(), ControllerState::AwaitingAddOnion);

        let next = ctrl.handle_reply(
            Step::AddOnion,
            &reply(250, &["ServiceID=abc", "PrivateKey=xyz", "OK"]),
        );
        assert!(next.is_none());
        assert_eq!(ctrl.state(), ControllerState::Provisioned);
        assert_eq!(ctrl.service_id(), Some("abc"));
        assert_eq!(
            ctrl.advertised().map(ToString::to_string),
            Some(format!("abc.onion:{}", PORT))
        );

        assert_eq!(
            recorder.calls(),
            vec![
                NodeCall::SetProxy(Network::Onion, default_onion_proxy()),
                NodeCall::SetLimited(Network::Onion, false),
                NodeCall::StoreKey("xyz".to_string()),
                NodeCall::Register(format!("abc.onion:{}", PORT)),
            ]
        );
    }

    #[test]
    fn test_stored_key_is_reused() {
        let recorder = Recorder::with_key("ED25519-V3:stored");
        let mut ctrl = controller(&recorder, settings());
        assert!(ctrl.has_private_key());

        ctrl.on_connected();
        ctrl.handle_reply(Step::ProtocolInfo, &reply(250, &["AUTH METHODS=NULL", "OK"]));
        let cmd = ctrl
            .handle_reply(Step::Authenticate, &reply(250, &["OK"]))
            .unwrap();
        assert_eq!(
            cmd.line,
            format!("ADD_ONION ED25519-V3:stored Port={},127.0.0.1:{}", PORT, PORT)
        );

        ctrl.handle_reply(Step::AddOnion, &reply(250, &["ServiceID=abc", "OK"]));
        assert_eq!(ctrl.state(), ControllerState::Provisioned);

        // The reused key is written back even though the daemon did not echo it.
        let stores: Vec<_> = recorder
            .calls()
            .into_iter()
            .filter(|c| matches!(c, NodeCall::StoreKey(_)))
            .collect();
        assert_eq!(stores, vec![NodeCall::StoreKey("ED25519-V3:stored".to_string())]);
    }

    #[test]
    fn test_password_auth() {
        let recorder = Recorder::default();
        let mut settings = settings();
        settings.password = Some(SecurePassword::new(r#"se"cret"#.to_string()));
        let mut ctrl = controller(&recorder, settings);

        ctrl.on_connected();
        let cmd = ctrl
            .handle_reply(
                Step::ProtocolInfo,
                &reply(250, &["AUTH METHODS=HASHEDPASSWORD,NULL", "OK"]),
            )
            .unwrap();
        assert_eq!(cmd.line, r#"AUTHENTICATE "se\"cret""#);
        assert_eq!(cmd.step, Step::Authenticate);
        assert!(!format!("{:?}", cmd).contains("cret"));
    }

    #[test]
    fn test_password_required_but_missing() {
        let recorder = Recorder::default();
        let mut ctrl = controller(&recorder, settings());
        ctrl.on_connected();
        assert!(ctrl
            .handle_reply(
                Step::ProtocolInfo,
                &reply(250, &["AUTH METHODS=HASHEDPASSWORD", "OK"])
            )
            .is_none());
        assert_eq!(ctrl.state(), ControllerState::Idle);
    }

    fn safecookie_controller(cookie: &[u8]) -> (ServiceController, Recorder, tempfile::NamedTempFile, String) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(cookie).unwrap();
        file.flush().unwrap();

        let recorder = Recorder::default();
        let mut ctrl = controller(&recorder, settings());
        ctrl.on_connected();
        let auth_line = format!(
            r#"AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE="{}""#,
            file.path().display()
        );
        let protocolinfo = reply(250, &[auth_line.as_str(), "OK"]);
        let line = ctrl
            .handle_reply(Step::ProtocolInfo, &protocolinfo)
            .map(|c| c.line)
            .unwrap_or_default();
        (ctrl, recorder, file, line)
    }

    #[test]
    fn test_safecookie_auth() {
        let cookie = [0x5Au8; 32];
        let (mut ctrl, _recorder, _file, line) = safecookie_controller(&cookie);
        assert_eq!(ctrl.state(), ControllerState::AwaitingAuthChallenge);

        let client_nonce = hex::decode(line.strip_prefix("AUTHCHALLENGE SAFECOOKIE ").unwrap()).unwrap();
        let server_nonce = [0x11u8; 32];
        let server_hash =
            compute_response(SAFECOOKIE_SERVER_KEY, &cookie, &client_nonce, &server_nonce).unwrap();

        let challenge = format!(
            "AUTHCHALLENGE SERVERHASH={} SERVERNONCE={}",
            hex::encode(server_hash),
            hex::encode(server_nonce)
        );
        let cmd = ctrl
            .handle_reply(Step::AuthChallenge, &reply(250, &[challenge.as_str()]))
            .unwrap();

        let client_hash =
            compute_response(SAFECOOKIE_CLIENT_KEY, &cookie, &client_nonce, &server_nonce).unwrap();
        assert_eq!(cmd.line, format!("AUTHENTICATE {}", hex::encode(client_hash)));
        assert_eq!(ctrl.state(), ControllerState::AwaitingAuthenticate);
    }

    #[test]
    fn test_safecookie_server_hash_mismatch() {
        let (mut ctrl, recorder, _file, _line) = safecookie_controller(&[0x5Au8; 32]);
        let challenge = format!(
            "AUTHCHALLENGE SERVERHASH={} SERVERNONCE={}",
            "ab".repeat(32),
            "11".repeat(32)
        );
        let next = ctrl.handle_reply(Step::AuthChallenge, &reply(250, &[challenge.as_str()]));
        assert!(next.is_none());
        assert_eq!(ctrl.state(), ControllerState::Idle);
        assert!(recorder.calls().is_empty());
    }

    #[test]
    fn test_safecookie_bad_cookie_size() {
        let (ctrl, _recorder, _file, line) = safecookie_controller(&[0x5Au8; 31]);
        assert!(line.is_empty());
        assert_eq!(ctrl.state(), ControllerState::Idle);
    }

    #[test]
    fn test_no_supported_method() {
        let recorder = Recorder::default();
        let mut ctrl = controller(&recorder, settings());
        ctrl.on_connected();
        assert!(ctrl
            .handle_reply(Step::ProtocolInfo, &reply(250, &["AUTH METHODS=COOKIE", "OK"]))
            .is_none());
        assert_eq!(ctrl.state(), ControllerState::Idle);
    }

    #[test]
    fn test_non_ok_replies_abort() {
        for (step, setup) in [
            (Step::ProtocolInfo, 0usize),
            (Step::Authenticate, 1),
            (Step::AddOnion, 2),
        ] {
            let recorder = Recorder::default();
            let mut ctrl = controller(&recorder, settings());
            ctrl.on_connected();
            if setup >= 1 {
                ctrl.handle_reply(Step::ProtocolInfo, &reply(250, &["AUTH METHODS=NULL", "OK"]));
            }
            if setup >= 2 {
                ctrl.handle_reply(Step::Authenticate, &reply(250, &["OK"]));
            }
            assert!(ctrl
                .handle_reply(step, &reply(515, &["Authentication failed"]))
                .is_none());
            assert_eq!(ctrl.state(), ControllerState::Idle);
            assert!(ctrl.advertised().is_none());
        }
    }

    #[test]
    fn test_add_onion_unrecognized() {
        let recorder = Recorder::default();
        let mut ctrl = controller(&recorder, settings());
        ctrl.on_connected();
        ctrl.handle_reply(Step::ProtocolInfo, &reply(250, &["AUTH METHODS=NULL", "OK"]));
        ctrl.handle_reply(Step::Authenticate, &reply(250, &["OK"]));

        ctrl.handle_reply(
            Step::AddOnion,
            &reply(REPLY_UNRECOGNIZED, &["Unrecognized command \"ADD_ONION\""]),
        );
        assert_eq!(ctrl.state(), ControllerState::Idle);
        assert!(!recorder
            .calls()
            .iter()
            .any(|c| matches!(c, NodeCall::Register(_))));
    }

    #[test]
    fn test_add_onion_missing_service_id() {
        let recorder = Recorder::default();
        let mut ctrl = controller(&recorder, settings());
        ctrl.on_connected();
        ctrl.handle_reply(Step::ProtocolInfo, &reply(250, &["AUTH METHODS=NULL", "OK"]));
        ctrl.handle_reply(Step::Authenticate, &reply(250, &["OK"]));

        ctrl.handle_reply(Step::AddOnion, &reply(250, &["PrivateKey=xyz", "OK"]));
        assert_eq!(ctrl.state(), ControllerState::Idle);
        assert!(ctrl.advertised().is_none());
        assert!(!recorder
            .calls()
            .iter()
            .any(|c| matches!(c, NodeCall::Register(_) | NodeCall::StoreKey(_))));
    }

    #[test]
    fn test_key_store_failure_still_registers() {
        let mut recorder = Recorder::default();
        recorder.fail_store = true;
        let mut ctrl = controller(&recorder, settings());
        provision(&mut ctrl);
        assert_eq!(ctrl.state(), ControllerState::Provisioned);
        assert!(ctrl.has_private_key());
        assert!(recorder
            .calls()
            .contains(&NodeCall::Register(format!("abc.onion:{}", PORT))));
    }

    #[test]
    fn test_proxy_override_leaves_network_alone() {
        let recorder = Recorder::default();
        let mut settings = settings();
        settings.onion_proxy = Some("127.0.0.1:9150".to_string());
        let mut ctrl = controller(&recorder, settings);
        provision(&mut ctrl);
        assert!(!recorder
            .calls()
            .iter()
            .any(|c| matches!(c, NodeCall::SetProxy(..) | NodeCall::SetLimited(..))));
    }

    #[test]
    fn test_disconnect_unregisters_once() {
        let recorder = Recorder::default();
        let mut ctrl = controller(&recorder, settings());
        provision(&mut ctrl);

        ctrl.on_disconnected();
        ctrl.on_disconnected();
        assert_eq!(ctrl.state(), ControllerState::Idle);
        assert!(ctrl.advertised().is_none());

        let unregisters: Vec<_> = recorder
            .calls()
            .into_iter()
            .filter(|c| matches!(c, NodeCall::Unregister(_)))
            .collect();
        assert_eq!(
            unregisters,
            vec![NodeCall::Unregister(format!("abc.onion:{}", PORT))]
        );
    }

    #[test]
    fn test_drop_unregisters() {
        let recorder = Recorder::default();
        let mut ctrl = controller(&recorder, settings());
        provision(&mut ctrl);
        drop(ctrl);
        assert_eq!(
            recorder.calls().last(),
            Some(&NodeCall::Unregister(format!("abc.onion:{}", PORT)))
        );
    }

    #[test]
    fn test_stale_reply_ignored() {
        let recorder = Recorder::default();
        let mut ctrl = controller(&recorder, settings());
        ctrl.on_connected();
        assert!(ctrl
            .handle_reply(Step::AddOnion, &reply(250, &["ServiceID=abc", "OK"]))
            .is_none());
        assert_eq!(ctrl.state(), ControllerState::AwaitingProtocolInfo);
        assert!(recorder.calls().is_empty());
    }

    #[test]
    fn test_redacted_lines() {
        let text = redacted_lines(&reply(250, &["PrivateKey=secret", "Weird\x1bLine"]));
        assert_eq!(text, "PrivateKey=[REDACTED] | WeirdLine");
    }
}
