//! Account entity

use crate::domain::account::value_object::{
    DtmfMode, RegistrationState, SrtpPolicy, TransportKind, VideoCodecSetting, ZrtpPolicy,
};
use crate::domain::shared::value_objects::{strip_sip_scheme, AccountId};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Lowest expiry a registrar is asked for, in seconds
pub const MIN_REGISTRATION_TIME: u32 = 60;
/// Expiry used when none is configured, in seconds
pub const DEFAULT_REGISTRATION_TIME: u32 = 3600;

/// Digest credentials used for REGISTER and INVITE challenges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// `*` answers any realm
    pub realm: String,
}

impl Credentials {
    pub fn matches_realm(&self, realm: &str) -> bool {
        self.realm == "*" || self.realm.eq_ignore_ascii_case(realm)
    }
}

/// A SIP identity: registration parameters, media policy and codec preferences.
///
/// Configuration fields are public; registration bookkeeping is only changed
/// through the registration methods so the upper layer observes consistent
/// state snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub alias: String,
    pub username: String,
    pub hostname: String,
    pub credentials: Vec<Credentials>,
    pub enabled: bool,
    pub transport: TransportKind,
    /// Interface address the signalling socket binds to; "default" picks the
    /// address of the outgoing route.
    pub local_interface: String,
    pub local_port: u16,
    pub published_same_as_local: bool,
    pub published_address: Option<String>,
    pub published_port: Option<u16>,
    pub stun_server: Option<String>,
    pub registration_expire: u32,
    pub keep_alive: bool,
    pub dtmf_type: String,
    pub srtp: SrtpPolicy,
    pub zrtp: ZrtpPolicy,
    /// Ordered audio payload types
    pub audio_codecs: Vec<u8>,
    pub video_codecs: Vec<VideoCodecSetting>,
    pub service_route: Option<String>,
    pub user_agent: String,
    registration_state: RegistrationState,
    registration_status: Option<(u16, String)>,
    received: Option<String>,
    rport: Option<u16>,
}

impl Account {
    pub fn new(id: AccountId, username: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            id,
            alias: String::new(),
            username: username.into(),
            hostname: hostname.into(),
            credentials: Vec::new(),
            enabled: true,
            transport: TransportKind::Udp,
            local_interface: "default".to_string(),
            local_port: TransportKind::Udp.default_port(),
            published_same_as_local: true,
            published_address: None,
            published_port: None,
            stun_server: None,
            registration_expire: DEFAULT_REGISTRATION_TIME,
            keep_alive: true,
            dtmf_type: "overrtp".to_string(),
            srtp: SrtpPolicy::default(),
            zrtp: ZrtpPolicy::default(),
            audio_codecs: vec![0, 8, 9],
            video_codecs: Vec::new(),
            service_route: None,
            user_agent: format!("voiplink/{}", env!("CARGO_PKG_VERSION")),
            registration_state: RegistrationState::Unregistered,
            registration_status: None,
            received: None,
            rport: None,
        }
    }

    /// The built-in account owning direct IP-to-IP calls. It never registers.
    pub fn ip2ip(local_port: u16) -> Self {
        let mut account = Self::new(AccountId::ip2ip(), "", "");
        account.alias = AccountId::IP2IP.to_string();
        account.local_port = local_port;
        account
    }

    pub fn is_ip2ip(&self) -> bool {
        self.id.is_ip2ip()
    }

    fn scheme(&self) -> &'static str {
        if self.transport.is_secure() {
            "sips:"
        } else {
            "sip:"
        }
    }

    /// DTMF delivery mode; an unrecognized setting falls back to SIP INFO.
    pub fn dtmf_mode(&self) -> DtmfMode {
        DtmfMode::parse(&self.dtmf_type).unwrap_or_else(|| {
            warn!(
                account = %self.id,
                dtmf_type = %self.dtmf_type,
                "Unknown DTMF type, falling back to SIP INFO"
            );
            DtmfMode::SipInfo
        })
    }

    /// Expiry requested from the registrar, never below the minimum
    pub fn registration_expire(&self) -> u32 {
        if self.registration_expire == 0 {
            DEFAULT_REGISTRATION_TIME
        } else {
            self.registration_expire.max(MIN_REGISTRATION_TIME)
        }
    }

    /// `<sip:user@host>`; IP2IP calls use the local address as host.
    pub fn from_uri(&self, local_host: &str) -> String {
        let host = if self.hostname.is_empty() {
            local_host
        } else {
            self.hostname.as_str()
        };
        if self.username.is_empty() {
            format!("<{}{}>", self.scheme(), host)
        } else {
            format!("<{}{}@{}>", self.scheme(), self.username, host)
        }
    }

    /// Builds the To URI for a dial string. Targets without a host are
    /// completed with the account hostname.
    pub fn to_uri(&self, target: &str) -> String {
        let stripped = strip_sip_scheme(target);
        let scheme = if target.trim().trim_start_matches('<').starts_with("sips:") {
            "sips:"
        } else {
            self.scheme()
        };

        if stripped.contains('@') || self.hostname.is_empty() {
            format!("<{}{}>", scheme, stripped)
        } else {
            format!("<{}{}@{}>", scheme, stripped, self.hostname)
        }
    }

    /// Registrar URI, `<sip:host>`
    pub fn server_uri(&self) -> String {
        format!("<{}{}>", self.scheme(), self.hostname)
    }

    /// Contact header value for the given externally visible address.
    pub fn contact(&self, address: &str, port: u16) -> String {
        let transport = if self.transport.is_secure() {
            ";transport=tls"
        } else {
            ""
        };
        if self.username.is_empty() {
            format!("<{}{}:{}{}>", self.scheme(), address, port, transport)
        } else {
            format!(
                "<{}{}@{}:{}{}>",
                self.scheme(),
                self.username,
                address,
                port,
                transport
            )
        }
    }

    /// Address advertised in Contact/Via: what the registrar reported back,
    /// then a published address, then the local one.
    pub fn contact_address(&self, local_address: &str, local_port: u16) -> (String, u16) {
        if let Some(received) = &self.received {
            return (received.clone(), self.rport.unwrap_or(local_port));
        }
        if !self.published_same_as_local {
            if let Some(published) = &self.published_address {
                return (published.clone(), self.published_port.unwrap_or(local_port));
            }
        }
        (local_address.to_string(), local_port)
    }

    /// Both the user and the server match
    pub fn full_match(&self, user: &str, host: &str) -> bool {
        self.user_match(user) && self.hostname_match(host)
    }

    pub fn user_match(&self, user: &str) -> bool {
        !user.is_empty() && self.username == user
    }

    pub fn hostname_match(&self, host: &str) -> bool {
        !self.hostname.is_empty() && self.hostname.eq_ignore_ascii_case(host)
    }

    /// Credentials answering a challenge for `realm`
    pub fn credentials_for(&self, realm: &str) -> Option<&Credentials> {
        self.credentials.iter().find(|c| c.matches_realm(realm))
    }

    pub fn registration_state(&self) -> RegistrationState {
        self.registration_state
    }

    pub fn registration_status(&self) -> Option<&(u16, String)> {
        self.registration_status.as_ref()
    }

    pub fn set_registration_state(&mut self, state: RegistrationState, status: Option<(u16, String)>) {
        self.registration_state = state;
        self.registration_status = status;
    }

    /// Remember the Via `received`/`rport` a registrar reported.
    pub fn set_received(&mut self, received: Option<String>, rport: Option<u16>) {
        if received.is_some() {
            self.received = received;
        }
        if rport.is_some() {
            self.rport = rport;
        }
    }

    pub fn received(&self) -> Option<&str> {
        self.received.as_deref()
    }

    pub fn rport(&self) -> Option<u16> {
        self.rport
    }

    /// Registration refresh is pointless for TLS (connection-oriented) and IP2IP.
    pub fn needs_keep_alive(&self) -> bool {
        self.keep_alive && !self.is_ip2ip() && self.transport != TransportKind::Tls
    }

    /// Enabled video codec names, in preference order
    pub fn active_video_codecs(&self) -> Vec<&VideoCodecSetting> {
        self.video_codecs.iter().filter(|c| c.enabled).collect()
    }
}
