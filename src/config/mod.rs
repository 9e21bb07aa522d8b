//! Configuration management
//!
//! Loaded from a TOML file with `VOIPLINK__SECTION__KEY` environment
//! overrides on top, e.g. `VOIPLINK__VOIP__REJECTION_CODE=486`.

use crate::domain::account::{
    Account, Credentials, SrtpPolicy, TransportKind, VideoCodecSetting, ZrtpPolicy,
    DEFAULT_REGISTRATION_TIME,
};
use crate::domain::shared::value_objects::AccountId;
use crate::infrastructure::media::{MediaError, MediaPortAllocator};
use crate::infrastructure::protocols::sip::{EngineSettings, SipTimers};
use crate::infrastructure::tls::TlsConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "VOIPLINK";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Cannot render configuration: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("Invalid media settings: {0}")]
    Media(#[from] MediaError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sip: SipConfig,
    pub voip: VoipConfig,
    pub media: MediaConfig,
    pub tls: TlsConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub accounts: Vec<AccountConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    pub user_agent: String,
    /// Interface of the IP2IP account; "default" follows the outgoing route
    pub interface: String,
    /// Signalling port of the IP2IP account
    pub port: u16,
    pub poll_interval_ms: u64,
    pub shutdown_grace_secs: u64,
    pub t1_ms: u64,
    pub t2_ms: u64,
    pub t4_ms: u64,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("voiplink/{}", env!("CARGO_PKG_VERSION")),
            interface: "default".to_string(),
            port: 5060,
            poll_interval_ms: 10,
            shutdown_grace_secs: 5,
            t1_ms: 500,
            t2_ms: 4000,
            t4_ms: 5000,
        }
    }
}

impl SipConfig {
    pub fn timers(&self) -> SipTimers {
        SipTimers {
            t1: Duration::from_millis(self.t1_ms),
            t2: Duration::from_millis(self.t2_ms),
            t4: Duration::from_millis(self.t4_ms),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoipConfig {
    /// Length of a DTMF pulse sent over INFO
    pub dtmf_duration_ms: u32,
    /// Status sent when the user refuses an incoming call
    pub rejection_code: u16,
}

impl Default for VoipConfig {
    fn default() -> Self {
        Self {
            dtmf_duration_ms: 100,
            rejection_code: 603,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub rtp_port_min: u16,
    pub rtp_port_max: u16,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            rtp_port_min: 10500,
            rtp_port_max: 65000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus scrape endpoint; no exporter when unset
    pub listen: Option<SocketAddr>,
}

/// One `[[accounts]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    pub id: String,
    pub alias: String,
    pub username: String,
    pub hostname: String,
    /// Defaults to `username`
    pub auth_username: Option<String>,
    pub password: String,
    pub realm: String,
    pub enabled: bool,
    pub transport: TransportKind,
    pub local_interface: String,
    pub local_port: Option<u16>,
    pub published_address: Option<String>,
    pub published_port: Option<u16>,
    pub stun_server: Option<String>,
    pub registration_expire: u32,
    pub keep_alive: bool,
    pub dtmf_type: String,
    pub srtp: SrtpPolicy,
    pub zrtp: ZrtpPolicy,
    pub audio_codecs: Vec<u8>,
    pub video_codecs: Vec<VideoCodecSetting>,
    pub service_route: Option<String>,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            alias: String::new(),
            username: String::new(),
            hostname: String::new(),
            auth_username: None,
            password: String::new(),
            realm: "*".to_string(),
            enabled: true,
            transport: TransportKind::Udp,
            local_interface: "default".to_string(),
            local_port: None,
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
        }
    }
}

impl AccountConfig {
    pub fn to_account(&self, user_agent: &str) -> Account {
        let id = if self.id.is_empty() {
            format!("{}@{}", self.username, self.hostname)
        } else {
            self.id.clone()
        };
        let mut account = Account::new(AccountId::new(id), &self.username, &self.hostname);
        account.alias = self.alias.clone();
        if !self.password.is_empty() {
            account.credentials.push(Credentials {
                username: self
                    .auth_username
                    .clone()
                    .unwrap_or_else(|| self.username.clone()),
                password: self.password.clone(),
                realm: self.realm.clone(),
            });
        }
        account.enabled = self.enabled;
        account.transport = self.transport;
        account.local_interface = self.local_interface.clone();
        account.local_port = self.local_port.unwrap_or(self.transport.default_port());
        account.published_same_as_local = self.published_address.is_none();
        account.published_address = self.published_address.clone();
        account.published_port = self.published_port;
        account.stun_server = self.stun_server.clone();
        account.registration_expire = self.registration_expire;
        account.keep_alive = self.keep_alive;
        account.dtmf_type = self.dtmf_type.clone();
        account.srtp = self.srtp.clone();
        account.zrtp = self.zrtp.clone();
        account.audio_codecs = self.audio_codecs.clone();
        account.video_codecs = self.video_codecs.clone();
        account.service_route = self.service_route.clone();
        account.user_agent = user_agent.to_string();
        account
    }
}

impl Config {
    /// Defaults, then the file at `path` if any, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn engine_settings(&self) -> Result<EngineSettings, ConfigError> {
        Ok(EngineSettings {
            dtmf_duration_ms: self.voip.dtmf_duration_ms,
            rejection_code: self.voip.rejection_code,
            timers: self.sip.timers(),
            ports: MediaPortAllocator::new(self.media.rtp_port_min, self.media.rtp_port_max)?,
        })
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.accounts
            .iter()
            .map(|a| a.to_account(&self.sip.user_agent))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::KeyExchange;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sip.poll_interval(), Duration::from_millis(10));
        assert_eq!(config.sip.shutdown_grace(), Duration::from_secs(5));
        assert_eq!(config.voip.rejection_code, 603);
        assert!(config.metrics.listen.is_none());
        assert!(config.accounts.is_empty());
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml(
            r#"
[voip]
dtmf_duration_ms = 140

[metrics]
listen = "127.0.0.1:9100"

[[accounts]]
id = "work"
username = "alice"
hostname = "sip.example.com"
password = "secret"
transport = "tls"
dtmf_type = "sipinfo"

[accounts.srtp]
enabled = true
key_exchange = "sdes"
rtp_fallback = true
"#,
        )
        .unwrap();

        assert_eq!(config.voip.dtmf_duration_ms, 140);
        assert_eq!(config.voip.rejection_code, 603);
        assert_eq!(config.metrics.listen.unwrap().port(), 9100);

        let accounts = config.accounts();
        assert_eq!(accounts.len(), 1);
        let work = &accounts[0];
        assert_eq!(work.id, AccountId::new("work"));
        assert_eq!(work.transport, TransportKind::Tls);
        assert_eq!(work.local_port, 5061);
        assert_eq!(work.credentials[0].username, "alice");
        assert_eq!(work.credentials[0].realm, "*");
        assert_eq!(work.srtp.key_exchange, KeyExchange::Sdes);
        assert!(work.srtp.rtp_fallback);
        assert_eq!(work.user_agent, config.sip.user_agent);
    }

    #[test]
    fn test_engine_settings_reject_bad_port_range() {
        let mut config = Config::default();
        config.media.rtp_port_min = 20000;
        config.media.rtp_port_max = 20001;
        assert!(matches!(config.engine_settings(), Err(ConfigError::Media(_))));
    }

    #[test]
    fn test_render_round_trip() {
        let mut config = Config::default();
        config.voip.rejection_code = 486;
        let text = config.to_toml().unwrap();
        assert_eq!(Config::from_toml(&text).unwrap().voip.rejection_code, 486);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/voiplink.toml"))).unwrap();
        assert_eq!(config.sip.port, 5060);
    }
}
