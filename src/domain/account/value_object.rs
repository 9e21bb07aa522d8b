//! Account value objects

use serde::{Deserialize, Serialize};
use std::fmt;

/// Signalling transport selected for an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Udp,
    Tls,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tls => "TLS",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            TransportKind::Udp => 5060,
            TransportKind::Tls => 5061,
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, TransportKind::Tls)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How DTMF digits leave the user agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DtmfMode {
    /// RFC 4733 named telephone events inside the RTP stream
    OverRtp,
    /// Out-of-band SIP INFO with an `application/dtmf-relay` body
    SipInfo,
}

impl DtmfMode {
    /// Parses the configured DTMF type; `None` for anything unrecognized.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "overrtp" | "rtp" => Some(DtmfMode::OverRtp),
            "sipinfo" | "info" => Some(DtmfMode::SipInfo),
            _ => None,
        }
    }
}

/// SRTP key exchange mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyExchange {
    #[default]
    Sdes,
    Zrtp,
}

/// Per-account SRTP policy
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SrtpPolicy {
    pub enabled: bool,
    pub key_exchange: KeyExchange,
    /// Restart media unencrypted when SDES negotiation fails
    pub rtp_fallback: bool,
}

impl SrtpPolicy {
    pub fn sdes_enabled(&self) -> bool {
        self.enabled && self.key_exchange == KeyExchange::Sdes
    }

    pub fn zrtp_enabled(&self) -> bool {
        self.enabled && self.key_exchange == KeyExchange::Zrtp
    }
}

/// Per-account ZRTP display preferences
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZrtpPolicy {
    pub display_sas: bool,
    pub display_sas_once: bool,
    pub hello_hash: bool,
    pub not_supp_warning: bool,
}

impl Default for ZrtpPolicy {
    fn default() -> Self {
        Self {
            display_sas: true,
            display_sas_once: false,
            hello_hash: true,
            not_supp_warning: true,
        }
    }
}

/// Video codec preference entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoCodecSetting {
    pub name: String,
    #[serde(default = "default_video_bitrate")]
    pub bitrate: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_video_bitrate() -> u32 {
    400
}

fn default_true() -> bool {
    true
}

/// Why a registration attempt ended in error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationError {
    Auth,
    Host,
    Network,
    Generic,
    NotAcceptable,
    ExistStun,
}

/// Registration state as surfaced to the upper layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RegistrationState {
    #[default]
    Unregistered,
    Trying,
    Registered,
    Error(RegistrationError),
}

impl RegistrationState {
    pub fn label(&self) -> &'static str {
        match self {
            RegistrationState::Unregistered => "UNREGISTERED",
            RegistrationState::Trying => "TRYING",
            RegistrationState::Registered => "REGISTERED",
            RegistrationState::Error(RegistrationError::Auth) => "ERROR_AUTH",
            RegistrationState::Error(RegistrationError::Host) => "ERROR_HOST",
            RegistrationState::Error(RegistrationError::Network) => "ERROR_NETWORK",
            RegistrationState::Error(RegistrationError::Generic) => "ERROR_GENERIC",
            RegistrationState::Error(RegistrationError::NotAcceptable) => "ERROR_NOT_ACCEPTABLE",
            RegistrationState::Error(RegistrationError::ExistStun) => "ERROR_EXIST_STUN",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RegistrationState::Error(_))
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtmf_mode_parse() {
        assert_eq!(DtmfMode::parse("overrtp"), Some(DtmfMode::OverRtp));
        assert_eq!(DtmfMode::parse("SIPINFO"), Some(DtmfMode::SipInfo));
        assert_eq!(DtmfMode::parse("inband"), None);
    }

    #[test]
    fn test_srtp_policy() {
        let policy = SrtpPolicy {
            enabled: true,
            key_exchange: KeyExchange::Sdes,
            rtp_fallback: false,
        };
        assert!(policy.sdes_enabled());
        assert!(!policy.zrtp_enabled());
        assert!(!SrtpPolicy::default().sdes_enabled());
    }

    #[test]
    fn test_registration_state_labels() {
        assert_eq!(RegistrationState::Registered.to_string(), "REGISTERED");
        assert_eq!(
            RegistrationState::Error(RegistrationError::NotAcceptable).label(),
            "ERROR_NOT_ACCEPTABLE"
        );
        assert!(RegistrationState::Error(RegistrationError::Host).is_error());
    }
}
