//! SDES crypto negotiation (RFC 4568)
//!
//! Matches the peer's `a=crypto` attributes against the locally supported
//! suites. The remote list is scanned in received order and, for each
//! attribute, the local capability list in preference order; the first pair
//! whose suite names are equal wins.

use super::crypto::{CryptoSuiteDefinition, MasterKey};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SdesError {
    #[error("Malformed crypto attribute: {0}")]
    MalformedAttribute(String),

    #[error("Unsupported key method: {0}")]
    UnsupportedKeyMethod(String),
}

/// One parsed `a=crypto` attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoAttribute {
    pub tag: String,
    pub crypto_suite: String,
    pub key_method: String,
    /// Base64 `key||salt`
    pub key_info: String,
    pub lifetime: Option<String>,
    pub mki_value: Option<String>,
    pub mki_length: Option<String>,
    pub session_params: Vec<String>,
}

impl CryptoAttribute {
    /// Parse `[a=crypto:]tag suite method:key||salt[|lifetime][|mki:len] [session-params]`
    pub fn parse(line: &str) -> Result<Self, SdesError> {
        let line = line.trim();
        let value = line.strip_prefix("a=crypto:").unwrap_or(line);

        let mut tokens = value.split_whitespace();
        let (tag, suite, key_params) = match (tokens.next(), tokens.next(), tokens.next()) {
            (Some(tag), Some(suite), Some(key_params)) => (tag, suite, key_params),
            _ => return Err(SdesError::MalformedAttribute(value.to_string())),
        };

        if tag.is_empty() || tag.len() > 9 || !tag.chars().all(|c| c.is_ascii_digit()) {
            return Err(SdesError::MalformedAttribute(format!("invalid tag '{}'", tag)));
        }
        if !suite
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(SdesError::MalformedAttribute(format!("invalid suite '{}'", suite)));
        }

        // Only the first key parameter is used when several are given
        let first_key = key_params.split(';').next().unwrap_or(key_params);
        let (method, info) = first_key
            .split_once(':')
            .ok_or_else(|| SdesError::MalformedAttribute(format!("missing key method in '{}'", first_key)))?;
        if method != "inline" {
            return Err(SdesError::UnsupportedKeyMethod(method.to_string()));
        }

        let mut parts = info.split('|');
        let key_info = parts.next().unwrap_or_default().to_string();
        if key_info.is_empty()
            || !key_info
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=')
        {
            return Err(SdesError::MalformedAttribute(format!("invalid key '{}'", key_info)));
        }

        let mut lifetime = None;
        let mut mki_value = None;
        let mut mki_length = None;
        for part in parts {
            match part.split_once(':') {
                Some((value, length)) => {
                    mki_value = Some(value.to_string());
                    mki_length = Some(length.to_string());
                }
                None => lifetime = Some(part.to_string()),
            }
        }

        Ok(Self {
            tag: tag.to_string(),
            crypto_suite: suite.to_string(),
            key_method: method.to_string(),
            key_info,
            lifetime,
            mki_value,
            mki_length,
            session_params: tokens.map(str::to_string).collect(),
        })
    }
}

/// Outcome of a successful negotiation, handed to the media subsystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedCrypto {
    pub tag: String,
    pub suite: CryptoSuiteDefinition,
    pub key_method: String,
    pub key_info: String,
    pub lifetime: Option<String>,
    pub mki_value: Option<String>,
    pub mki_length: Option<String>,
    pub auth_tag_length: u32,
}

impl NegotiatedCrypto {
    /// Remote master key, when the inline key decodes for the suite
    pub fn master_key(&self) -> Option<MasterKey> {
        MasterKey::from_inline(&self.key_info, &self.suite)
    }
}

/// Single-shot SDES negotiator. A re-INVITE gets a fresh instance.
pub struct SdesNegotiator {
    local_capabilities: Vec<CryptoSuiteDefinition>,
    remote_attributes: Vec<String>,
    negotiated: Option<NegotiatedCrypto>,
}

impl SdesNegotiator {
    pub fn new(local_capabilities: Vec<CryptoSuiteDefinition>, remote_attributes: Vec<String>) -> Self {
        Self {
            local_capabilities,
            remote_attributes,
            negotiated: None,
        }
    }

    /// Parse the remote attributes. Malformed lines are logged and skipped
    /// without affecting the others.
    pub fn parse(&self) -> Vec<CryptoAttribute> {
        self.remote_attributes
            .iter()
            .filter_map(|line| match CryptoAttribute::parse(line) {
                Ok(attribute) => Some(attribute),
                Err(e) => {
                    warn!("Ignoring crypto attribute: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Select the first compatible suite. Returns false when the offer is
    /// empty or nothing matches.
    pub fn negotiate(&mut self) -> bool {
        for attribute in self.parse() {
            let matched = self
                .local_capabilities
                .iter()
                .find(|local| local.name == attribute.crypto_suite);

            if let Some(local) = matched {
                debug!(suite = local.name, tag = %attribute.tag, "SDES suite selected");
                self.negotiated = Some(NegotiatedCrypto {
                    tag: attribute.tag,
                    suite: *local,
                    key_method: attribute.key_method,
                    key_info: attribute.key_info,
                    lifetime: attribute.lifetime,
                    mki_value: attribute.mki_value,
                    mki_length: attribute.mki_length,
                    auth_tag_length: local.srtp_auth_tag_length,
                });
                return true;
            }
        }
        false
    }

    pub fn negotiated(&self) -> Option<&NegotiatedCrypto> {
        self.negotiated.as_ref()
    }

    pub fn into_negotiated(self) -> Option<NegotiatedCrypto> {
        self.negotiated
    }

    pub fn crypto_suite(&self) -> Option<&str> {
        self.negotiated.as_ref().map(|n| n.suite.name)
    }

    pub fn key_method(&self) -> Option<&str> {
        self.negotiated.as_ref().map(|n| n.key_method.as_str())
    }

    pub fn key_info(&self) -> Option<&str> {
        self.negotiated.as_ref().map(|n| n.key_info.as_str())
    }

    pub fn lifetime(&self) -> Option<&str> {
        self.negotiated.as_ref().and_then(|n| n.lifetime.as_deref())
    }

    pub fn mki_value(&self) -> Option<&str> {
        self.negotiated.as_ref().and_then(|n| n.mki_value.as_deref())
    }

    pub fn mki_length(&self) -> Option<&str> {
        self.negotiated.as_ref().and_then(|n| n.mki_length.as_deref())
    }

    pub fn auth_tag_length(&self) -> Option<u32> {
        self.negotiated.as_ref().map(|n| n.auth_tag_length)
    }
}
