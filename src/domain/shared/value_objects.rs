//! Shared value objects used across multiple bounded contexts

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use uuid::Uuid;

/// Call identifier, local to this user agent (not the SIP Call-ID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Account identifier as configured by the user
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Identifier of the built-in direct IP-to-IP account
    pub const IP2IP: &'static str = "IP2IP";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn ip2ip() -> Self {
        Self(Self::IP2IP.to_string())
    }

    pub fn is_ip2ip(&self) -> bool {
        self.0 == Self::IP2IP
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SIP URI value object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SipUri {
    secure: bool,
    user: Option<String>,
    host: String,
    port: Option<u16>,
    params: Option<String>,
}

impl SipUri {
    pub fn new(user: Option<String>, host: String, port: Option<u16>) -> Self {
        Self {
            secure: false,
            user,
            host,
            port,
            params: None,
        }
    }

    /// Parse `sip:` / `sips:` URIs, optionally wrapped in angle brackets
    /// with a display name in front.
    pub fn parse(uri: &str) -> Result<Self, String> {
        let mut uri = uri.trim();
        if let (Some(start), Some(end)) = (uri.find('<'), uri.rfind('>')) {
            if start < end {
                uri = &uri[start + 1..end];
            }
        }

        let (secure, rest) = if let Some(rest) = uri.strip_prefix("sips:") {
            (true, rest)
        } else if let Some(rest) = uri.strip_prefix("sip:") {
            (false, rest)
        } else {
            return Err("URI must start with 'sip:' or 'sips:'".to_string());
        };

        let (address, params) = match rest.split_once(|c| c == ';' || c == '?') {
            Some((address, _)) => (address, Some(rest[address.len()..].to_string())),
            None => (rest, None),
        };

        let (user, host_port) = match address.rsplit_once('@') {
            Some((user, host_port)) => (Some(user.to_string()), host_port),
            None => (None, address),
        };

        let (host, port) = split_host_port(host_port)?;
        if host.is_empty() {
            return Err("Invalid SIP URI format: empty host".to_string());
        }

        Ok(Self {
            secure,
            user,
            host,
            port,
            params,
        })
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn params(&self) -> Option<&str> {
        self.params.as_deref()
    }

    /// Host and port without user part, as used for request routing
    pub fn host_port(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "sips" } else { "sip" };
        write!(f, "{}:", scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if let Some(params) = &self.params {
            write!(f, "{}", params)?;
        }
        Ok(())
    }
}

fn split_host_port(host_port: &str) -> Result<(String, Option<u16>), String> {
    // IPv6 reference: [::1]:5060
    if let Some(rest) = host_port.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| "Unterminated IPv6 reference".to_string())?;
        let port = match tail.strip_prefix(':') {
            Some(port) => Some(port.parse().map_err(|_| format!("Invalid port: {}", port))?),
            None => None,
        };
        return Ok((host.to_string(), port));
    }

    match host_port.split_once(':') {
        Some((host, port)) => {
            let port = port.parse().map_err(|_| format!("Invalid port: {}", port))?;
            Ok((host.to_string(), Some(port)))
        }
        None => Ok((host_port.to_string(), None)),
    }
}

/// Remove a leading `sip:`/`sips:` scheme and surrounding angle brackets.
pub fn strip_sip_scheme(target: &str) -> &str {
    let target = target.trim().trim_start_matches('<').trim_end_matches('>');
    target
        .strip_prefix("sips:")
        .or_else(|| target.strip_prefix("sip:"))
        .unwrap_or(target)
}

/// Returns the IP address when a dial string designates a peer directly by
/// address (`192.168.1.10`, `sip:10.0.0.2:5062`, `bob@10.0.0.2`).
pub fn direct_ip_target(target: &str) -> Option<IpAddr> {
    let stripped = strip_sip_scheme(target);
    let address = stripped.split(';').next().unwrap_or(stripped);
    let host_port = address.rsplit_once('@').map(|(_, h)| h).unwrap_or(address);

    if let Ok(ip) = host_port.parse::<IpAddr>() {
        return Some(ip);
    }
    split_host_port(host_port)
        .ok()
        .and_then(|(host, _)| host.parse::<IpAddr>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sip_uri_parse() {
        let uri = SipUri::parse("sip:alice@example.com").unwrap();
        assert_eq!(uri.user(), Some("alice"));
        assert_eq!(uri.host(), "example.com");
        assert_eq!(uri.port(), None);

        let uri_with_port = SipUri::parse("<sips:bob@example.com:5061;transport=tls>").unwrap();
        assert!(uri_with_port.is_secure());
        assert_eq!(uri_with_port.user(), Some("bob"));
        assert_eq!(uri_with_port.port(), Some(5061));
        assert_eq!(uri_with_port.params(), Some(";transport=tls"));
    }

    #[test]
    fn test_sip_uri_without_user() {
        let uri = SipUri::parse("sip:10.0.0.1:5070").unwrap();
        assert_eq!(uri.user(), None);
        assert_eq!(uri.host_port(), "10.0.0.1:5070");
        assert_eq!(uri.to_string(), "sip:10.0.0.1:5070");
    }

    #[test]
    fn test_sip_uri_rejects_other_schemes() {
        assert!(SipUri::parse("tel:+15551234").is_err());
        assert!(SipUri::parse("sip:alice@host:notaport").is_err());
    }

    #[test]
    fn test_sip_uri_display() {
        let uri = SipUri::new(Some("alice".to_string()), "example.com".to_string(), None);
        assert_eq!(uri.to_string(), "sip:alice@example.com");

        let secure = SipUri::new(Some("bob".to_string()), "example.com".to_string(), Some(5061))
            .with_secure(true);
        assert_eq!(secure.to_string(), "sips:bob@example.com:5061");
    }

    #[test]
    fn test_direct_ip_target() {
        assert!(direct_ip_target("192.168.1.10").is_some());
        assert!(direct_ip_target("sip:192.168.1.10:5062").is_some());
        assert!(direct_ip_target("bob@10.0.0.2").is_some());
        assert!(direct_ip_target("alice@example.com").is_none());
        assert!(direct_ip_target("1234").is_none());
    }

    #[test]
    fn test_account_id_ip2ip() {
        assert!(AccountId::ip2ip().is_ip2ip());
        assert!(!AccountId::new("Account:1").is_ip2ip());
    }
}
