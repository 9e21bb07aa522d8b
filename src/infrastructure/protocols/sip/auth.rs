//! SIP Digest Authentication, client side (RFC 2617, RFC 3261)

use super::message::{header_value, HeaderAccess, SipError, SipResponse};
use crate::domain::account::Credentials;
use rand::Rng;
use std::collections::HashMap;
use tracing::debug;

/// Challenge from a `WWW-Authenticate` or `Proxy-Authenticate` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: String,
    pub qop: Option<String>,
    pub opaque: Option<String>,
    /// Answer goes into `Proxy-Authorization`
    pub proxy: bool,
}

impl DigestChallenge {
    /// Parse the challenge carried by a 401/407 response
    pub fn from_response(response: &SipResponse) -> Result<Self, SipError> {
        let (value, proxy) = match header_value(response.headers(), "WWW-Authenticate") {
            Some(value) => (value, false),
            None => header_value(response.headers(), "Proxy-Authenticate")
                .map(|v| (v, true))
                .ok_or_else(|| {
                    SipError::Authentication("No authentication challenge found".to_string())
                })?,
        };
        Self::parse(&value, proxy)
    }

    pub fn parse(value: &str, proxy: bool) -> Result<Self, SipError> {
        let params = parse_digest_params(value);
        let realm = params
            .get("realm")
            .ok_or_else(|| SipError::Authentication("Missing realm in challenge".to_string()))?;
        let nonce = params
            .get("nonce")
            .ok_or_else(|| SipError::Authentication("Missing nonce in challenge".to_string()))?;

        // Only "auth" is supported; "auth-int" bodies are not hashed
        let qop = params.get("qop").and_then(|q| {
            q.split(',')
                .map(str::trim)
                .find(|q| q.eq_ignore_ascii_case("auth"))
                .map(str::to_string)
        });

        Ok(Self {
            realm: realm.clone(),
            nonce: nonce.clone(),
            algorithm: params
                .get("algorithm")
                .cloned()
                .unwrap_or_else(|| "MD5".to_string()),
            qop,
            opaque: params.get("opaque").cloned(),
            proxy,
        })
    }

    /// Name of the header the answer goes in
    pub fn answer_header(&self) -> &'static str {
        if self.proxy {
            "Proxy-Authorization"
        } else {
            "Authorization"
        }
    }

    /// Build the `Authorization` value for `method` on `uri`
    pub fn authorize(&self, credentials: &Credentials, method: &str, uri: &str, nc: u32) -> String {
        let cnonce = self.qop.as_ref().map(|_| generate_cnonce());
        let nc_value = format!("{:08x}", nc);
        let response = calculate_response(
            &credentials.username,
            &credentials.password,
            &self.realm,
            &self.nonce,
            method,
            uri,
            self.qop.as_deref(),
            Some(&nc_value),
            cnonce.as_deref(),
        );

        let mut value = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm={}"#,
            credentials.username, self.realm, self.nonce, uri, response, self.algorithm
        );
        if let (Some(qop), Some(cnonce)) = (&self.qop, &cnonce) {
            value.push_str(&format!(r#", qop={}, nc={}, cnonce="{}""#, qop, nc_value, cnonce));
        }
        if let Some(opaque) = &self.opaque {
            value.push_str(&format!(r#", opaque="{}""#, opaque));
        }
        debug!(realm = %self.realm, method, "Built digest answer");
        value
    }
}

/// Parse `Digest k="v", k=v` parameters
fn parse_digest_params(value: &str) -> HashMap<String, String> {
    let digest = value
        .trim()
        .strip_prefix("Digest")
        .unwrap_or(value)
        .trim();

    let mut params = HashMap::new();
    let mut rest = digest;
    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();
        let after = after.trim_start();
        let (val, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            }
        };
        params.insert(key, val.trim().to_string());
        rest = remaining.trim_start().trim_start_matches(',');
    }
    params
}

fn generate_cnonce() -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: Vec<u8> = (0..8).map(|_| rng.gen()).collect();
    hex::encode(random_bytes)
}

/// Calculate digest response
#[allow(clippy::too_many_arguments)]
pub fn calculate_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<&str>,
    nc: Option<&str>,
    cnonce: Option<&str>,
) -> String {
    // HA1 = MD5(username:realm:password)
    let ha1 = format!("{:x}", md5::compute(format!("{}:{}:{}", username, realm, password)));

    // HA2 = MD5(method:uri)
    let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));

    match qop {
        Some(qop_value) => {
            let nc_value = nc.unwrap_or("00000001");
            let cnonce_value = cnonce.unwrap_or("");
            format!(
                "{:x}",
                md5::compute(format!(
                    "{}:{}:{}:{}:{}:{}",
                    ha1, nonce, nc_value, cnonce_value, qop_value, ha2
                ))
            )
        }
        None => format!("{:x}", md5::compute(format!("{}:{}:{}", ha1, nonce, ha2))),
    }
}
