//! SRTP crypto suite definitions and master key material (RFC 4568, RFC 3711)

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use std::fmt;

/// Cipher used for SRTP payload encryption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    AesCounterMode,
    AesF8Mode,
}

/// Message authentication algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacMode {
    HmacSha1,
}

/// Static description of an SDES crypto suite. Lengths are in bits,
/// lifetimes are powers of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoSuiteDefinition {
    pub name: &'static str,
    pub master_key_length: u32,
    pub master_salt_length: u32,
    pub srtp_lifetime: u32,
    pub srtcp_lifetime: u32,
    pub cipher: CipherMode,
    pub encryption_key_length: u32,
    pub mac: MacMode,
    pub srtp_auth_tag_length: u32,
    pub srtcp_auth_tag_length: u32,
    pub srtp_auth_key_length: u32,
    pub srtcp_auth_key_length: u32,
}

impl CryptoSuiteDefinition {
    /// Master key length in bytes
    pub fn key_bytes(&self) -> usize {
        (self.master_key_length / 8) as usize
    }

    /// Master salt length in bytes
    pub fn salt_bytes(&self) -> usize {
        (self.master_salt_length / 8) as usize
    }
}

impl fmt::Display for CryptoSuiteDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Suites supported locally, in preference order
pub const CRYPTO_SUITES: [CryptoSuiteDefinition; 3] = [
    CryptoSuiteDefinition {
        name: "AES_CM_128_HMAC_SHA1_80",
        master_key_length: 128,
        master_salt_length: 112,
        srtp_lifetime: 48,
        srtcp_lifetime: 31,
        cipher: CipherMode::AesCounterMode,
        encryption_key_length: 128,
        mac: MacMode::HmacSha1,
        srtp_auth_tag_length: 80,
        srtcp_auth_tag_length: 80,
        srtp_auth_key_length: 160,
        srtcp_auth_key_length: 160,
    },
    CryptoSuiteDefinition {
        name: "AES_CM_128_HMAC_SHA1_32",
        master_key_length: 128,
        master_salt_length: 112,
        srtp_lifetime: 48,
        srtcp_lifetime: 31,
        cipher: CipherMode::AesCounterMode,
        encryption_key_length: 128,
        mac: MacMode::HmacSha1,
        srtp_auth_tag_length: 32,
        srtcp_auth_tag_length: 80,
        srtp_auth_key_length: 160,
        srtcp_auth_key_length: 160,
    },
    CryptoSuiteDefinition {
        name: "F8_128_HMAC_SHA1_80",
        master_key_length: 128,
        master_salt_length: 112,
        srtp_lifetime: 48,
        srtcp_lifetime: 31,
        cipher: CipherMode::AesF8Mode,
        encryption_key_length: 128,
        mac: MacMode::HmacSha1,
        srtp_auth_tag_length: 80,
        srtcp_auth_tag_length: 80,
        srtp_auth_key_length: 160,
        srtcp_auth_key_length: 160,
    },
];

/// Look up a locally supported suite by its exact name
pub fn find_suite(name: &str) -> Option<&'static CryptoSuiteDefinition> {
    CRYPTO_SUITES.iter().find(|s| s.name == name)
}

/// SRTP master key material
#[derive(Clone, PartialEq, Eq)]
pub struct MasterKey {
    pub key: Vec<u8>,
    pub salt: Vec<u8>,
}

impl MasterKey {
    /// Generate random master key for suite
    pub fn generate(suite: &CryptoSuiteDefinition) -> Self {
        let mut rng = rand::thread_rng();
        let mut key = vec![0u8; suite.key_bytes()];
        let mut salt = vec![0u8; suite.salt_bytes()];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut salt);
        Self { key, salt }
    }

    /// Decode the base64 `key||salt` of an `inline:` key parameter
    pub fn from_inline(encoded: &str, suite: &CryptoSuiteDefinition) -> Option<Self> {
        let raw = BASE64.decode(encoded).ok()?;
        if raw.len() != suite.key_bytes() + suite.salt_bytes() {
            return None;
        }
        let (key, salt) = raw.split_at(suite.key_bytes());
        Some(Self {
            key: key.to_vec(),
            salt: salt.to_vec(),
        })
    }

    /// Base64 of `key||salt`
    pub fn to_inline(&self) -> String {
        let mut raw = Vec::with_capacity(self.key.len() + self.salt.len());
        raw.extend_from_slice(&self.key);
        raw.extend_from_slice(&self.salt);
        BASE64.encode(raw)
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("key_len", &self.key.len())
            .field("salt_len", &self.salt.len())
            .finish()
    }
}

/// Locally generated SDES offer: one fresh key per supported suite
#[derive(Debug, Clone)]
pub struct LocalCryptoOffer {
    entries: Vec<(u32, &'static CryptoSuiteDefinition, MasterKey)>,
}

impl LocalCryptoOffer {
    pub fn generate() -> Self {
        let entries = CRYPTO_SUITES
            .iter()
            .enumerate()
            .map(|(i, suite)| (i as u32 + 1, suite, MasterKey::generate(suite)))
            .collect();
        Self { entries }
    }

    /// `a=crypto` attribute values, without the `a=crypto:` prefix
    pub fn attribute_values(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(tag, suite, key)| format!("{} {} inline:{}", tag, suite.name, key.to_inline()))
            .collect()
    }

    /// Key for the suite the peer selected
    pub fn key_for(&self, suite_name: &str) -> Option<&MasterKey> {
        self.entries
            .iter()
            .find(|(_, suite, _)| suite.name == suite_name)
            .map(|(_, _, key)| key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suite_table() {
        let suite = find_suite("AES_CM_128_HMAC_SHA1_32").unwrap();
        assert_eq!(suite.srtp_auth_tag_length, 32);
        assert_eq!(suite.srtcp_auth_tag_length, 80);
        assert_eq!(find_suite("F8_128_HMAC_SHA1_80").unwrap().cipher, CipherMode::AesF8Mode);
        assert!(find_suite("AES_CM_128_HMAC_SHA1").is_none());
    }

    #[test]
    fn test_master_key_inline_encoding() {
        let suite = &CRYPTO_SUITES[0];
        let key = MasterKey::generate(suite);
        assert_eq!(key.key.len(), 16);
        assert_eq!(key.salt.len(), 14);

        let inline = key.to_inline();
        assert_eq!(inline.len(), 40);
        assert_eq!(MasterKey::from_inline(&inline, suite), Some(key));
        assert_eq!(MasterKey::from_inline("c2hvcnQ=", suite), None);
    }

    #[test]
    fn test_local_offer_lines() {
        let offer = LocalCryptoOffer::generate();
        let lines = offer.attribute_values();
        assert_eq!(lines.len(), CRYPTO_SUITES.len());
        assert!(lines[0].starts_with("1 AES_CM_128_HMAC_SHA1_80 inline:"));
        assert!(offer.key_for("F8_128_HMAC_SHA1_80").is_some());
    }
}
