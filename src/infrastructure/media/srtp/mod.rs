//! SRTP keying: crypto suite table, master keys and SDES negotiation.
//!
//! Packet protection itself belongs to the media subsystem; this module only
//! decides which suite and keys it runs with.

pub mod crypto;
pub mod sdes;

pub use crypto::{
    find_suite, CipherMode, CryptoSuiteDefinition, LocalCryptoOffer, MacMode, MasterKey,
    CRYPTO_SUITES,
};
pub use sdes::{CryptoAttribute, NegotiatedCrypto, SdesError, SdesNegotiator};
