/// TLS client configuration for SIP signalling
pub mod config;

pub use self::config::{TlsConfig, TlsError};
