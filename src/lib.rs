//! voiplink - a SIP VoIP user agent built with Rust
//!
//! Calls are driven from dial or accept through media negotiation,
//! hold/resume, transfer and teardown, with SDES-keyed SRTP and ZRTP
//! callbacks coordinated with an external RTP subsystem.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;

// Re-export commonly used types
pub use application::{LinkError, LinkResult, Signal, SipVoipLink};
pub use domain::shared::error::DomainError;
pub use domain::shared::result::Result;
