//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - Media seams towards the RTP subsystem (codecs, DTMF, SDES)
//! - Protocol implementations (SIP, SDP, STUN)
//! - TLS client configuration

pub mod media;
pub mod protocols;
pub mod tls;
