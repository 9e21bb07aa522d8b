//! Seams to the RTP media subsystem
//!
//! The signalling core never touches packets. It drives audio and video
//! sessions through these traits at negotiation milestones: initial offer,
//! negotiation completion, hold, resume and teardown.

use crate::domain::shared::value_objects::CallId;
use crate::infrastructure::media::codec::AudioCodec;
use crate::infrastructure::media::dtmf::DtmfDigit;
use crate::infrastructure::media::srtp::{LocalCryptoOffer, NegotiatedCrypto};
use rand::Rng;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("RTP session error: {0}")]
    Session(String),

    #[error("SRTP setup failed: {0}")]
    Crypto(String),

    #[error("Invalid media port range {0}-{1}")]
    PortRange(u16, u16),
}

/// Audio RTP session of one call
#[cfg_attr(test, mockall::automock)]
pub trait RtpSession: Send {
    /// Bind the session to the local media address
    fn init_session(&mut self, local: SocketAddr) -> Result<(), MediaError>;

    /// Keys this side offers over SDES
    fn init_local_crypto_info(&mut self, offer: &LocalCryptoOffer) -> Result<(), MediaError>;

    fn start(&mut self, codec: &AudioCodec) -> Result<(), MediaError>;

    fn stop(&mut self);

    /// Switch codec on a running session
    fn update_session_media(&mut self, codec: &AudioCodec) -> Result<(), MediaError>;

    /// Payload type currently sent, if any
    fn session_media(&self) -> Option<u8>;

    /// Remember codec and crypto state across a hold
    fn save_local_context(&mut self);

    fn restore_local_context(&mut self);

    fn set_remote_crypto_info(&mut self, crypto: &NegotiatedCrypto) -> Result<(), MediaError>;

    fn set_srtp_enabled(&mut self, enabled: bool);

    fn is_sdes_enabled(&self) -> bool;

    fn update_destination(&mut self, remote: SocketAddr);

    fn set_dtmf_payload_type(&mut self, payload_type: u8);

    /// Queue a named telephone event
    fn send_dtmf(&mut self, digit: DtmfDigit) -> Result<(), MediaError>;

    fn is_running(&self) -> bool;
}

/// Video RTP session of one call
#[cfg_attr(test, mockall::automock)]
pub trait VideoSession: Send {
    fn start(
        &mut self,
        local_port: u16,
        remote: SocketAddr,
        codec: &str,
        payload_type: u8,
    ) -> Result<(), MediaError>;

    fn stop(&mut self);

    /// Peer asked for a full picture
    fn force_key_frame(&mut self);

    fn is_running(&self) -> bool;
}

/// Key agreement progress reported by a ZRTP-capable media engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZrtpEvent {
    SecureOn { cipher: String },
    SecureOff,
    ShowSas { sas: String, verified: bool },
    NotSupported,
    NegotiationFailed { reason: String },
}

/// Creates media sessions for new calls
pub trait MediaFactory: Send + Sync {
    fn audio_session(&self, call_id: CallId) -> Box<dyn RtpSession>;

    fn video_session(&self, call_id: CallId) -> Box<dyn VideoSession>;
}

/// Random even RTP ports inside a fixed range
#[derive(Debug, Clone, Copy)]
pub struct MediaPortAllocator {
    min: u16,
    max: u16,
}

impl MediaPortAllocator {
    pub fn new(min: u16, max: u16) -> Result<Self, MediaError> {
        // Room for at least two distinct even ports
        if min >= max || max - min < 4 {
            return Err(MediaError::PortRange(min, max));
        }
        Ok(Self { min, max })
    }

    pub fn random_even_port(&self) -> u16 {
        let low = (self.min + 1) / 2;
        let high = self.max / 2;
        rand::thread_rng().gen_range(low..high) * 2
    }

    /// Audio and video ports, never equal
    pub fn allocate_pair(&self) -> (u16, u16) {
        let audio = self.random_even_port();
        let mut video = self.random_even_port();
        while video == audio {
            video = self.random_even_port();
        }
        (audio, video)
    }
}

impl Default for MediaPortAllocator {
    fn default() -> Self {
        Self {
            min: 10500,
            max: 65000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ports_are_even_and_in_range() {
        let allocator = MediaPortAllocator::new(20000, 20010).unwrap();
        for _ in 0..100 {
            let (audio, video) = allocator.allocate_pair();
            assert_eq!(audio % 2, 0);
            assert_eq!(video % 2, 0);
            assert_ne!(audio, video);
            assert!((20000..20010).contains(&audio));
            assert!((20000..20010).contains(&video));
        }
    }

    #[test]
    fn test_invalid_range() {
        assert_eq!(
            MediaPortAllocator::new(5000, 5002).unwrap_err(),
            MediaError::PortRange(5000, 5002)
        );
    }
}
