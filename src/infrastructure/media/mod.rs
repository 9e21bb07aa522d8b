//! Media-side collaborators of the signalling core

pub mod codec;
pub mod dtmf;
pub mod rtp;
pub mod srtp;

pub use codec::{AudioCodec, CodecRegistry, VideoCodec};
pub use dtmf::DtmfDigit;
pub use rtp::{MediaError, MediaFactory, MediaPortAllocator, RecordingMediaFactory, RtpSession, VideoSession, ZrtpEvent};
pub use srtp::{CryptoSuiteDefinition, LocalCryptoOffer, NegotiatedCrypto, SdesNegotiator, CRYPTO_SUITES};
