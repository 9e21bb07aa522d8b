//! Media sessions that track and log what the signalling core asks for.
//!
//! Used by the daemon when no packet engine is attached, and by tests to
//! observe the order of media operations.

use super::session::{MediaError, MediaFactory, RtpSession, VideoSession};
use crate::domain::shared::value_objects::CallId;
use crate::infrastructure::media::codec::AudioCodec;
use crate::infrastructure::media::dtmf::DtmfDigit;
use crate::infrastructure::media::srtp::{LocalCryptoOffer, NegotiatedCrypto};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Media operation as observed by the recorder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    Initialized { call_id: CallId, local: SocketAddr },
    LocalCrypto { call_id: CallId, suites: usize },
    Started { call_id: CallId, payload_type: u8 },
    Updated { call_id: CallId, payload_type: u8 },
    Stopped { call_id: CallId },
    ContextSaved { call_id: CallId },
    ContextRestored { call_id: CallId },
    RemoteCrypto { call_id: CallId, suite: String },
    SrtpEnabled { call_id: CallId, enabled: bool },
    Destination { call_id: CallId, remote: SocketAddr },
    DtmfPayload { call_id: CallId, payload_type: u8 },
    Dtmf { call_id: CallId, digit: char },
    VideoStarted { call_id: CallId, codec: String, remote: SocketAddr },
    VideoStopped { call_id: CallId },
    KeyFrame { call_id: CallId },
}

type Sink = Option<mpsc::UnboundedSender<MediaEvent>>;

fn emit(sink: &Sink, event: MediaEvent) {
    if let Some(sink) = sink {
        // Nobody listening is fine
        let _ = sink.send(event);
    }
}

#[derive(Debug, Clone)]
struct SavedContext {
    codec: Option<AudioCodec>,
    remote_crypto: Option<NegotiatedCrypto>,
}

/// Audio session state holder
pub struct RecordingRtpSession {
    call_id: CallId,
    sink: Sink,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    codec: Option<AudioCodec>,
    running: bool,
    srtp_enabled: bool,
    remote_crypto: Option<NegotiatedCrypto>,
    saved: Option<SavedContext>,
    dtmf_payload_type: u8,
}

impl RecordingRtpSession {
    fn new(call_id: CallId, sink: Sink) -> Self {
        Self {
            call_id,
            sink,
            local: None,
            remote: None,
            codec: None,
            running: false,
            srtp_enabled: false,
            remote_crypto: None,
            saved: None,
            dtmf_payload_type: 101,
        }
    }
}

impl RtpSession for RecordingRtpSession {
    fn init_session(&mut self, local: SocketAddr) -> Result<(), MediaError> {
        debug!(call_id = %self.call_id, %local, "RTP session initialized");
        self.local = Some(local);
        emit(&self.sink, MediaEvent::Initialized { call_id: self.call_id, local });
        Ok(())
    }

    fn init_local_crypto_info(&mut self, offer: &LocalCryptoOffer) -> Result<(), MediaError> {
        self.srtp_enabled = true;
        let suites = offer.attribute_values().len();
        emit(&self.sink, MediaEvent::LocalCrypto { call_id: self.call_id, suites });
        Ok(())
    }

    fn start(&mut self, codec: &AudioCodec) -> Result<(), MediaError> {
        if self.local.is_none() {
            return Err(MediaError::Session("session not initialized".to_string()));
        }
        info!(call_id = %self.call_id, codec = %codec.name, "RTP session started");
        self.codec = Some(codec.clone());
        self.running = true;
        emit(
            &self.sink,
            MediaEvent::Started {
                call_id: self.call_id,
                payload_type: codec.payload_type,
            },
        );
        Ok(())
    }

    fn stop(&mut self) {
        if self.running {
            info!(call_id = %self.call_id, "RTP session stopped");
            self.running = false;
            emit(&self.sink, MediaEvent::Stopped { call_id: self.call_id });
        }
    }

    fn update_session_media(&mut self, codec: &AudioCodec) -> Result<(), MediaError> {
        info!(call_id = %self.call_id, codec = %codec.name, "RTP session codec changed");
        self.codec = Some(codec.clone());
        emit(
            &self.sink,
            MediaEvent::Updated {
                call_id: self.call_id,
                payload_type: codec.payload_type,
            },
        );
        Ok(())
    }

    fn session_media(&self) -> Option<u8> {
        self.codec.as_ref().map(|c| c.payload_type)
    }

    fn save_local_context(&mut self) {
        self.saved = Some(SavedContext {
            codec: self.codec.clone(),
            remote_crypto: self.remote_crypto.clone(),
        });
        emit(&self.sink, MediaEvent::ContextSaved { call_id: self.call_id });
    }

    fn restore_local_context(&mut self) {
        if let Some(saved) = self.saved.take() {
            if saved.codec.is_some() {
                self.codec = saved.codec;
            }
            self.remote_crypto = saved.remote_crypto;
            emit(&self.sink, MediaEvent::ContextRestored { call_id: self.call_id });
        }
    }

    fn set_remote_crypto_info(&mut self, crypto: &NegotiatedCrypto) -> Result<(), MediaError> {
        if crypto.master_key().is_none() {
            return Err(MediaError::Crypto(format!(
                "key does not fit suite {}",
                crypto.suite.name
            )));
        }
        self.remote_crypto = Some(crypto.clone());
        emit(
            &self.sink,
            MediaEvent::RemoteCrypto {
                call_id: self.call_id,
                suite: crypto.suite.name.to_string(),
            },
        );
        Ok(())
    }

    fn set_srtp_enabled(&mut self, enabled: bool) {
        self.srtp_enabled = enabled;
        if !enabled {
            self.remote_crypto = None;
        }
        emit(&self.sink, MediaEvent::SrtpEnabled { call_id: self.call_id, enabled });
    }

    fn is_sdes_enabled(&self) -> bool {
        self.srtp_enabled
    }

    fn update_destination(&mut self, remote: SocketAddr) {
        if self.remote != Some(remote) {
            debug!(call_id = %self.call_id, %remote, "RTP destination updated");
            self.remote = Some(remote);
            emit(&self.sink, MediaEvent::Destination { call_id: self.call_id, remote });
        }
    }

    fn set_dtmf_payload_type(&mut self, payload_type: u8) {
        self.dtmf_payload_type = payload_type;
        emit(&self.sink, MediaEvent::DtmfPayload { call_id: self.call_id, payload_type });
    }

    fn send_dtmf(&mut self, digit: DtmfDigit) -> Result<(), MediaError> {
        if !self.running {
            return Err(MediaError::Session("RTP session not running".to_string()));
        }
        debug!(
            call_id = %self.call_id,
            digit = %digit.to_char(),
            payload_type = self.dtmf_payload_type,
            "Telephone event queued"
        );
        emit(
            &self.sink,
            MediaEvent::Dtmf {
                call_id: self.call_id,
                digit: digit.to_char(),
            },
        );
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

/// Video session state holder
pub struct RecordingVideoSession {
    call_id: CallId,
    sink: Sink,
    running: bool,
}

impl VideoSession for RecordingVideoSession {
    fn start(
        &mut self,
        local_port: u16,
        remote: SocketAddr,
        codec: &str,
        payload_type: u8,
    ) -> Result<(), MediaError> {
        info!(call_id = %self.call_id, local_port, %remote, codec, payload_type, "Video session started");
        self.running = true;
        emit(
            &self.sink,
            MediaEvent::VideoStarted {
                call_id: self.call_id,
                codec: codec.to_string(),
                remote,
            },
        );
        Ok(())
    }

    fn stop(&mut self) {
        if self.running {
            self.running = false;
            emit(&self.sink, MediaEvent::VideoStopped { call_id: self.call_id });
        }
    }

    fn force_key_frame(&mut self) {
        debug!(call_id = %self.call_id, "Key frame requested");
        emit(&self.sink, MediaEvent::KeyFrame { call_id: self.call_id });
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

/// Factory for recording sessions
#[derive(Default, Clone)]
pub struct RecordingMediaFactory {
    sink: Sink,
}

impl RecordingMediaFactory {
    pub fn new() -> Self {
        Self { sink: None }
    }

    /// Factory whose sessions report every operation on the returned channel
    pub fn with_events() -> (Self, mpsc::UnboundedReceiver<MediaEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { sink: Some(tx) }, rx)
    }
}

impl MediaFactory for RecordingMediaFactory {
    fn audio_session(&self, call_id: CallId) -> Box<dyn RtpSession> {
        Box::new(RecordingRtpSession::new(call_id, self.sink.clone()))
    }

    fn video_session(&self, call_id: CallId) -> Box<dyn VideoSession> {
        Box::new(RecordingVideoSession {
            call_id,
            sink: self.sink.clone(),
            running: false,
        })
    }
}
