//! Per-call SDP negotiator
//!
//! Holds the local offer, the peer's description and the active pair that
//! came out of the last offer/answer round. Each round replaces the active
//! sessions wholesale.

use super::offer_answer::{apply_answer, create_answer, TELEPHONE_EVENT};
use super::session::{
    Attribute, Connection, Direction, MediaDescription, MediaKind, Origin, SdpError,
    SessionDescription,
};
use crate::infrastructure::media::codec::{
    AudioCodec, CodecRegistry, VideoCodec, FIRST_DYNAMIC_PAYLOAD, VIDEO_CLOCK_RATE,
};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info};

/// Payload number used for telephone events when the peer does not say
pub const DEFAULT_TELEPHONE_EVENT_PAYLOAD: u8 = 101;

/// Seconds between 1900 and 1970
const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// No offer yet
    Idle,
    /// Our offer is out, waiting for the answer
    LocalOffer,
    /// Peer's answer to our offer has arrived
    RemoteAnswer,
    /// Peer's offer has arrived, we answer
    RemoteOffer,
    /// Active sessions are valid for this round
    Done,
}

pub struct SdpNegotiator {
    registry: CodecRegistry,
    username: String,
    session_name: String,
    local_ip: String,
    local_audio_port: u16,
    local_video_port: u16,
    zrtp_hello_hash: Option<String>,
    local_crypto: Vec<String>,

    local_session: Option<SessionDescription>,
    remote_session: Option<SessionDescription>,
    active_local: Option<SessionDescription>,
    active_remote: Option<SessionDescription>,
    state: NegotiationState,
    round: u32,

    session_audio: Option<AudioCodec>,
    session_video: Option<String>,
    telephone_event_payload: u8,
    remote_ip: Option<String>,
    remote_audio_port: u16,
    remote_video_port: u16,
}

impl SdpNegotiator {
    pub fn new(registry: CodecRegistry, username: &str, session_name: &str, local_ip: &str) -> Self {
        Self {
            registry,
            username: username.to_string(),
            session_name: session_name.to_string(),
            local_ip: local_ip.to_string(),
            local_audio_port: 0,
            local_video_port: 0,
            zrtp_hello_hash: None,
            local_crypto: Vec::new(),
            local_session: None,
            remote_session: None,
            active_local: None,
            active_remote: None,
            state: NegotiationState::Idle,
            round: 0,
            session_audio: None,
            session_video: None,
            telephone_event_payload: DEFAULT_TELEPHONE_EVENT_PAYLOAD,
            remote_ip: None,
            remote_audio_port: 0,
            remote_video_port: 0,
        }
    }

    pub fn set_local_ip(&mut self, ip: &str) {
        self.local_ip = ip.to_string();
    }

    pub fn local_ip(&self) -> &str {
        &self.local_ip
    }

    pub fn set_local_ports(&mut self, audio: u16, video: u16) {
        self.local_audio_port = audio;
        self.local_video_port = video;
    }

    pub fn local_audio_port(&self) -> u16 {
        self.local_audio_port
    }

    pub fn local_video_port(&self) -> u16 {
        self.local_video_port
    }

    pub fn set_zrtp_hash(&mut self, hash: Option<String>) {
        self.zrtp_hello_hash = hash;
    }

    /// `a=crypto` values put on the audio line of the next offer
    pub fn set_local_crypto(&mut self, lines: Vec<String>) {
        self.local_crypto = lines;
    }

    pub fn has_local_crypto(&self) -> bool {
        !self.local_crypto.is_empty()
    }

    fn audio_media(&self, audio: &[AudioCodec]) -> MediaDescription {
        let protocol = if self.local_crypto.is_empty() {
            "RTP/AVP"
        } else {
            "RTP/SAVP"
        };
        let mut media = MediaDescription::new(MediaKind::Audio, self.local_audio_port, protocol);

        let default_codec;
        let codecs = if audio.is_empty() {
            default_codec = [self.registry.default_audio()];
            &default_codec[..]
        } else {
            audio
        };

        for codec in codecs {
            media.formats.push(codec.payload_type.to_string());
            media.add_attribute(Attribute::value(
                "rtpmap",
                format!("{} {}", codec.payload_type, codec.encoding()),
            ));
        }

        media.formats.push(DEFAULT_TELEPHONE_EVENT_PAYLOAD.to_string());
        media.add_attribute(Attribute::value(
            "rtpmap",
            format!("{} {}/8000", DEFAULT_TELEPHONE_EVENT_PAYLOAD, TELEPHONE_EVENT),
        ));
        media.add_attribute(Attribute::value(
            "fmtp",
            format!("{} 0-15", DEFAULT_TELEPHONE_EVENT_PAYLOAD),
        ));

        media.add_attribute(Attribute::property(Direction::SendRecv.as_str()));
        if let Some(hash) = &self.zrtp_hello_hash {
            media.add_attribute(Attribute::value("zrtp-hash", format!("1.10 {}", hash)));
        }
        for line in &self.local_crypto {
            media.add_attribute(Attribute::value("crypto", line.clone()));
        }
        media
    }

    fn video_media(&self, video: &[VideoCodec]) -> MediaDescription {
        let mut media = MediaDescription::new(MediaKind::Video, self.local_video_port, "RTP/AVP");
        for (codec, payload_type) in video.iter().zip(FIRST_DYNAMIC_PAYLOAD..) {
            media.formats.push(payload_type.to_string());
            media.add_attribute(Attribute::value(
                "rtpmap",
                format!("{} {}/{}", payload_type, codec.name, VIDEO_CLOCK_RATE),
            ));
            if let Some(fmtp) = &codec.fmtp {
                media.add_attribute(Attribute::value("fmtp", format!("{} {}", payload_type, fmtp)));
            }
        }
        media.add_attribute(Attribute::property(Direction::SendRecv.as_str()));
        media
    }

    /// Build a fresh local offer. Audio is always present at index 0;
    /// video only with at least one codec.
    pub fn create_offer(&mut self, audio: &[AudioCodec], video: &[VideoCodec]) -> &SessionDescription {
        let origin = match &self.local_session {
            Some(previous) => Origin {
                session_version: previous.origin.session_version + 1,
                address: self.local_ip.clone(),
                ..previous.origin.clone()
            },
            None => Origin {
                username: self.username.clone(),
                session_id: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or_default()
                    + NTP_EPOCH_OFFSET,
                session_version: 0,
                address_type: "IP4".to_string(),
                address: self.local_ip.clone(),
            },
        };

        let mut media = vec![self.audio_media(audio)];
        if !video.is_empty() {
            media.push(self.video_media(video));
        }

        let session = SessionDescription {
            origin,
            session_name: self.session_name.clone(),
            connection: Some(Connection::ip4(self.local_ip.clone())),
            timing: (0, 0),
            attributes: Vec::new(),
            media,
        };
        debug!(
            audio_port = self.local_audio_port,
            video_port = self.local_video_port,
            "Local SDP offer created"
        );

        self.state = NegotiationState::LocalOffer;
        self.local_session.insert(session)
    }

    /// Take the peer's offer. Builds our capabilities first if no local
    /// offer exists yet.
    pub fn receive_offer(
        &mut self,
        remote: Option<&SessionDescription>,
        audio: &[AudioCodec],
        video: &[VideoCodec],
    ) -> Result<(), SdpError> {
        let remote = remote.ok_or_else(|| {
            error!("Remote offer is missing");
            SdpError::MissingRemote
        })?;

        if self.local_session.is_none() {
            self.create_offer(audio, video);
        }
        self.remote_session = Some(remote.clone());
        self.state = NegotiationState::RemoteOffer;
        Ok(())
    }

    /// Take the peer's answer to our outstanding offer
    pub fn receive_answer(&mut self, answer: &SessionDescription) -> Result<(), SdpError> {
        if self.local_session.is_none() {
            return Err(SdpError::MissingLocal);
        }
        self.remote_session = Some(answer.clone());
        self.state = NegotiationState::RemoteAnswer;
        Ok(())
    }

    /// Run the offer/answer step for the current round and extract the
    /// negotiated parameters.
    pub fn start_negotiation(&mut self) -> Result<(), SdpError> {
        let local = self.local_session.as_ref().ok_or(SdpError::MissingLocal)?;
        let remote = self.remote_session.as_ref().ok_or(SdpError::MissingRemote)?;

        let active_local = match self.state {
            NegotiationState::RemoteOffer => create_answer(local, remote)?,
            NegotiationState::RemoteAnswer => apply_answer(local, remote)?,
            state => {
                return Err(SdpError::Negotiation(format!(
                    "nothing to negotiate in state {:?}",
                    state
                )))
            }
        };

        self.active_remote = Some(remote.clone());
        self.active_local = Some(active_local);
        self.state = NegotiationState::Done;
        self.round += 1;

        self.extract_session_codecs();
        self.extract_telephone_event();
        self.extract_remote_media();
        info!(round = self.round, "SDP negotiation complete");
        Ok(())
    }

    fn extract_session_codecs(&mut self) {
        let Some(active) = &self.active_local else {
            return;
        };

        self.session_audio = active.audio().and_then(|media| {
            media.payload_types().into_iter().find_map(|pt| {
                let rtpmap = media.rtpmap(pt);
                if rtpmap
                    .as_ref()
                    .map_or(false, |r| r.encoding.eq_ignore_ascii_case(TELEPHONE_EVENT))
                {
                    return None;
                }
                let known = match &rtpmap {
                    Some(map) if pt >= FIRST_DYNAMIC_PAYLOAD => {
                        self.registry.audio_by_encoding(&map.encoding, map.clock_rate)
                    }
                    _ => self.registry.audio(pt),
                };
                known.cloned().map(|codec| AudioCodec {
                    payload_type: pt,
                    ..codec
                })
            })
        });

        self.session_video = active
            .video()
            .filter(|m| !m.is_rejected())
            .and_then(|media| {
                media
                    .payload_types()
                    .first()
                    .and_then(|pt| media.rtpmap(*pt))
                    .map(|map| map.encoding)
            });
    }

    fn extract_telephone_event(&mut self) {
        let payload = self.active_remote.as_ref().and_then(|remote| {
            remote.audio().and_then(|media| {
                media
                    .rtpmaps()
                    .into_iter()
                    .find(|r| r.encoding.eq_ignore_ascii_case(TELEPHONE_EVENT))
                    .map(|r| r.payload_type)
            })
        });

        self.telephone_event_payload = match payload {
            Some(pt) => pt,
            None => {
                error!(
                    "Remote SDP has no telephone-event, using payload {}",
                    DEFAULT_TELEPHONE_EVENT_PAYLOAD
                );
                DEFAULT_TELEPHONE_EVENT_PAYLOAD
            }
        };
    }

    fn extract_remote_media(&mut self) {
        let Some(remote) = &self.active_remote else {
            return;
        };
        self.remote_audio_port = remote.audio().map_or(0, |m| m.port);
        self.remote_video_port = remote.video().map_or(0, |m| m.port);
        self.remote_ip = remote
            .audio()
            .and_then(|m| remote.connection_for(m))
            .or(remote.connection.as_ref())
            .map(|c| c.address.clone());
    }

    /// Set stream directions on our offer for a hold or resume re-INVITE.
    /// Returns the new offer with its version bumped.
    pub fn set_media_direction(
        &mut self,
        audio: Direction,
        video: Direction,
    ) -> Result<&SessionDescription, SdpError> {
        let session = self.local_session.as_mut().ok_or(SdpError::MissingLocal)?;
        if let Some(media) = session.audio_mut() {
            media.set_direction(audio);
        }
        if let Some(media) = session.video_mut() {
            media.set_direction(video);
        }
        session.origin.session_version += 1;
        self.state = NegotiationState::LocalOffer;
        Ok(&*session)
    }

    /// Put the call on hold: audio sendonly, video inactive
    pub fn hold(&mut self) -> Result<&SessionDescription, SdpError> {
        self.set_media_direction(Direction::SendOnly, Direction::Inactive)
    }

    pub fn resume(&mut self) -> Result<&SessionDescription, SdpError> {
        self.set_media_direction(Direction::SendRecv, Direction::SendRecv)
    }

    /// Offer currently on record, re-sent unchanged when a request needs one
    pub fn local_offer(&self) -> Option<&SessionDescription> {
        self.local_session.as_ref()
    }

    pub fn remote_session(&self) -> Option<&SessionDescription> {
        self.remote_session.as_ref()
    }

    pub fn active_local(&self) -> Option<&SessionDescription> {
        self.active_local.as_ref()
    }

    pub fn active_remote(&self) -> Option<&SessionDescription> {
        self.active_remote.as_ref()
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Completed offer/answer rounds
    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn session_audio_codec(&self) -> Option<&AudioCodec> {
        self.session_audio.as_ref()
    }

    pub fn session_video_codec(&self) -> Option<&str> {
        self.session_video.as_deref()
    }

    pub fn telephone_event_payload(&self) -> u8 {
        self.telephone_event_payload
    }

    pub fn remote_ip(&self) -> Option<&str> {
        self.remote_ip.as_deref()
    }

    pub fn remote_audio_port(&self) -> u16 {
        self.remote_audio_port
    }

    pub fn remote_video_port(&self) -> u16 {
        self.remote_video_port
    }

    /// Peer's `a=crypto` lines on the audio stream of the active round
    pub fn remote_crypto(&self) -> Vec<String> {
        self.active_remote
            .as_ref()
            .and_then(|s| s.audio())
            .map(|m| m.crypto_values())
            .unwrap_or_default()
    }

    /// Peer's `a=crypto` lines of a description that has not been negotiated yet
    pub fn offered_crypto(&self) -> Vec<String> {
        self.remote_session
            .as_ref()
            .and_then(|s| s.audio())
            .map(|m| m.crypto_values())
            .unwrap_or_default()
    }

    /// Direction of the active audio stream
    pub fn active_direction(&self) -> Option<Direction> {
        let active = self.active_local.as_ref()?;
        let audio = active.audio()?;
        Some(active.direction_of(audio))
    }

    /// Remove crypto from our offer after an SDES failure
    pub fn drop_local_crypto(&mut self) {
        self.local_crypto.clear();
        if let Some(session) = self.local_session.as_mut() {
            if let Some(audio) = session.audio_mut() {
                audio.remove_attribute("crypto");
                audio.protocol = "RTP/AVP".to_string();
            }
        }
    }
}
