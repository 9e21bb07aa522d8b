//! SIP call: one [`Call`] aggregate bound to its protocol session, SDP
//! negotiator and media sessions.
//!
//! Every method runs synchronously under the call's lock. Messages to send
//! are queued on the protocol session and signals for the upper layer are
//! collected here; the engine drains both once the lock is released.

use super::message::{
    display_name, name_addr_uri, reason_phrase, split_refer_target, HeaderAccess, ReplacesValue,
    SipError, SipMethod, SipRequest, SipResponse,
};
use super::dialog::DialogId;
use super::session::{Outgoing, ProtocolSession, SDP_CONTENT_TYPE, TEXT_CONTENT_TYPE};
use crate::application::notifier::Signal;
use crate::domain::account::{Account, DtmfMode};
use crate::domain::call::{Call, CallEvent, CallState, ConnectionState, EndReason};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::events::DomainEvent;
use crate::domain::shared::value_objects::{AccountId, CallId};
use crate::infrastructure::media::dtmf::DTMF_RELAY_CONTENT_TYPE;
use crate::infrastructure::media::{
    AudioCodec, CodecRegistry, DtmfDigit, LocalCryptoOffer, MediaError, NegotiatedCrypto,
    RtpSession, SdesNegotiator, VideoCodec, VideoSession, ZrtpEvent, CRYPTO_SUITES,
};
use crate::infrastructure::protocols::sdp::{NegotiationState, SdpError, SdpNegotiator, SessionDescription};
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const MEDIA_CONTROL_CONTENT_TYPE: &str = "application/media_control+xml";

#[derive(Error, Debug)]
pub enum CallError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Sip(#[from] SipError),

    #[error(transparent)]
    Sdp(#[from] SdpError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("No usable audio codec for account {0}")]
    NoCodec(AccountId),

    #[error("SRTP negotiation failed and RTP fallback is disabled")]
    SrtpNegotiation,
}

/// Everything a call needs besides its protocol session
pub struct CallSetup {
    pub id: CallId,
    pub account: Account,
    pub registry: CodecRegistry,
    pub local_ip: String,
    /// Audio and video RTP ports
    pub ports: (u16, u16),
    pub audio: Box<dyn RtpSession>,
    pub video: Box<dyn VideoSession>,
    pub dtmf_duration_ms: u32,
}

/// Pending re-INVITE purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reinvite {
    Hold,
    Resume,
}

/// What the engine has to do after an in-dialog request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogAction {
    None,
    /// Peer asked us to call `target` (REFER accepted with 202)
    Refer {
        target: String,
        replaces: Option<ReplacesValue>,
    },
}

pub struct SipCall {
    call: Call,
    account: Account,
    session: Box<dyn ProtocolSession>,
    sdp: SdpNegotiator,
    audio: Box<dyn RtpSession>,
    video: Box<dyn VideoSession>,
    audio_codecs: Vec<AudioCodec>,
    video_codecs: Vec<VideoCodec>,
    default_codec: AudioCodec,
    sdes: Option<NegotiatedCrypto>,
    sdes_fallback: bool,
    /// Unanswered incoming INVITE
    pending_invite: Option<SipRequest>,
    reinvite: Option<Reinvite>,
    transfer_pending: bool,
    /// Call that sent the REFER this call was placed for
    referred_by: Option<CallId>,
    applied_round: u32,
    sas_shown: bool,
    dtmf_duration_ms: u32,
    signals: Vec<Signal>,
}

impl SipCall {
    fn new(
        setup: CallSetup,
        call: Call,
        session: Box<dyn ProtocolSession>,
    ) -> Result<Self, CallError> {
        let CallSetup {
            account,
            registry,
            local_ip,
            ports: (audio_port, video_port),
            mut audio,
            video,
            dtmf_duration_ms,
            ..
        } = setup;

        let audio_codecs = registry.resolve_audio(&account.audio_codecs);
        let video_codecs =
            registry.resolve_video(account.active_video_codecs().iter().map(|c| c.name.as_str()));
        let default_codec = audio_codecs
            .first()
            .cloned()
            .unwrap_or_else(|| registry.default_audio());

        let mut sdp = SdpNegotiator::new(
            registry,
            if account.username.is_empty() { "-" } else { &account.username },
            "voiplink",
            &local_ip,
        );
        let video_port = if video_codecs.is_empty() { 0 } else { video_port };
        sdp.set_local_ports(audio_port, video_port);

        let mut call = call;
        call.set_local_media(local_ip.clone(), audio_port, video_port);

        let ip: IpAddr = local_ip
            .parse()
            .map_err(|_| MediaError::Session(format!("invalid local address {}", local_ip)))?;
        audio.init_session(SocketAddr::new(ip, audio_port))?;

        if account.srtp.sdes_enabled() {
            let offer = LocalCryptoOffer::generate();
            audio.init_local_crypto_info(&offer)?;
            sdp.set_local_crypto(offer.attribute_values());
        }

        Ok(Self {
            call,
            account,
            session,
            sdp,
            audio,
            video,
            audio_codecs,
            video_codecs,
            default_codec,
            sdes: None,
            sdes_fallback: false,
            pending_invite: None,
            reinvite: None,
            transfer_pending: false,
            referred_by: None,
            applied_round: 0,
            sas_shown: false,
            dtmf_duration_ms,
            signals: Vec::new(),
        })
    }

    /// Call to `peer`, not dialled yet
    pub fn outgoing(
        setup: CallSetup,
        session: Box<dyn ProtocolSession>,
        peer: &str,
    ) -> Result<Self, CallError> {
        let call = Call::outgoing(setup.id, setup.account.id.clone(), peer);
        Self::new(setup, call, session)
    }

    /// Call for a received INVITE. Rings locally when the offer can be
    /// answered, otherwise answers 488 and ends at once.
    pub fn incoming(
        setup: CallSetup,
        session: Box<dyn ProtocolSession>,
        invite: &SipRequest,
    ) -> Result<Self, CallError> {
        let from = invite.from_header().unwrap_or_default();
        let peer = name_addr_uri(&from);
        let mut call = Call::incoming(setup.id, setup.account.id.clone(), peer.clone());
        call.set_display_name(display_name(&from));

        let mut this = Self::new(setup, call, session)?;
        this.pending_invite = Some(invite.clone());

        if let Err(e) = this.prepare_incoming(invite) {
            warn!(call_id = %this.id(), "Cannot accept incoming call: {}", e);
            this.reject_with(488, EndReason::Failure(488))?;
            return Ok(this);
        }

        this.session.respond(invite, 180, None)?;
        this.call.progress()?;
        this.emit(Signal::IncomingCall {
            account_id: this.account.id.clone(),
            call_id: this.id(),
            from: peer,
        });
        this.call.ring()?;
        Ok(this)
    }

    fn prepare_incoming(&mut self, invite: &SipRequest) -> Result<(), CallError> {
        if self.audio_codecs.is_empty() {
            return Err(CallError::NoCodec(self.account.id.clone()));
        }
        match sdp_body(invite.content_type(), invite.body_str())? {
            Some(offer) => {
                self.sdp
                    .receive_offer(Some(&offer), &self.audio_codecs, &self.video_codecs)?;
                self.sdp.start_negotiation()?;
                self.negotiate_sdes()?;
            }
            None => {
                // We make the offer in the 200 and expect the answer in the ACK
                self.sdp.create_offer(&self.audio_codecs, &self.video_codecs);
            }
        }
        Ok(())
    }

    pub fn id(&self) -> CallId {
        self.call.id()
    }

    pub fn call(&self) -> &Call {
        &self.call
    }

    pub fn account_id(&self) -> &AccountId {
        self.call.account_id()
    }

    pub fn dialog_id(&self) -> DialogId {
        self.session.dialog_id()
    }

    pub fn sip_call_id(&self) -> String {
        self.session.dialog_id().call_id
    }

    pub fn is_ended(&self) -> bool {
        self.call.is_ended()
    }

    /// Connected and not on hold
    pub fn is_current(&self) -> bool {
        self.call.connection_state() == ConnectionState::Connected
            && self.call.state() == CallState::Active
    }

    pub fn sdp(&self) -> &SdpNegotiator {
        &self.sdp
    }

    pub fn negotiated_crypto(&self) -> Option<&NegotiatedCrypto> {
        self.sdes.as_ref()
    }

    pub fn set_referred_by(&mut self, call_id: CallId) {
        self.referred_by = Some(call_id);
    }

    /// Referring call to report back to once this call got far enough:
    /// `(referrer, true)` at PROGRESSING, `(referrer, false)` when it ended first
    pub fn take_referral(&mut self) -> Option<(CallId, bool)> {
        let referrer = self.referred_by?;
        let outcome = if self.has_progressed() {
            true
        } else if self.is_ended() {
            false
        } else {
            return None;
        };
        self.referred_by = None;
        Some((referrer, outcome))
    }

    /// Send the initial INVITE. Media starts on the default codec so
    /// early media can flow before the answer.
    pub fn dial(&mut self) -> Result<(), CallError> {
        let offer = self
            .sdp
            .create_offer(&self.audio_codecs, &self.video_codecs)
            .to_string();
        self.audio.start(&self.default_codec)?;
        self.session.send_invite(&offer)?;
        self.call.set_connection_state(ConnectionState::Trying)?;
        self.call.activate()?;
        info!(call_id = %self.id(), peer = %self.call.peer(), "Dialling");
        Ok(())
    }

    /// INVITE handed to the transaction layer
    pub fn invite_sent(&mut self) -> Result<(), CallError> {
        if self.call.connection_state() == ConnectionState::Trying {
            self.call.progress()?;
        }
        Ok(())
    }

    /// Whether the call has reached PROGRESSING or later
    pub fn has_progressed(&self) -> bool {
        matches!(
            self.call.connection_state(),
            ConnectionState::Progressing | ConnectionState::Ringing | ConnectionState::Connected
        )
    }

    /// Answer the ringing incoming call
    pub fn answer(&mut self) -> Result<(), CallError> {
        let invite = self.pending_invite.take().ok_or_else(|| {
            DomainError::InvalidOperation(format!("call {} has nothing to answer", self.id()))
        })?;
        let body = match self.sdp.state() {
            NegotiationState::Done => self.sdp.active_local().map(|s| s.to_string()),
            _ => self.sdp.local_offer().map(|s| s.to_string()),
        };
        self.session.respond(&invite, 200, body)?;
        self.call.set_sip_status(200, reason_phrase(200));
        self.call.connect()?;
        if self.sdp.state() == NegotiationState::Done {
            self.apply_negotiation(true)?;
        }
        info!(call_id = %self.id(), "Call answered");
        Ok(())
    }

    /// Decline the ringing incoming call with `code`
    pub fn refuse(&mut self, code: u16) -> Result<(), CallError> {
        if self.pending_invite.is_none() {
            return Err(DomainError::InvalidOperation(format!(
                "call {} has nothing to refuse",
                self.id()
            ))
            .into());
        }
        self.reject_with(code, EndReason::Refused)
    }

    fn reject_with(&mut self, code: u16, reason: EndReason) -> Result<(), CallError> {
        if let Some(invite) = self.pending_invite.take() {
            self.session.respond(&invite, code, None)?;
        }
        self.call.set_sip_status(code, reason_phrase(code));
        self.teardown(reason)
    }

    /// Hang up whatever state the call is in
    pub fn hangup(&mut self) -> Result<(), CallError> {
        if self.call.is_ended() {
            return Ok(());
        }
        if self.pending_invite.is_some() {
            return self.reject_with(603, EndReason::Refused);
        }
        if self.session.is_confirmed() {
            self.session.send_bye()?;
        } else {
            self.session.send_cancel()?;
        }
        self.teardown(EndReason::LocalHangup)
    }

    fn teardown(&mut self, reason: EndReason) -> Result<(), CallError> {
        self.audio.stop();
        self.video.stop();
        self.session.terminate();
        if !self.call.is_ended() {
            info!(call_id = %self.id(), ?reason, "Call ended");
            self.call.end(reason)?;
        }
        Ok(())
    }

    /// Put the call on hold; completes when the re-INVITE is answered
    pub fn hold(&mut self) -> Result<(), CallError> {
        if !self.is_current() {
            return Err(DomainError::InvalidOperation(format!(
                "call {} is not active",
                self.id()
            ))
            .into());
        }
        self.audio.save_local_context();
        self.audio.stop();
        self.video.stop();
        let offer = self.sdp.hold()?.to_string();
        self.session.send_reinvite(&offer)?;
        self.reinvite = Some(Reinvite::Hold);
        Ok(())
    }

    /// Take the call off hold with the codec and keys it had before
    pub fn resume(&mut self) -> Result<(), CallError> {
        if self.call.state() != CallState::Hold {
            return Err(DomainError::InvalidOperation(format!(
                "call {} is not on hold",
                self.id()
            ))
            .into());
        }
        self.audio.restore_local_context();
        if !self.audio.is_running() {
            let codec = self
                .sdp
                .session_audio_codec()
                .cloned()
                .unwrap_or_else(|| self.default_codec.clone());
            self.audio.start(&codec)?;
        }
        let offer = self.sdp.resume()?.to_string();
        self.session.send_reinvite(&offer)?;
        self.reinvite = Some(Reinvite::Resume);
        Ok(())
    }

    pub fn send_dtmf(&mut self, code: char) -> Result<(), CallError> {
        let digit = DtmfDigit::from_char(code).ok_or(DomainError::InvalidDtmf(code))?;
        match self.account.dtmf_mode() {
            DtmfMode::OverRtp => self.audio.send_dtmf(digit)?,
            DtmfMode::SipInfo => {
                let body = digit.info_body(self.dtmf_duration_ms);
                self.session.send_info(DTMF_RELAY_CONTENT_TYPE, &body)?;
            }
        }
        Ok(())
    }

    /// Text to the peer inside the call's dialog
    pub fn send_text_message(&mut self, text: &str) -> Result<(), CallError> {
        self.require_connected("send a message in")?;
        self.session.send_message(text)?;
        debug!(call_id = %self.id(), "Text message sent");
        Ok(())
    }

    /// Blind transfer: REFER the peer to `target`
    pub fn transfer(&mut self, target: &str) -> Result<(), CallError> {
        self.require_connected("transfer")?;
        let refer_to = self.account.to_uri(target);
        self.session.send_refer(&refer_to)?;
        self.transfer_pending = true;
        info!(call_id = %self.id(), target = %refer_to, "Transfer requested");
        Ok(())
    }

    /// Attended transfer: REFER the peer to `target` replacing its dialog
    pub fn attended_transfer(
        &mut self,
        target: &str,
        replaces: &ReplacesValue,
    ) -> Result<(), CallError> {
        self.require_connected("transfer")?;
        let refer_to = format!("<{}?{}>", name_addr_uri(target), replaces.to_uri_header());
        self.session.send_refer(&refer_to)?;
        self.transfer_pending = true;
        info!(call_id = %self.id(), target = %refer_to, "Attended transfer requested");
        Ok(())
    }

    /// Peer URI and Replaces value naming this call's dialog, for use as
    /// the target of an attended transfer
    pub fn replaces_target(&self) -> Option<(String, ReplacesValue)> {
        let dialog = self.session.dialog_id();
        Some((self.call.peer().to_string(), dialog.replaces()?))
    }

    fn require_connected(&self, what: &str) -> Result<(), CallError> {
        if self.call.connection_state() != ConnectionState::Connected {
            return Err(DomainError::InvalidOperation(format!(
                "cannot {} call {} before it is connected",
                what,
                self.id()
            ))
            .into());
        }
        Ok(())
    }

    /// Report progress of a transfer we accepted, as a NOTIFY sipfrag
    pub fn notify_transfer(&mut self, code: u16) -> Result<(), CallError> {
        let sipfrag = format!("SIP/2.0 {} {}", code, reason_phrase(code));
        self.session.send_notify(&sipfrag, code >= 200)?;
        Ok(())
    }

    /// Ask the peer for a new key frame
    pub fn request_keyframe(&mut self) -> Result<(), CallError> {
        self.require_connected("request a key frame on")?;
        let body = "<?xml version=\"1.0\" encoding=\"utf-8\" ?>\
<media_control><vc_primitive><to_encoder><picture_fast_update/></to_encoder></vc_primitive></media_control>";
        self.session.send_info(MEDIA_CONTROL_CONTENT_TYPE, body)?;
        Ok(())
    }

    /// Response to a request this call sent
    pub fn on_response(
        &mut self,
        request: &SipRequest,
        response: &SipResponse,
    ) -> Result<(), CallError> {
        match request.method() {
            Some(SipMethod::Invite) => self.on_invite_response(response),
            Some(SipMethod::Refer) => {
                let code = response.status_code();
                if code >= 300 {
                    warn!(call_id = %self.id(), code, "Transfer refused by peer");
                    self.transfer_pending = false;
                    self.emit(Signal::TransferFailed { call_id: self.id() });
                }
                Ok(())
            }
            Some(method) => {
                if response.status_code() >= 300 {
                    warn!(
                        call_id = %self.id(),
                        %method,
                        code = response.status_code(),
                        "Request failed"
                    );
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn on_invite_response(&mut self, response: &SipResponse) -> Result<(), CallError> {
        let code = response.status_code();
        self.session.on_response(response);

        if self.call.is_ended() {
            // Answer raced our CANCEL
            if (200..300).contains(&code) {
                self.session.send_ack(None)?;
                self.session.send_bye()?;
            }
            return Ok(());
        }
        if self.call.connection_state() == ConnectionState::Connected {
            return self.on_reinvite_response(response);
        }

        match code {
            100 => Ok(()),
            101..=199 => {
                self.call.set_sip_status(code, response.reason());
                self.call.ring()?;
                match self.take_answer(response.content_type(), response.body_str()) {
                    Ok(false) => Ok(()),
                    Ok(true) => {
                        debug!(call_id = %self.id(), "Early media");
                        match self.apply_negotiation(true) {
                            Ok(()) => Ok(()),
                            Err(e) => self.abandon_negotiation(&e),
                        }
                    }
                    Err(e) => self.abandon_negotiation(&e),
                }
            }
            200..=299 => {
                self.call.set_sip_status(code, response.reason());
                self.session.send_ack(None)?;
                if let Err(e) = self.take_answer(response.content_type(), response.body_str()) {
                    return self.abandon_negotiation(&e);
                }
                self.call.connect()?;
                info!(call_id = %self.id(), "Call connected");
                if let Err(e) = self.apply_negotiation(true) {
                    return self.abandon_negotiation(&e);
                }
                Ok(())
            }
            401 | 407 => {
                if self.session.authenticate(response)? {
                    return Ok(());
                }
                self.fail(code, response.reason())
            }
            _ => self.fail(code, response.reason()),
        }
    }

    fn on_reinvite_response(&mut self, response: &SipResponse) -> Result<(), CallError> {
        let code = response.status_code();
        match code {
            100..=199 => Ok(()),
            200..=299 => {
                self.session.send_ack(None)?;
                if let Err(e) = self.take_answer(response.content_type(), response.body_str()) {
                    self.reinvite = None;
                    return self.abandon_negotiation(&e);
                }
                match self.reinvite.take() {
                    Some(Reinvite::Hold) => {
                        self.call.hold()?;
                        self.apply_negotiation(false)?;
                        info!(call_id = %self.id(), "Call on hold");
                    }
                    Some(Reinvite::Resume) => {
                        self.call.resume()?;
                        self.apply_negotiation(true)?;
                        info!(call_id = %self.id(), "Call resumed");
                    }
                    None => self.apply_negotiation(self.call.state() != CallState::Hold)?,
                }
                Ok(())
            }
            _ if matches!(code, 401 | 407) && self.session.authenticate(response)? => Ok(()),
            _ => {
                warn!(call_id = %self.id(), code, "re-INVITE rejected");
                match self.reinvite.take() {
                    Some(Reinvite::Hold) => {
                        // Media goes back to what it was
                        self.audio.restore_local_context();
                        let codec = self
                            .sdp
                            .session_audio_codec()
                            .cloned()
                            .unwrap_or_else(|| self.default_codec.clone());
                        self.audio.start(&codec)?;
                    }
                    Some(Reinvite::Resume) => {
                        self.audio.save_local_context();
                        self.audio.stop();
                    }
                    None => {}
                }
                Ok(())
            }
        }
    }

    /// Negotiate the SDP answer carried by a response or ACK, if there is
    /// one and an offer of ours is outstanding
    fn take_answer(
        &mut self,
        content_type: Option<String>,
        body: Option<&str>,
    ) -> Result<bool, SdpError> {
        let Some(answer) = sdp_body(content_type, body)? else {
            return Ok(false);
        };
        if self.sdp.state() != NegotiationState::LocalOffer {
            return Ok(false);
        }
        self.sdp.receive_answer(&answer)?;
        self.sdp.start_negotiation()?;
        Ok(true)
    }

    /// The peer's answer cannot be used: end the call as a 488 failure
    fn abandon_negotiation(&mut self, cause: &dyn std::fmt::Display) -> Result<(), CallError> {
        error!(call_id = %self.id(), "Unusable session description: {}", cause);
        if self.session.is_confirmed() {
            self.session.send_bye()?;
        } else {
            self.session.send_cancel()?;
        }
        self.fail(488, reason_phrase(488))
    }

    fn fail(&mut self, code: u16, reason: String) -> Result<(), CallError> {
        self.call.set_sip_status(code, reason);
        let end = match code {
            486 | 600 => EndReason::Busy,
            603 => EndReason::Refused,
            487 => EndReason::Cancelled,
            _ => EndReason::Failure(code),
        };
        warn!(call_id = %self.id(), code, "Call failed");
        self.teardown(end)
    }

    /// A request of this call never left: the transport refused it
    pub fn on_send_failure(&mut self, request: &SipRequest) -> Result<(), CallError> {
        match request.method() {
            Some(SipMethod::Invite)
                if !self.call.is_ended()
                    && self.call.connection_state() != ConnectionState::Connected =>
            {
                self.fail(503, reason_phrase(503))
            }
            _ => self.on_transaction_timeout(request),
        }
    }

    /// A transaction of this call timed out
    pub fn on_transaction_timeout(&mut self, request: &SipRequest) -> Result<(), CallError> {
        match request.method() {
            Some(SipMethod::Invite) if !self.call.is_ended() => {
                if self.call.connection_state() == ConnectionState::Connected {
                    warn!(call_id = %self.id(), "re-INVITE timed out");
                    self.reinvite = None;
                    Ok(())
                } else {
                    self.fail(408, reason_phrase(408))
                }
            }
            Some(SipMethod::Refer) if self.transfer_pending => {
                self.transfer_pending = false;
                self.emit(Signal::TransferFailed { call_id: self.id() });
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Request received inside this call's dialog
    pub fn on_request(&mut self, request: &SipRequest) -> Result<DialogAction, CallError> {
        let Some(method) = request.method() else {
            self.session.respond(request, 501, None)?;
            return Ok(DialogAction::None);
        };
        if method != SipMethod::Ack && !self.session.on_request(request) {
            self.session.respond(request, 500, None)?;
            return Ok(DialogAction::None);
        }

        match method {
            SipMethod::Bye => {
                self.session.respond(request, 200, None)?;
                info!(call_id = %self.id(), "Peer hung up");
                self.teardown(EndReason::PeerHangup)?;
            }
            SipMethod::Cancel => self.on_cancel(request)?,
            SipMethod::Invite => self.on_reinvite(request)?,
            SipMethod::Ack => self.on_ack(request)?,
            SipMethod::Info => self.on_info(request)?,
            SipMethod::Refer => return self.on_refer(request),
            SipMethod::Notify => self.on_notify(request)?,
            SipMethod::Message => self.on_message(request)?,
            SipMethod::Options => self.session.respond(request, 200, None)?,
            _ => self.session.respond(request, 405, None)?,
        }
        Ok(DialogAction::None)
    }

    fn on_cancel(&mut self, cancel: &SipRequest) -> Result<(), CallError> {
        let Some(invite) = self.pending_invite.take() else {
            self.session.respond(cancel, 481, None)?;
            return Ok(());
        };
        self.session.respond(cancel, 200, None)?;
        self.session.respond(&invite, 487, None)?;
        self.call.set_sip_status(487, reason_phrase(487));
        info!(call_id = %self.id(), "Caller cancelled");
        self.teardown(EndReason::Cancelled)
    }

    fn on_reinvite(&mut self, request: &SipRequest) -> Result<(), CallError> {
        match sdp_body(request.content_type(), request.body_str()) {
            Ok(Some(offer)) => {
                let negotiated = self
                    .sdp
                    .receive_offer(Some(&offer), &self.audio_codecs, &self.video_codecs)
                    .and_then(|_| self.sdp.start_negotiation());
                if let Err(e) = negotiated {
                    warn!(call_id = %self.id(), "Cannot answer re-INVITE: {}", e);
                    self.session.respond(request, 488, None)?;
                    return Ok(());
                }
                let answer = self.sdp.active_local().map(|s| s.to_string());
                self.session.respond(request, 200, answer)?;
                self.apply_negotiation(self.call.state() != CallState::Hold)
            }
            Ok(None) => {
                let offer = self
                    .sdp
                    .create_offer(&self.audio_codecs, &self.video_codecs)
                    .to_string();
                self.session.respond(request, 200, Some(offer))?;
                Ok(())
            }
            Err(e) => {
                warn!(call_id = %self.id(), "Malformed SDP in re-INVITE: {}", e);
                self.session.respond(request, 400, None)?;
                Ok(())
            }
        }
    }

    fn on_ack(&mut self, ack: &SipRequest) -> Result<(), CallError> {
        if self.sdp.state() != NegotiationState::LocalOffer {
            return Ok(());
        }
        let negotiated = match self.take_answer(ack.content_type(), ack.body_str()) {
            Ok(negotiated) => negotiated,
            Err(e) => return self.abandon_negotiation(&e),
        };
        if negotiated {
            if let Err(e) = self.apply_negotiation(self.call.state() != CallState::Hold) {
                return self.abandon_negotiation(&e);
            }
        }
        Ok(())
    }

    fn on_info(&mut self, request: &SipRequest) -> Result<(), CallError> {
        let content_type = request.content_type().unwrap_or_default().to_ascii_lowercase();
        let body = request.body_str().unwrap_or_default();
        if content_type.starts_with(DTMF_RELAY_CONTENT_TYPE) {
            match DtmfDigit::from_info_body(body) {
                Some(digit) => self.emit(Signal::IncomingDtmf {
                    call_id: self.id(),
                    digit: digit.to_char(),
                }),
                None => warn!(call_id = %self.id(), "Unreadable DTMF INFO body"),
            }
        } else if content_type.starts_with(MEDIA_CONTROL_CONTENT_TYPE)
            && body.contains("picture_fast_update")
        {
            self.video.force_key_frame();
        }
        self.session.respond(request, 200, None)?;
        Ok(())
    }

    fn on_message(&mut self, request: &SipRequest) -> Result<(), CallError> {
        let is_text = request
            .content_type()
            .map_or(true, |ct| ct.to_ascii_lowercase().starts_with(TEXT_CONTENT_TYPE));
        if !is_text {
            self.session.respond(request, 415, None)?;
            return Ok(());
        }
        self.session.respond(request, 200, None)?;
        let text = request.body_str().unwrap_or_default().to_string();
        self.emit(Signal::IncomingMessage {
            call_id: self.id(),
            from: self.call.peer().to_string(),
            text,
        });
        Ok(())
    }

    fn on_refer(&mut self, request: &SipRequest) -> Result<DialogAction, CallError> {
        let Some(refer_to) = request.header("Refer-To") else {
            self.session.respond(request, 400, None)?;
            return Ok(DialogAction::None);
        };
        self.session.respond(request, 202, None)?;
        let (target, replaces) = split_refer_target(&refer_to);
        info!(call_id = %self.id(), %target, "Peer asked us to transfer");
        Ok(DialogAction::Refer { target, replaces })
    }

    fn on_notify(&mut self, request: &SipRequest) -> Result<(), CallError> {
        self.session.respond(request, 200, None)?;
        let is_refer = request
            .header("Event")
            .map_or(false, |e| e.trim().to_ascii_lowercase().starts_with("refer"));
        if !is_refer || !self.transfer_pending {
            return Ok(());
        }
        let Some(code) = request.body_str().and_then(sipfrag_status) else {
            return Ok(());
        };
        match code {
            100..=199 => {}
            200..=299 => {
                self.transfer_pending = false;
                self.emit(Signal::TransferSucceeded { call_id: self.id() });
                if self.session.is_confirmed() {
                    self.session.send_bye()?;
                }
                self.teardown(EndReason::Transferred)?;
            }
            _ => {
                self.transfer_pending = false;
                warn!(call_id = %self.id(), code, "Transfer failed");
                self.emit(Signal::TransferFailed { call_id: self.id() });
            }
        }
        Ok(())
    }

    /// Key agreement news from the media engine
    pub fn on_zrtp_event(&mut self, event: ZrtpEvent) {
        let call_id = self.id();
        let policy = self.account.zrtp.clone();
        match event {
            ZrtpEvent::SecureOn { cipher } => self.emit(Signal::SecureZrtpOn { call_id, cipher }),
            ZrtpEvent::SecureOff => self.emit(Signal::SecureZrtpOff { call_id }),
            ZrtpEvent::ShowSas { sas, verified } => {
                if !policy.display_sas || (policy.display_sas_once && self.sas_shown) {
                    return;
                }
                self.sas_shown = true;
                self.emit(Signal::ShowSas { call_id, sas, verified });
            }
            ZrtpEvent::NotSupported => {
                if policy.not_supp_warning {
                    self.emit(Signal::ZrtpNotSupported { call_id });
                }
            }
            ZrtpEvent::NegotiationFailed { reason } => {
                self.emit(Signal::ZrtpNegotiationFailed { call_id, reason })
            }
        }
    }

    /// Push the latest negotiated parameters to the media sessions.
    /// Runs once per negotiation round.
    fn apply_negotiation(&mut self, start_audio: bool) -> Result<(), CallError> {
        if self.sdp.round() == self.applied_round {
            return Ok(());
        }
        self.applied_round = self.sdp.round();

        let remote_ip = self.sdp.remote_ip().and_then(|ip| ip.parse::<IpAddr>().ok());
        match remote_ip {
            Some(ip) if self.sdp.remote_audio_port() > 0 => {
                self.audio
                    .update_destination(SocketAddr::new(ip, self.sdp.remote_audio_port()));
            }
            _ => warn!(call_id = %self.id(), "Remote SDP has no usable audio address"),
        }
        self.audio
            .set_dtmf_payload_type(self.sdp.telephone_event_payload());

        self.negotiate_sdes()?;

        let codec = self
            .sdp
            .session_audio_codec()
            .cloned()
            .unwrap_or_else(|| self.default_codec.clone());
        if self.audio.is_running() {
            if self.audio.session_media() != Some(codec.payload_type) {
                self.audio.update_session_media(&codec)?;
            }
        } else if start_audio {
            self.audio.start(&codec)?;
        }

        if start_audio {
            self.start_video(remote_ip)?;
        }

        self.call.set_remote_media(
            self.sdp.remote_ip().map(str::to_string),
            self.sdp.remote_audio_port(),
            self.sdp.remote_video_port(),
        );
        Ok(())
    }

    fn start_video(&mut self, remote_ip: Option<IpAddr>) -> Result<(), CallError> {
        let (Some(codec), Some(ip)) = (self.sdp.session_video_codec(), remote_ip) else {
            return Ok(());
        };
        let local_port = self.sdp.local_video_port();
        let remote_port = self.sdp.remote_video_port();
        if local_port == 0 || remote_port == 0 || self.video.is_running() {
            return Ok(());
        }
        let payload_type = self
            .sdp
            .active_local()
            .and_then(|s| s.video())
            .and_then(|m| m.payload_types().first().copied())
            .unwrap_or(96);
        let codec = codec.to_string();
        self.video
            .start(local_port, SocketAddr::new(ip, remote_port), &codec, payload_type)?;
        Ok(())
    }

    /// SDES runs once per call; later rounds keep the negotiated keys
    fn negotiate_sdes(&mut self) -> Result<(), CallError> {
        if !self.account.srtp.sdes_enabled() || self.sdes.is_some() || self.sdes_fallback {
            return Ok(());
        }
        let remote = self.sdp.remote_crypto();
        let mut negotiator = SdesNegotiator::new(CRYPTO_SUITES.to_vec(), remote);
        let negotiated = if negotiator.negotiate() {
            negotiator.into_negotiated()
        } else {
            None
        };

        match negotiated {
            Some(crypto) => {
                self.audio.set_remote_crypto_info(&crypto)?;
                self.audio.set_srtp_enabled(true);
                info!(call_id = %self.id(), suite = %crypto.suite.name, "SRTP keys negotiated");
                self.sdes = Some(crypto);
                self.emit(Signal::SecureSdesOn { call_id: self.id() });
                Ok(())
            }
            None => {
                self.emit(Signal::SecureSdesOff { call_id: self.id() });
                if !self.account.srtp.rtp_fallback {
                    error!(call_id = %self.id(), "Peer offered no usable crypto");
                    return Err(CallError::SrtpNegotiation);
                }
                warn!(call_id = %self.id(), "Peer offered no usable crypto, falling back to RTP");
                self.sdes_fallback = true;
                self.audio.set_srtp_enabled(false);
                self.sdp.drop_local_crypto();
                Ok(())
            }
        }
    }

    fn emit(&mut self, signal: Signal) {
        self.collect_events();
        self.signals.push(signal);
    }

    fn collect_events(&mut self) {
        for event in self.call.take_events() {
            debug!(
                call_id = %event.call_id(),
                event = event.event_type(),
                seq = event.sequence(),
                "Call event"
            );
            if let CallEvent::StatusChanged(changed) = event {
                self.signals.push(Signal::CallStateChanged {
                    call_id: changed.base.call_id,
                    state: changed.status,
                    sip_status: changed.sip_status,
                });
            }
        }
    }

    /// Signals raised since the last call, in order
    pub fn take_signals(&mut self) -> Vec<Signal> {
        self.collect_events();
        std::mem::take(&mut self.signals)
    }

    /// Messages queued since the last call
    pub fn take_outbox(&mut self) -> Vec<Outgoing> {
        self.session.take_outbox()
    }

    /// Resend the ACK for a retransmitted 2xx
    pub fn resend_ack(&mut self) -> bool {
        self.session.resend_ack()
    }
}

/// Parse an SDP body if the message carries one
fn sdp_body(
    content_type: Option<String>,
    body: Option<&str>,
) -> Result<Option<SessionDescription>, SdpError> {
    let is_sdp = content_type
        .map_or(true, |ct| ct.to_ascii_lowercase().starts_with(SDP_CONTENT_TYPE));
    match body {
        Some(body) if is_sdp && !body.trim().is_empty() => {
            SessionDescription::parse(body).map(Some)
        }
        _ => Ok(None),
    }
}

/// Status code of a `message/sipfrag` body such as `SIP/2.0 200 OK`
fn sipfrag_status(body: &str) -> Option<u16> {
    body.lines().next()?.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::call::CallStatus;
    use crate::infrastructure::media::rtp::session::{MockRtpSession, MockVideoSession};
    use crate::infrastructure::media::rtp::MediaEvent;
    use crate::infrastructure::media::{MediaFactory, RecordingMediaFactory};
    use crate::infrastructure::protocols::sip::builder::ResponseBuilder;
    use crate::infrastructure::protocols::sip::session::{
        LocalContact, MockProtocolSession, SipSession,
    };
    use crate::infrastructure::protocols::sip::transport::TransportProtocol;
    use tokio::sync::mpsc::UnboundedReceiver;

    const PLAIN_ANSWER: &str = "v=0\r\n\
o=bob 1 1 IN IP4 10.0.0.2\r\n\
s=peer\r\n\
c=IN IP4 10.0.0.2\r\n\
t=0 0\r\n\
m=audio 30000 RTP/AVP 0 101\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:101 telephone-event/8000\r\n\
a=sendrecv\r\n";

    const REJECTED_ANSWER: &str = "v=0\r\n\
o=bob 1 1 IN IP4 10.0.0.2\r\n\
s=peer\r\n\
c=IN IP4 10.0.0.2\r\n\
t=0 0\r\n\
m=audio 0 RTP/AVP 0\r\n";

    fn local() -> LocalContact {
        LocalContact {
            transport: TransportProtocol::Udp,
            host: "10.0.0.1".to_string(),
            port: 5060,
            contact: "<sip:alice@10.0.0.1:5060>".to_string(),
            user_agent: "voiplink-test".to_string(),
        }
    }

    fn account() -> Account {
        let mut account = Account::new(AccountId::new("acc1"), "alice", "example.com");
        account.dtmf_type = "sipinfo".to_string();
        account
    }

    fn setup(account: Account, factory: &RecordingMediaFactory) -> CallSetup {
        let id = CallId::new();
        CallSetup {
            id,
            account,
            registry: CodecRegistry::new(),
            local_ip: "10.0.0.1".to_string(),
            ports: (20000, 20002),
            audio: factory.audio_session(id),
            video: factory.video_session(id),
            dtmf_duration_ms: 140,
        }
    }

    fn requests(call: &mut SipCall) -> Vec<SipRequest> {
        call.take_outbox()
            .into_iter()
            .filter_map(|o| match o {
                Outgoing::Request(r) | Outgoing::Ack(r) => Some(r),
                Outgoing::Response { .. } => None,
            })
            .collect()
    }

    fn responses(call: &mut SipCall) -> Vec<SipResponse> {
        call.take_outbox()
            .into_iter()
            .filter_map(|o| match o {
                Outgoing::Response { response, .. } => Some(response),
                _ => None,
            })
            .collect()
    }

    fn statuses(signals: &[Signal]) -> Vec<CallStatus> {
        signals
            .iter()
            .filter_map(|s| match s {
                Signal::CallStateChanged { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    fn drain(rx: &mut UnboundedReceiver<MediaEvent>) -> Vec<MediaEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn reply(request: &SipRequest, code: u16, sdp: Option<&str>) -> SipResponse {
        let mut builder = ResponseBuilder::new(code)
            .to_tag("btag")
            .contact("<sip:bob@10.0.0.2:5060>");
        if let Some(sdp) = sdp {
            builder = builder.body(SDP_CONTENT_TYPE, sdp.as_bytes().to_vec());
        }
        builder.build_for_request(request).unwrap()
    }

    /// Peer's answer to an offer, PCMA preferred
    fn peer_answer(offer: &SipRequest) -> String {
        let offer = SessionDescription::parse(offer.body_str().unwrap()).unwrap();
        let registry = CodecRegistry::new();
        let codecs = registry.resolve_audio(&[8, 0]);
        let mut peer = SdpNegotiator::new(registry, "bob", "peer", "10.0.0.2");
        peer.set_local_ports(30000, 0);
        peer.receive_offer(Some(&offer), &codecs, &[]).unwrap();
        peer.start_negotiation().unwrap();
        peer.active_local().unwrap().to_string()
    }

    fn dialled(account: Account) -> (SipCall, UnboundedReceiver<MediaEvent>, SipRequest) {
        let (factory, rx) = RecordingMediaFactory::with_events();
        let session = SipSession::outgoing(
            local(),
            "c1@10.0.0.1",
            "<sip:alice@example.com>",
            "<sip:bob@example.com>",
            Vec::new(),
        );
        let mut call =
            SipCall::outgoing(setup(account, &factory), Box::new(session), "sip:bob@example.com")
                .unwrap();
        call.dial().unwrap();
        let invite = requests(&mut call).remove(0);
        call.invite_sent().unwrap();
        (call, rx, invite)
    }

    fn connected() -> (SipCall, UnboundedReceiver<MediaEvent>, SipRequest) {
        let (mut call, rx, invite) = dialled(account());
        let answer = peer_answer(&invite);
        call.on_response(&invite, &reply(&invite, 200, Some(&answer)))
            .unwrap();
        call.take_outbox();
        call.take_signals();
        (call, rx, invite)
    }

    fn in_dialog(call: &SipCall, method: &str, seq: u32, extra: &str, body: &str) -> SipRequest {
        let DialogId { call_id, local_tag, .. } = call.dialog_id();
        let raw = format!(
            "{method} sip:alice@10.0.0.1:5060 SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKpeer{seq}\r\n\
From: <sip:bob@example.com>;tag=btag\r\n\
To: <sip:alice@example.com>;tag={local_tag}\r\n\
Call-ID: {call_id}\r\n\
CSeq: {seq} {method}\r\n\
{extra}Content-Length: {len}\r\n\r\n{body}",
            len = body.len()
        );
        SipRequest::parse(raw.as_bytes()).unwrap()
    }

    #[test]
    fn test_outgoing_call_connects() {
        let (mut call, mut rx, invite) = dialled(account());
        assert_eq!(invite.method(), Some(SipMethod::Invite));
        assert!(invite.body_str().unwrap().contains("m=audio 20000 RTP/AVP"));
        assert_eq!(call.call().connection_state(), ConnectionState::Progressing);

        call.on_response(&invite, &reply(&invite, 180, None)).unwrap();
        let answer = peer_answer(&invite);
        call.on_response(&invite, &reply(&invite, 200, Some(&answer)))
            .unwrap();

        let sent = requests(&mut call);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method(), Some(SipMethod::Ack));
        assert!(call.is_current());
        assert_eq!(
            statuses(&call.take_signals()),
            vec![CallStatus::Ringing, CallStatus::Current]
        );

        let events = drain(&mut rx);
        let id = call.id();
        assert!(events.contains(&MediaEvent::Destination {
            call_id: id,
            remote: "10.0.0.2:30000".parse().unwrap(),
        }));
        assert!(events.contains(&MediaEvent::DtmfPayload {
            call_id: id,
            payload_type: 101,
        }));
        assert_eq!(call.call().remote_audio_port(), 30000);
    }

    fn assert_failed_with_488(call: &mut SipCall, closing: SipMethod) {
        assert!(call.is_ended());
        assert_eq!(call.call().state(), CallState::Error);
        assert_eq!(call.call().sip_status().map(|(code, _)| *code), Some(488));
        assert!(requests(call).iter().any(|r| r.method() == Some(closing)));
        assert_eq!(statuses(&call.take_signals()).last(), Some(&CallStatus::Failure));
    }

    #[test]
    fn test_rejected_answer_in_200_ends_call() {
        let (mut call, mut rx, invite) = dialled(account());
        call.on_response(&invite, &reply(&invite, 200, Some(REJECTED_ANSWER)))
            .unwrap();

        assert_failed_with_488(&mut call, SipMethod::Bye);
        assert!(drain(&mut rx).contains(&MediaEvent::Stopped { call_id: call.id() }));
    }

    #[test]
    fn test_malformed_answer_in_200_ends_call() {
        let (mut call, _rx, invite) = dialled(account());
        call.on_response(&invite, &reply(&invite, 200, Some("not sdp at all")))
            .unwrap();

        assert_failed_with_488(&mut call, SipMethod::Bye);
    }

    #[test]
    fn test_rejected_early_answer_cancels_call() {
        let (mut call, _rx, invite) = dialled(account());
        call.on_response(&invite, &reply(&invite, 183, Some(REJECTED_ANSWER)))
            .unwrap();

        assert_failed_with_488(&mut call, SipMethod::Cancel);
    }

    #[test]
    fn test_busy_ends_call() {
        let (mut call, mut rx, invite) = dialled(account());
        call.on_response(&invite, &reply(&invite, 486, None)).unwrap();

        assert!(call.is_ended());
        assert_eq!(call.call().state(), CallState::Busy);
        assert_eq!(statuses(&call.take_signals()), vec![CallStatus::Busy]);
        assert!(drain(&mut rx).contains(&MediaEvent::Stopped { call_id: call.id() }));
    }

    #[test]
    fn test_hold_and_resume_keep_codec() {
        let (mut call, mut rx, _) = connected();
        let id = call.id();
        let codec = call.sdp().session_audio_codec().unwrap().payload_type;
        drain(&mut rx);

        call.hold().unwrap();
        let hold = requests(&mut call).remove(0);
        assert!(hold.body_str().unwrap().contains("a=sendonly"));
        let answer = peer_answer(&hold);
        call.on_response(&hold, &reply(&hold, 200, Some(&answer))).unwrap();
        assert_eq!(call.call().state(), CallState::Hold);
        let acks = requests(&mut call);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].method(), Some(SipMethod::Ack));
        assert!(drain(&mut rx).contains(&MediaEvent::ContextSaved { call_id: id }));

        call.resume().unwrap();
        let resume = requests(&mut call).remove(0);
        assert!(resume.body_str().unwrap().contains("a=sendrecv"));
        let answer = peer_answer(&resume);
        call.on_response(&resume, &reply(&resume, 200, Some(&answer)))
            .unwrap();

        assert!(call.is_current());
        assert_eq!(call.sdp().session_audio_codec().unwrap().payload_type, codec);
        let events = drain(&mut rx);
        assert!(events.contains(&MediaEvent::Started { call_id: id, payload_type: codec }));
        assert_eq!(
            statuses(&call.take_signals()),
            vec![CallStatus::Hold, CallStatus::Unhold]
        );
    }

    #[test]
    fn test_dtmf_over_sip_info() {
        let (mut call, _rx, _) = connected();
        call.send_dtmf('5').unwrap();
        let info = requests(&mut call).remove(0);
        assert_eq!(info.method(), Some(SipMethod::Info));
        assert_eq!(info.content_type().as_deref(), Some(DTMF_RELAY_CONTENT_TYPE));
        assert_eq!(info.body_str(), Some("Signal=5\r\nDuration=140\r\n"));

        assert!(call.send_dtmf('x').is_err());
    }

    #[test]
    fn test_incoming_dtmf_info_is_signalled() {
        let (mut call, _rx, _) = connected();
        let info = in_dialog(
            &call,
            "INFO",
            1,
            "Content-Type: application/dtmf-relay\r\n",
            "Signal=#\r\nDuration=160\r\n",
        );
        assert_eq!(call.on_request(&info).unwrap(), DialogAction::None);
        assert_eq!(responses(&mut call)[0].status_code(), 200);
        assert_eq!(
            call.take_signals(),
            vec![Signal::IncomingDtmf { call_id: call.id(), digit: '#' }]
        );
    }

    #[test]
    fn test_text_message_round_trip() {
        let (mut call, _rx, _) = connected();
        call.send_text_message("are you there?").unwrap();
        let message = requests(&mut call).remove(0);
        assert_eq!(message.method(), Some(SipMethod::Message));
        assert_eq!(message.content_type().as_deref(), Some(TEXT_CONTENT_TYPE));
        assert_eq!(message.body_str(), Some("are you there?"));

        let incoming = in_dialog(
            &call,
            "MESSAGE",
            1,
            "Content-Type: text/plain\r\n",
            "yes, go ahead",
        );
        call.on_request(&incoming).unwrap();
        assert_eq!(responses(&mut call)[0].status_code(), 200);
        assert_eq!(
            call.take_signals(),
            vec![Signal::IncomingMessage {
                call_id: call.id(),
                from: call.call().peer().to_string(),
                text: "yes, go ahead".to_string(),
            }]
        );

        let html = in_dialog(&call, "MESSAGE", 2, "Content-Type: text/html\r\n", "<b>x</b>");
        call.on_request(&html).unwrap();
        assert_eq!(responses(&mut call)[0].status_code(), 415);
        assert!(call.take_signals().is_empty());
    }

    #[test]
    fn test_text_message_needs_connected_call() {
        let (mut call, _rx, _) = dialled(account());
        assert!(call.send_text_message("too early").is_err());
    }

    #[test]
    fn test_peer_bye_ends_call() {
        let (mut call, _rx, _) = connected();
        let bye = in_dialog(&call, "BYE", 1, "", "");
        call.on_request(&bye).unwrap();
        assert_eq!(responses(&mut call)[0].status_code(), 200);
        assert!(call.is_ended());
        assert_eq!(statuses(&call.take_signals()), vec![CallStatus::Hungup]);
    }

    #[test]
    fn test_incoming_refer_returns_target() {
        let (mut call, _rx, _) = connected();
        let refer = in_dialog(
            &call,
            "REFER",
            1,
            "Refer-To: <sip:carol@10.0.0.3>\r\n",
            "",
        );
        let action = call.on_request(&refer).unwrap();
        assert_eq!(
            action,
            DialogAction::Refer {
                target: "sip:carol@10.0.0.3".to_string(),
                replaces: None,
            }
        );
        assert_eq!(responses(&mut call)[0].status_code(), 202);

        let missing = in_dialog(&call, "REFER", 2, "", "");
        assert_eq!(call.on_request(&missing).unwrap(), DialogAction::None);
        assert_eq!(responses(&mut call)[0].status_code(), 400);
    }

    #[test]
    fn test_transfer_completes_on_sipfrag_200() {
        let (mut call, _rx, _) = connected();
        call.transfer("carol").unwrap();
        let refer = requests(&mut call).remove(0);
        assert_eq!(refer.header("Refer-To").as_deref(), Some("<sip:carol@example.com>"));

        let trying = in_dialog(
            &call,
            "NOTIFY",
            1,
            "Event: refer\r\nContent-Type: message/sipfrag;version=2.0\r\n",
            "SIP/2.0 100 Trying",
        );
        call.on_request(&trying).unwrap();
        assert!(!call.is_ended());

        let done = in_dialog(
            &call,
            "NOTIFY",
            2,
            "Event: refer\r\nContent-Type: message/sipfrag;version=2.0\r\n",
            "SIP/2.0 200 OK",
        );
        call.on_request(&done).unwrap();

        let sent = requests(&mut call);
        assert!(sent.iter().any(|r| r.method() == Some(SipMethod::Bye)));
        assert!(call.is_ended());
        assert!(call
            .take_signals()
            .contains(&Signal::TransferSucceeded { call_id: call.id() }));
    }

    #[test]
    fn test_attended_transfer_escapes_replaces() {
        let (mut call, _rx, _) = connected();
        let replaces = ReplacesValue {
            call_id: "abc@host".to_string(),
            to_tag: "t1".to_string(),
            from_tag: "f1".to_string(),
        };
        call.attended_transfer("<sip:carol@10.0.0.3>", &replaces).unwrap();
        let refer = requests(&mut call).remove(0);
        assert_eq!(
            refer.header("Refer-To").as_deref(),
            Some("<sip:carol@10.0.0.3?Replaces=abc%40host%3Bto-tag%3Dt1%3Bfrom-tag%3Df1>")
        );
    }

    fn incoming_invite(body: &str) -> SipRequest {
        let raw = format!(
            "INVITE sip:alice@10.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKin1\r\n\
From: \"Bob\" <sip:bob@10.0.0.2>;tag=btag\r\n\
To: <sip:alice@10.0.0.1>\r\n\
Call-ID: in-1@10.0.0.2\r\n\
CSeq: 1 INVITE\r\n\
Contact: <sip:bob@10.0.0.2:5060>\r\n\
Content-Type: application/sdp\r\n\
Content-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        SipRequest::parse(raw.as_bytes()).unwrap()
    }

    fn peer_offer() -> String {
        let registry = CodecRegistry::new();
        let codecs = registry.resolve_audio(&[0, 8]);
        let mut peer = SdpNegotiator::new(registry, "bob", "peer", "10.0.0.2");
        peer.set_local_ports(30000, 0);
        peer.create_offer(&codecs, &[]).to_string()
    }

    fn incoming(account: Account, invite: &SipRequest) -> (SipCall, UnboundedReceiver<MediaEvent>) {
        let (factory, rx) = RecordingMediaFactory::with_events();
        let session = SipSession::incoming(local(), invite, Vec::new()).unwrap();
        let call = SipCall::incoming(setup(account, &factory), Box::new(session), invite).unwrap();
        (call, rx)
    }

    #[test]
    fn test_incoming_call_rings_then_answers() {
        let invite = incoming_invite(&peer_offer());
        let (mut call, mut rx) = incoming(account(), &invite);

        assert_eq!(responses(&mut call)[0].status_code(), 180);
        let signals = call.take_signals();
        assert!(matches!(&signals[0], Signal::IncomingCall { from, .. } if from == "sip:bob@10.0.0.2"));
        assert_eq!(statuses(&signals), vec![CallStatus::Incoming]);
        assert_eq!(call.call().display_name(), Some("Bob"));

        call.answer().unwrap();
        let ok = responses(&mut call).remove(0);
        assert_eq!(ok.status_code(), 200);
        assert!(ok.body_str().unwrap().contains("m=audio 20000"));
        assert!(call.is_current());
        assert_eq!(statuses(&call.take_signals()), vec![CallStatus::Current]);
        assert!(drain(&mut rx).contains(&MediaEvent::Started {
            call_id: call.id(),
            payload_type: 0,
        }));
        assert!(call.answer().is_err());
    }

    #[test]
    fn test_rejected_answer_in_ack_ends_call() {
        let invite = incoming_invite("");
        let (mut call, _rx) = incoming(account(), &invite);
        call.answer().unwrap();
        let ok = responses(&mut call).remove(0);
        assert!(ok.body_str().unwrap().contains("m=audio 20000"));
        call.take_signals();

        let ack = in_dialog(
            &call,
            "ACK",
            1,
            "Content-Type: application/sdp\r\n",
            REJECTED_ANSWER,
        );
        call.on_request(&ack).unwrap();

        assert_failed_with_488(&mut call, SipMethod::Bye);
    }

    #[test]
    fn test_incoming_without_codecs_is_rejected() {
        let mut account = account();
        account.audio_codecs = vec![77];
        let invite = incoming_invite(&peer_offer());
        let (mut call, _rx) = incoming(account, &invite);

        assert_eq!(responses(&mut call)[0].status_code(), 488);
        assert!(call.is_ended());
        assert!(!call
            .take_signals()
            .iter()
            .any(|s| matches!(s, Signal::IncomingCall { .. })));
    }

    #[test]
    fn test_cancel_of_ringing_call() {
        let invite = incoming_invite(&peer_offer());
        let (mut call, _rx) = incoming(account(), &invite);
        call.take_outbox();

        let cancel = SipRequest::parse(
            b"CANCEL sip:alice@10.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKin1\r\n\
From: \"Bob\" <sip:bob@10.0.0.2>;tag=btag\r\n\
To: <sip:alice@10.0.0.1>\r\n\
Call-ID: in-1@10.0.0.2\r\n\
CSeq: 1 CANCEL\r\n\
Content-Length: 0\r\n\r\n",
        )
        .unwrap();
        call.on_request(&cancel).unwrap();

        let codes: Vec<u16> = responses(&mut call).iter().map(|r| r.status_code()).collect();
        assert_eq!(codes, vec![200, 487]);
        assert!(call.is_ended());
        assert_eq!(call.call().direction(), crate::domain::call::CallDirection::Missed);
    }

    #[test]
    fn test_sdes_failure_without_fallback_ends_call() {
        let mut account = account();
        account.srtp.enabled = true;
        let (mut call, _rx, invite) = dialled(account);
        assert!(invite.body_str().unwrap().contains("a=crypto:1 AES_CM_128_HMAC_SHA1_80"));

        call.on_response(&invite, &reply(&invite, 200, Some(PLAIN_ANSWER)))
            .unwrap();

        assert!(call.is_ended());
        let sent = requests(&mut call);
        assert!(sent.iter().any(|r| r.method() == Some(SipMethod::Bye)));
        let signals = call.take_signals();
        assert!(signals.contains(&Signal::SecureSdesOff { call_id: call.id() }));
        assert!(statuses(&signals).contains(&CallStatus::Failure));
    }

    #[test]
    fn test_sdes_failure_falls_back_to_rtp() {
        let mut account = account();
        account.srtp.enabled = true;
        account.srtp.rtp_fallback = true;
        let (mut call, _rx, invite) = dialled(account);

        call.on_response(&invite, &reply(&invite, 200, Some(PLAIN_ANSWER)))
            .unwrap();

        assert!(call.is_current());
        assert!(call.negotiated_crypto().is_none());
        assert!(call
            .take_signals()
            .contains(&Signal::SecureSdesOff { call_id: call.id() }));
    }

    #[test]
    fn test_sas_shown_once() {
        let (mut call, _rx, _) = connected();
        call.account.zrtp.display_sas = true;
        call.account.zrtp.display_sas_once = true;
        let sas = || ZrtpEvent::ShowSas { sas: "abcd".to_string(), verified: false };

        call.on_zrtp_event(sas());
        call.on_zrtp_event(sas());
        call.on_zrtp_event(ZrtpEvent::NotSupported);

        let shown = call
            .take_signals()
            .into_iter()
            .filter(|s| matches!(s, Signal::ShowSas { .. }))
            .count();
        assert_eq!(shown, 1);
    }

    #[test]
    fn test_hangup_before_answer_cancels() {
        let id = CallId::new();
        let mut audio = MockRtpSession::new();
        audio.expect_init_session().returning(|_| Ok(()));
        audio.expect_start().times(1).returning(|_| Ok(()));
        audio.expect_stop().times(1).return_const(());
        let mut video = MockVideoSession::new();
        video.expect_stop().return_const(());

        let mut session = MockProtocolSession::new();
        session.expect_send_invite().times(1).returning(|_| Ok(()));
        session.expect_is_confirmed().return_const(false);
        session.expect_send_cancel().times(1).returning(|| Ok(()));
        session.expect_send_bye().never();
        session.expect_terminate().times(1).return_const(());

        let setup = CallSetup {
            id,
            account: account(),
            registry: CodecRegistry::new(),
            local_ip: "10.0.0.1".to_string(),
            ports: (20000, 20002),
            audio: Box::new(audio),
            video: Box::new(video),
            dtmf_duration_ms: 140,
        };
        let mut call = SipCall::outgoing(setup, Box::new(session), "sip:bob@example.com").unwrap();
        call.dial().unwrap();
        call.hangup().unwrap();

        assert!(call.is_ended());
        // Second hangup is a no-op
        call.hangup().unwrap();
    }
}
