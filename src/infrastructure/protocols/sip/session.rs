//! Protocol session: the SIP side of one call
//!
//! A [`SipCall`](super::call::SipCall) never touches the network. It asks its
//! protocol session for the requests and responses a transition needs; the
//! session builds them against its dialog and queues them in an outbox the
//! engine flushes once the call lock is released.

use super::auth::DigestChallenge;
use super::builder::{generate_tag, RequestBuilder, ResponseBuilder};
use super::dialog::{Dialog, DialogId, DialogState};
use super::message::{HeaderAccess, ReplacesValue, SipError, SipMethod, SipRequest, SipResponse};
use super::transaction::generate_branch;
use super::transport::TransportProtocol;
use crate::domain::account::Credentials;
use rsip::Header;
use tracing::{debug, warn};

pub const SDP_CONTENT_TYPE: &str = "application/sdp";
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
pub const SIPFRAG_CONTENT_TYPE: &str = "message/sipfrag;version=2.0";

/// Methods answered in `Allow`
pub const ALLOWED_METHODS: &str = "INVITE, ACK, CANCEL, BYE, OPTIONS, INFO, REFER, NOTIFY, MESSAGE";

/// A message the engine has to put on the wire
#[derive(Debug, Clone)]
pub enum Outgoing {
    /// Starts a client transaction
    Request(SipRequest),
    /// ACK for a 2xx, sent outside any transaction
    Ack(SipRequest),
    /// Sent through the server transaction of `request`
    Response {
        request: SipRequest,
        response: SipResponse,
    },
}

/// How this side appears in Via and Contact
#[derive(Debug, Clone)]
pub struct LocalContact {
    pub transport: TransportProtocol,
    pub host: String,
    pub port: u16,
    /// Contact header value
    pub contact: String,
    pub user_agent: String,
}

/// SIP operations a call needs from its signalling protocol
#[cfg_attr(test, mockall::automock)]
pub trait ProtocolSession: Send {
    fn dialog_id(&self) -> DialogId;

    fn is_confirmed(&self) -> bool;

    /// Initial INVITE carrying our offer
    fn send_invite(&mut self, sdp: &str) -> Result<(), SipError>;

    /// In-dialog INVITE, for hold, resume or a session refresh
    fn send_reinvite(&mut self, sdp: &str) -> Result<(), SipError>;

    /// ACK for the 2xx to our last INVITE, with the answer when the 2xx held an offer
    fn send_ack(&mut self, sdp: Option<String>) -> Result<(), SipError>;

    /// Repeat the last ACK for a retransmitted 2xx
    fn resend_ack(&mut self) -> bool;

    fn send_cancel(&mut self) -> Result<(), SipError>;

    fn send_bye(&mut self) -> Result<(), SipError>;

    fn send_info(&mut self, content_type: &str, body: &str) -> Result<(), SipError>;

    /// In-call instant message
    fn send_message(&mut self, text: &str) -> Result<(), SipError>;

    fn send_refer(&mut self, refer_to: &str) -> Result<(), SipError>;

    /// Transfer progress for the referrer
    fn send_notify(&mut self, sipfrag: &str, terminated: bool) -> Result<(), SipError>;

    fn respond(&mut self, request: &SipRequest, code: u16, sdp: Option<String>) -> Result<(), SipError>;

    /// Resend the last INVITE with credentials for a 401/407. False when
    /// there is nothing to answer the challenge with.
    fn authenticate(&mut self, challenge: &SipResponse) -> Result<bool, SipError>;

    /// Dialog bookkeeping for responses to our INVITEs
    fn on_response(&mut self, response: &SipResponse);

    /// Dialog bookkeeping for received requests; false for an out-of-order CSeq
    fn on_request(&mut self, request: &SipRequest) -> bool;

    fn terminate(&mut self);

    fn take_outbox(&mut self) -> Vec<Outgoing>;
}

/// Protocol session over RFC 3261 dialogs
pub struct SipSession {
    dialog: Dialog,
    local: LocalContact,
    credentials: Vec<Credentials>,
    /// Last INVITE we sent and its body
    invite: Option<(SipRequest, String)>,
    last_ack: Option<SipRequest>,
    last_nonce: Option<String>,
    nonce_count: u32,
    /// Dialog the initial INVITE replaces, for attended transfers
    replaces: Option<ReplacesValue>,
    outbox: Vec<Outgoing>,
}

impl SipSession {
    /// Session for a call we place
    pub fn outgoing(
        local: LocalContact,
        call_id: &str,
        from: &str,
        to: &str,
        credentials: Vec<Credentials>,
    ) -> Self {
        Self {
            dialog: Dialog::outgoing(call_id, &generate_tag(), from, to),
            local,
            credentials,
            invite: None,
            last_ack: None,
            last_nonce: None,
            nonce_count: 0,
            replaces: None,
            outbox: Vec::new(),
        }
    }

    /// Carry `Replaces` on the initial INVITE
    pub fn replacing(mut self, replaces: ReplacesValue) -> Self {
        self.replaces = Some(replaces);
        self
    }

    /// Session for a received INVITE
    pub fn incoming(
        local: LocalContact,
        invite: &SipRequest,
        credentials: Vec<Credentials>,
    ) -> Result<Self, SipError> {
        Ok(Self {
            dialog: Dialog::incoming(invite, &generate_tag())?,
            local,
            credentials,
            invite: None,
            last_ack: None,
            last_nonce: None,
            nonce_count: 0,
            replaces: None,
            outbox: Vec::new(),
        })
    }

    pub fn dialog(&self) -> &Dialog {
        &self.dialog
    }

    fn via(&self, builder: RequestBuilder, branch: &str) -> RequestBuilder {
        builder
            .via(self.local.transport.as_str(), &self.local.host, self.local.port, branch)
            .user_agent(&self.local.user_agent)
    }

    fn in_dialog(&mut self, method: SipMethod) -> RequestBuilder {
        let builder = self.dialog.request(method);
        self.via(builder, &generate_branch())
    }

    fn queue_request(&mut self, request: SipRequest) {
        debug!(
            call_id = %self.dialog.call_id,
            method = %request.method_name(),
            "Queued request"
        );
        self.outbox.push(Outgoing::Request(request));
    }

    fn build_invite(&mut self, sdp: &str, authorization: Option<(&str, String)>) -> Result<SipRequest, SipError> {
        let mut builder = self
            .in_dialog(SipMethod::Invite)
            .contact(&self.local.contact.clone())
            .other("Allow", ALLOWED_METHODS);
        if let Some((name, value)) = authorization {
            builder = builder.other(name, &value);
        }
        if self.dialog.state == DialogState::Early {
            if let Some(replaces) = &self.replaces {
                builder = builder.other("Replaces", &replaces.to_string());
            }
        }
        let request = builder
            .body(SDP_CONTENT_TYPE, sdp.as_bytes().to_vec())
            .build()?;
        self.invite = Some((request.clone(), sdp.to_string()));
        Ok(request)
    }
}

impl ProtocolSession for SipSession {
    fn dialog_id(&self) -> DialogId {
        self.dialog.id()
    }

    fn is_confirmed(&self) -> bool {
        self.dialog.state == DialogState::Confirmed
    }

    fn send_invite(&mut self, sdp: &str) -> Result<(), SipError> {
        let request = self.build_invite(sdp, None)?;
        self.queue_request(request);
        Ok(())
    }

    fn send_reinvite(&mut self, sdp: &str) -> Result<(), SipError> {
        if self.dialog.state != DialogState::Confirmed {
            return Err(SipError::TransactionError(
                "re-INVITE outside a confirmed dialog".to_string(),
            ));
        }
        self.send_invite(sdp)
    }

    fn send_ack(&mut self, sdp: Option<String>) -> Result<(), SipError> {
        let seq = self
            .invite
            .as_ref()
            .and_then(|(invite, _)| invite.cseq())
            .map(|c| c.seq)
            .ok_or_else(|| SipError::TransactionError("No INVITE to acknowledge".to_string()))?;

        let builder = self.dialog.request_with_cseq(SipMethod::Ack, seq);
        let mut builder = self.via(builder, &generate_branch());
        if let Some(sdp) = sdp {
            builder = builder.body(SDP_CONTENT_TYPE, sdp.into_bytes());
        }
        let ack = builder.build()?;
        self.last_ack = Some(ack.clone());
        self.outbox.push(Outgoing::Ack(ack));
        Ok(())
    }

    fn resend_ack(&mut self) -> bool {
        match self.last_ack.clone() {
            Some(ack) => {
                self.outbox.push(Outgoing::Ack(ack));
                true
            }
            None => false,
        }
    }

    fn send_cancel(&mut self) -> Result<(), SipError> {
        let (invite, _) = self
            .invite
            .as_ref()
            .ok_or_else(|| SipError::TransactionError("No INVITE to cancel".to_string()))?;
        let seq = invite.cseq().map(|c| c.seq).unwrap_or(1);
        let branch = invite
            .via_branch()
            .ok_or_else(|| SipError::InvalidMessage("INVITE without branch".to_string()))?;
        let uri = invite.uri().to_string();

        // Same Request-URI, Via branch and To as the INVITE
        let builder = RequestBuilder::new(SipMethod::Cancel, &uri)
            .from(&self.dialog.from_header())
            .to(&self.dialog.remote_uri)
            .call_id(&self.dialog.call_id)
            .cseq(seq);
        let cancel = self.via(builder, &branch).build()?;
        self.queue_request(cancel);
        Ok(())
    }

    fn send_bye(&mut self) -> Result<(), SipError> {
        let bye = self.in_dialog(SipMethod::Bye).build()?;
        self.dialog.terminate();
        self.queue_request(bye);
        Ok(())
    }

    fn send_info(&mut self, content_type: &str, body: &str) -> Result<(), SipError> {
        let info = self
            .in_dialog(SipMethod::Info)
            .body(content_type, body.as_bytes().to_vec())
            .build()?;
        self.queue_request(info);
        Ok(())
    }

    fn send_message(&mut self, text: &str) -> Result<(), SipError> {
        let message = self
            .in_dialog(SipMethod::Message)
            .body(TEXT_CONTENT_TYPE, text.as_bytes().to_vec())
            .build()?;
        self.queue_request(message);
        Ok(())
    }

    fn send_refer(&mut self, refer_to: &str) -> Result<(), SipError> {
        let referred_by = self.dialog.local_uri.clone();
        let contact = self.local.contact.clone();
        let refer = self
            .in_dialog(SipMethod::Refer)
            .contact(&contact)
            .other("Refer-To", refer_to)
            .other("Referred-By", &referred_by)
            .build()?;
        self.queue_request(refer);
        Ok(())
    }

    fn send_notify(&mut self, sipfrag: &str, terminated: bool) -> Result<(), SipError> {
        let state = if terminated {
            "terminated;reason=noresource"
        } else {
            "active;expires=60"
        };
        let contact = self.local.contact.clone();
        let notify = self
            .in_dialog(SipMethod::Notify)
            .contact(&contact)
            .other("Event", "refer")
            .other("Subscription-State", state)
            .body(SIPFRAG_CONTENT_TYPE, sipfrag.as_bytes().to_vec())
            .build()?;
        self.queue_request(notify);
        Ok(())
    }

    fn respond(&mut self, request: &SipRequest, code: u16, sdp: Option<String>) -> Result<(), SipError> {
        let mut builder = ResponseBuilder::new(code).to_tag(&self.dialog.local_tag);
        if request.method() == Some(SipMethod::Invite) && code > 100 && code < 300 {
            builder = builder.contact(&self.local.contact);
        }
        if code == 405 {
            builder = builder.other("Allow", ALLOWED_METHODS);
        }
        if let Some(sdp) = sdp {
            builder = builder.body(SDP_CONTENT_TYPE, sdp.into_bytes());
        }
        let response = builder
            .header(Header::UserAgent(self.local.user_agent.clone().into()))
            .build_for_request(request)?;

        if request.method() == Some(SipMethod::Invite) && (200..300).contains(&code) {
            self.dialog.confirm();
        }
        self.outbox.push(Outgoing::Response {
            request: request.clone(),
            response,
        });
        Ok(())
    }

    fn authenticate(&mut self, challenge: &SipResponse) -> Result<bool, SipError> {
        let challenge = DigestChallenge::from_response(challenge)?;
        if self.last_nonce.as_deref() == Some(challenge.nonce.as_str()) {
            warn!(call_id = %self.dialog.call_id, "Credentials rejected for realm {}", challenge.realm);
            return Ok(false);
        }
        let Some(credentials) = self
            .credentials
            .iter()
            .find(|c| c.matches_realm(&challenge.realm))
            .cloned()
        else {
            warn!(call_id = %self.dialog.call_id, "No credentials for realm {}", challenge.realm);
            return Ok(false);
        };
        let Some((invite, sdp)) = self.invite.clone() else {
            return Ok(false);
        };

        self.nonce_count += 1;
        self.last_nonce = Some(challenge.nonce.clone());
        let uri = invite.uri().to_string();
        let answer = challenge.authorize(&credentials, "INVITE", &uri, self.nonce_count);
        let request = self.build_invite(&sdp, Some((challenge.answer_header(), answer)))?;
        debug!(call_id = %self.dialog.call_id, "Retrying INVITE with credentials");
        self.queue_request(request);
        Ok(true)
    }

    fn on_response(&mut self, response: &SipResponse) {
        let is_invite = response
            .cseq()
            .map_or(false, |c| c.method == SipMethod::Invite.as_str());
        if is_invite {
            self.dialog.update_from_response(response);
        }
    }

    fn on_request(&mut self, request: &SipRequest) -> bool {
        let (Some(cseq), Some(method)) = (request.cseq(), request.method()) else {
            return false;
        };
        if !self.dialog.check_remote_cseq(cseq.seq, method) {
            warn!(
                call_id = %self.dialog.call_id,
                "Out of order CSeq {} for {}",
                cseq.seq,
                method
            );
            return false;
        }
        // Target refresh
        if method == SipMethod::Invite {
            if let Some(contact) = request.contact_uri() {
                self.dialog.remote_target = contact;
            }
        }
        true
    }

    fn terminate(&mut self) {
        self.dialog.terminate();
    }

    fn take_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }
}
