//! SIP dialog state (RFC 3261 Section 12)

use super::builder::RequestBuilder;
use super::message::{
    header_param, name_addr_uri, HeaderAccess, ReplacesValue, SipError, SipMethod, SipRequest,
    SipResponse,
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    /// Created by a request or a provisional response
    Early,
    Confirmed,
    Terminated,
}

/// Dialog identifiers as seen from this side
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: Option<String>,
}

impl DialogId {
    /// Replaces value pointing at this dialog from the other party's view
    pub fn replaces(&self) -> Option<ReplacesValue> {
        Some(ReplacesValue {
            call_id: self.call_id.clone(),
            to_tag: self.remote_tag.clone()?,
            from_tag: self.local_tag.clone(),
        })
    }
}

/// One dialog, either side
#[derive(Debug, Clone)]
pub struct Dialog {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: Option<String>,
    /// From (UAC) or To (UAS) name-addr without tag
    pub local_uri: String,
    pub remote_uri: String,
    /// Request-URI for in-dialog requests
    pub remote_target: String,
    /// Route headers for in-dialog requests, in order
    pub route_set: Vec<String>,
    pub state: DialogState,
    local_seq: u32,
    remote_seq: Option<u32>,
}

fn strip_tag(value: &str) -> String {
    value
        .split(';')
        .filter(|p| !p.trim().to_ascii_lowercase().starts_with("tag="))
        .collect::<Vec<_>>()
        .join(";")
        .trim()
        .to_string()
}

impl Dialog {
    /// Dialog for a request we are about to send
    pub fn outgoing(call_id: &str, local_tag: &str, local_uri: &str, remote_uri: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            local_tag: local_tag.to_string(),
            remote_tag: None,
            local_uri: local_uri.to_string(),
            remote_uri: remote_uri.to_string(),
            remote_target: name_addr_uri(remote_uri),
            route_set: Vec::new(),
            state: DialogState::Early,
            local_seq: 0,
            remote_seq: None,
        }
    }

    /// Dialog created by a received INVITE
    pub fn incoming(request: &SipRequest, local_tag: &str) -> Result<Self, SipError> {
        let missing = |name: &str| SipError::InvalidMessage(format!("Missing {} header", name));
        let call_id = request.call_id().ok_or_else(|| missing("Call-ID"))?;
        let from = request.from_header().ok_or_else(|| missing("From"))?;
        let to = request.to_header().ok_or_else(|| missing("To"))?;
        let remote_seq = request.cseq().ok_or_else(|| missing("CSeq"))?.seq;

        Ok(Self {
            call_id,
            local_tag: local_tag.to_string(),
            remote_tag: header_param(&from, "tag"),
            local_uri: strip_tag(&to),
            remote_uri: strip_tag(&from),
            remote_target: request
                .contact_uri()
                .unwrap_or_else(|| name_addr_uri(&from)),
            route_set: request.record_routes(),
            state: DialogState::Early,
            local_seq: 0,
            remote_seq: Some(remote_seq),
        })
    }

    pub fn id(&self) -> DialogId {
        DialogId {
            call_id: self.call_id.clone(),
            local_tag: self.local_tag.clone(),
            remote_tag: self.remote_tag.clone(),
        }
    }

    /// UAC side: learn remote tag, target and route set from a response
    /// to our INVITE. The route set is frozen once confirmed.
    pub fn update_from_response(&mut self, response: &SipResponse) {
        let status = response.status_code();
        if status <= 100 || status >= 300 || self.state == DialogState::Terminated {
            return;
        }
        if let Some(tag) = response.to_tag() {
            self.remote_tag = Some(tag);
        }
        if let Some(contact) = response.contact_uri() {
            self.remote_target = contact;
        }
        if self.state == DialogState::Early {
            let mut routes = response.record_routes();
            routes.reverse();
            self.route_set = routes;
        }
        if (200..300).contains(&status) {
            debug!(call_id = %self.call_id, "Dialog confirmed");
            self.state = DialogState::Confirmed;
        }
    }

    pub fn confirm(&mut self) {
        if self.state == DialogState::Early {
            self.state = DialogState::Confirmed;
        }
    }

    pub fn terminate(&mut self) {
        self.state = DialogState::Terminated;
    }

    pub fn next_cseq(&mut self) -> u32 {
        self.local_seq += 1;
        self.local_seq
    }

    pub fn local_cseq(&self) -> u32 {
        self.local_seq
    }

    /// Accept an in-dialog request's CSeq; lower-than-seen ones are rejected
    pub fn check_remote_cseq(&mut self, seq: u32, method: SipMethod) -> bool {
        // ACK and CANCEL reuse the sequence number of what they refer to
        if matches!(method, SipMethod::Ack | SipMethod::Cancel) {
            return true;
        }
        match self.remote_seq {
            Some(current) if seq <= current => false,
            _ => {
                self.remote_seq = Some(seq);
                true
            }
        }
    }

    pub fn from_header(&self) -> String {
        format!("{};tag={}", self.local_uri, self.local_tag)
    }

    pub fn to_header(&self) -> String {
        match &self.remote_tag {
            Some(tag) => format!("{};tag={}", self.remote_uri, tag),
            None => self.remote_uri.clone(),
        }
    }

    /// Request inside this dialog with the next local CSeq
    pub fn request(&mut self, method: SipMethod) -> RequestBuilder {
        let seq = self.next_cseq();
        self.request_with_cseq(method, seq)
    }

    /// Request reusing a sequence number, for ACK and CANCEL
    pub fn request_with_cseq(&self, method: SipMethod, seq: u32) -> RequestBuilder {
        RequestBuilder::new(method, &self.remote_target)
            .routes(&self.route_set)
            .from(&self.from_header())
            .to(&self.to_header())
            .call_id(&self.call_id)
            .cseq(seq)
    }

    /// Whether a Replaces header names this dialog. Its to-tag is the
    /// recipient's own tag.
    pub fn matches_replaces(&self, replaces: &ReplacesValue) -> bool {
        self.call_id == replaces.call_id
            && self.local_tag == replaces.to_tag
            && self.remote_tag.as_deref() == Some(replaces.from_tag.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::builder::ResponseBuilder;

    fn invite() -> SipRequest {
        SipRequest::parse(
            b"INVITE sip:bob@10.0.0.2 SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK1\r\n\
Record-Route: <sip:p1.example.com;lr>, <sip:p2.example.com;lr>\r\n\
From: \"Alice\" <sip:alice@10.0.0.1>;tag=atag\r\n\
To: <sip:bob@10.0.0.2>\r\n\
Call-ID: dlg-1\r\n\
CSeq: 5 INVITE\r\n\
Contact: <sip:alice@10.0.0.1:5060>\r\n\
Content-Length: 0\r\n\r\n",
        )
        .unwrap()
    }

    #[test]
    fn test_incoming_dialog() {
        let mut dialog = Dialog::incoming(&invite(), "btag").unwrap();
        assert_eq!(dialog.remote_tag.as_deref(), Some("atag"));
        assert_eq!(dialog.remote_target, "sip:alice@10.0.0.1:5060");
        assert_eq!(dialog.route_set.len(), 2);
        assert_eq!(dialog.from_header(), "<sip:bob@10.0.0.2>;tag=btag");
        assert_eq!(dialog.to_header(), "\"Alice\" <sip:alice@10.0.0.1>;tag=atag");

        assert!(!dialog.check_remote_cseq(5, SipMethod::Invite));
        assert!(dialog.check_remote_cseq(5, SipMethod::Ack));
        assert!(dialog.check_remote_cseq(6, SipMethod::Bye));
    }

    #[test]
    fn test_outgoing_dialog_learns_from_response() {
        let mut dialog = Dialog::outgoing(
            "dlg-1",
            "atag",
            "<sip:alice@10.0.0.1>",
            "<sip:bob@10.0.0.2>",
        );
        let request = dialog
            .request(SipMethod::Invite)
            .via("UDP", "10.0.0.1", 5060, "z9hG4bK1")
            .build()
            .unwrap();
        assert_eq!(request.cseq().unwrap().seq, 1);

        let response = ResponseBuilder::ok()
            .to_tag("btag")
            .contact("<sip:bob@10.0.0.2:5080>")
            .build_for_request(&request)
            .unwrap();
        dialog.update_from_response(&response);

        assert_eq!(dialog.state, DialogState::Confirmed);
        assert_eq!(dialog.remote_tag.as_deref(), Some("btag"));
        assert_eq!(dialog.remote_target, "sip:bob@10.0.0.2:5080");

        let bye = dialog
            .request(SipMethod::Bye)
            .via("UDP", "10.0.0.1", 5060, "z9hG4bK2")
            .build()
            .unwrap();
        assert_eq!(bye.cseq().unwrap().seq, 2);
        assert_eq!(bye.to_tag().as_deref(), Some("btag"));
    }

    #[test]
    fn test_replaces_matching() {
        let dialog = Dialog::incoming(&invite(), "btag").unwrap();
        let replaces = ReplacesValue {
            call_id: "dlg-1".to_string(),
            to_tag: "btag".to_string(),
            from_tag: "atag".to_string(),
        };
        assert!(dialog.matches_replaces(&replaces));
        // From the remote party's dialog the same value names us
        assert_eq!(
            DialogId {
                call_id: "dlg-1".to_string(),
                local_tag: "atag".to_string(),
                remote_tag: Some("btag".to_string()),
            }
            .replaces(),
            Some(replaces)
        );
    }
}
