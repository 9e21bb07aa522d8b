//! SIP message builders

use super::message::{header_value, HeaderAccess, SipError, SipMethod, SipRequest, SipResponse};
use rsip::{Header, Headers, Request, Response, StatusCode, Uri, Version};

/// Build a SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    to_tag: Option<String>,
    headers: Vec<Header>,
    body: Vec<u8>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            to_tag: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    /// Tag added to the To header unless the request already carries one
    pub fn to_tag(mut self, tag: &str) -> Self {
        self.to_tag = Some(tag.to_string());
        self
    }

    pub fn contact(mut self, contact: &str) -> Self {
        self.headers.push(Header::Contact(contact.to_string().into()));
        self
    }

    pub fn body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.headers
            .push(Header::ContentType(content_type.to_string().into()));
        self.body = body;
        self
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn other(self, name: &str, value: &str) -> Self {
        self.header(Header::Other(name.to_string(), value.to_string()))
    }

    pub fn build_for_request(self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let mut headers = Vec::new();

        // Copy essential headers from request, Via entries in order
        for header in request.headers().iter() {
            match header {
                Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::CSeq(_) => {
                    headers.push(header.clone());
                }
                Header::RecordRoute(_) if self.status_code > 100 && self.status_code < 300 => {
                    headers.push(header.clone());
                }
                _ => {}
            }
        }

        let to = header_value(request.headers(), "To")
            .ok_or_else(|| SipError::InvalidMessage("Missing To header".to_string()))?;
        let to = match (&self.to_tag, request.to_tag()) {
            (Some(tag), None) if self.status_code > 100 => format!("{};tag={}", to, tag),
            _ => to,
        };
        headers.push(Header::To(to.into()));

        headers.extend(self.headers);
        headers.push(Header::ContentLength(self.body.len().to_string().into()));

        let response = Response {
            status_code: StatusCode::from(self.status_code),
            headers: Headers::from(headers),
            body: self.body,
            version: Version::V2,
        };

        Ok(SipResponse::new(response))
    }
}

/// Build an outgoing SIP request
pub struct RequestBuilder {
    method: SipMethod,
    uri: String,
    via: Option<String>,
    routes: Vec<String>,
    from: Option<String>,
    to: Option<String>,
    call_id: Option<String>,
    cseq: Option<u32>,
    contact: Option<String>,
    headers: Vec<Header>,
    content_type: Option<String>,
    body: Vec<u8>,
}

impl RequestBuilder {
    pub fn new(method: SipMethod, uri: &str) -> Self {
        Self {
            method,
            uri: uri.trim_start_matches('<').trim_end_matches('>').to_string(),
            via: None,
            routes: Vec::new(),
            from: None,
            to: None,
            call_id: None,
            cseq: None,
            contact: None,
            headers: Vec::new(),
            content_type: None,
            body: Vec::new(),
        }
    }

    /// Topmost Via, always asking for rport
    pub fn via(mut self, transport: &str, host: &str, port: u16, branch: &str) -> Self {
        self.via = Some(format!(
            "SIP/2.0/{} {}:{};branch={};rport",
            transport, host, port, branch
        ));
        self
    }

    pub fn routes(mut self, routes: &[String]) -> Self {
        self.routes = routes.to_vec();
        self
    }

    pub fn from(mut self, from: &str) -> Self {
        self.from = Some(from.to_string());
        self
    }

    pub fn to(mut self, to: &str) -> Self {
        self.to = Some(to.to_string());
        self
    }

    pub fn call_id(mut self, call_id: &str) -> Self {
        self.call_id = Some(call_id.to_string());
        self
    }

    pub fn cseq(mut self, seq: u32) -> Self {
        self.cseq = Some(seq);
        self
    }

    pub fn contact(mut self, contact: &str) -> Self {
        self.contact = Some(contact.to_string());
        self
    }

    pub fn user_agent(self, user_agent: &str) -> Self {
        self.header(Header::UserAgent(user_agent.to_string().into()))
    }

    pub fn expires(self, seconds: u32) -> Self {
        self.header(Header::Expires(seconds.to_string().into()))
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn other(self, name: &str, value: &str) -> Self {
        self.header(Header::Other(name.to_string(), value.to_string()))
    }

    pub fn body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.content_type = Some(content_type.to_string());
        self.body = body;
        self
    }

    pub fn build(self) -> Result<SipRequest, SipError> {
        let missing = |name: &str| SipError::InvalidMessage(format!("Missing {} header", name));

        let mut headers = Vec::new();
        headers.push(Header::Via(self.via.ok_or_else(|| missing("Via"))?.into()));
        headers.push(Header::MaxForwards("70".to_string().into()));
        for route in self.routes {
            headers.push(Header::Route(route.into()));
        }
        headers.push(Header::From(self.from.ok_or_else(|| missing("From"))?.into()));
        headers.push(Header::To(self.to.ok_or_else(|| missing("To"))?.into()));
        headers.push(Header::CallId(self.call_id.ok_or_else(|| missing("Call-ID"))?.into()));
        headers.push(Header::CSeq(
            format!("{} {}", self.cseq.ok_or_else(|| missing("CSeq"))?, self.method).into(),
        ));
        if let Some(contact) = self.contact {
            headers.push(Header::Contact(contact.into()));
        }
        headers.extend(self.headers);
        if let Some(content_type) = self.content_type {
            headers.push(Header::ContentType(content_type.into()));
        }
        headers.push(Header::ContentLength(self.body.len().to_string().into()));

        let request = Request {
            method: self.method.to_rsip(),
            uri: Uri::try_from(self.uri.as_str())?,
            version: Version::V2,
            headers: Headers::from(headers),
            body: self.body,
        };
        Ok(SipRequest::new(request))
    }
}

/// Random tag for From/To headers
pub fn generate_tag() -> String {
    format!("{:08x}", rand::random::<u32>())
}

/// Random Call-ID at `host`
pub fn generate_call_id(host: &str) -> String {
    format!("{:016x}@{}", rand::random::<u64>(), host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::message::SipMessage;

    fn build_invite() -> SipRequest {
        RequestBuilder::new(SipMethod::Invite, "<sip:bob@127.0.0.1:5070>")
            .via("UDP", "127.0.0.1", 5060, "z9hG4bKabc")
            .from("<sip:alice@127.0.0.1>;tag=111")
            .to("<sip:bob@127.0.0.1:5070>")
            .call_id("call-1@127.0.0.1")
            .cseq(1)
            .contact("<sip:alice@127.0.0.1:5060>")
            .user_agent("voiplink")
            .body("application/sdp", b"v=0\r\n".to_vec())
            .build()
            .unwrap()
    }

    #[test]
    fn test_request_round_trip() {
        let request = build_invite();
        let parsed = SipMessage::parse(&request.to_bytes()).unwrap();
        let parsed = parsed.as_request().unwrap();

        assert_eq!(parsed.method(), Some(SipMethod::Invite));
        assert_eq!(parsed.via_branch().as_deref(), Some("z9hG4bKabc"));
        assert_eq!(parsed.from_tag().as_deref(), Some("111"));
        assert_eq!(parsed.cseq().unwrap().seq, 1);
        assert_eq!(parsed.content_type().as_deref(), Some("application/sdp"));
        assert_eq!(parsed.body(), b"v=0\r\n");
    }

    #[test]
    fn test_response_adds_to_tag() {
        let request = build_invite();
        let response = ResponseBuilder::new(180)
            .to_tag("222")
            .build_for_request(&request)
            .unwrap();

        assert_eq!(response.status_code(), 180);
        assert_eq!(response.to_tag().as_deref(), Some("222"));
        assert_eq!(response.from_tag().as_deref(), Some("111"));
        assert_eq!(response.call_id().as_deref(), Some("call-1@127.0.0.1"));
        assert_eq!(response.via_branch().as_deref(), Some("z9hG4bKabc"));
    }

    #[test]
    fn test_trying_has_no_tag() {
        let request = build_invite();
        let response = ResponseBuilder::new(100)
            .to_tag("222")
            .build_for_request(&request)
            .unwrap();
        assert_eq!(response.to_tag(), None);
    }

    #[test]
    fn test_missing_header_is_an_error() {
        let result = RequestBuilder::new(SipMethod::Options, "sip:a@b").build();
        assert!(matches!(result, Err(SipError::InvalidMessage(_))));
    }
}
