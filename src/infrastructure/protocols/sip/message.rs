//! SIP message types and header access

use bytes::Bytes;
use rsip::{Header, Headers, Method, Request, Response, Uri};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Authentication error: {0}")]
    Authentication(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

/// SIP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Info,
    Update,
    Subscribe,
    Notify,
    Refer,
    Message,
    Publish,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Info => "INFO",
            SipMethod::Update => "UPDATE",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Refer => "REFER",
            SipMethod::Message => "MESSAGE",
            SipMethod::Publish => "PUBLISH",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "REGISTER" => Some(SipMethod::Register),
            "INVITE" => Some(SipMethod::Invite),
            "ACK" => Some(SipMethod::Ack),
            "CANCEL" => Some(SipMethod::Cancel),
            "BYE" => Some(SipMethod::Bye),
            "OPTIONS" => Some(SipMethod::Options),
            "INFO" => Some(SipMethod::Info),
            "UPDATE" => Some(SipMethod::Update),
            "SUBSCRIBE" => Some(SipMethod::Subscribe),
            "NOTIFY" => Some(SipMethod::Notify),
            "REFER" => Some(SipMethod::Refer),
            "MESSAGE" => Some(SipMethod::Message),
            "PUBLISH" => Some(SipMethod::Publish),
            _ => None,
        }
    }

    pub fn from_rsip(method: &Method) -> Option<Self> {
        match method {
            Method::Register => Some(SipMethod::Register),
            Method::Invite => Some(SipMethod::Invite),
            Method::Ack => Some(SipMethod::Ack),
            Method::Cancel => Some(SipMethod::Cancel),
            Method::Bye => Some(SipMethod::Bye),
            Method::Options => Some(SipMethod::Options),
            Method::Info => Some(SipMethod::Info),
            Method::Update => Some(SipMethod::Update),
            Method::Subscribe => Some(SipMethod::Subscribe),
            Method::Notify => Some(SipMethod::Notify),
            Method::Refer => Some(SipMethod::Refer),
            Method::Message => Some(SipMethod::Message),
            Method::Publish => Some(SipMethod::Publish),
            _ => None,
        }
    }

    pub fn to_rsip(&self) -> Method {
        match self {
            SipMethod::Register => Method::Register,
            SipMethod::Invite => Method::Invite,
            SipMethod::Ack => Method::Ack,
            SipMethod::Cancel => Method::Cancel,
            SipMethod::Bye => Method::Bye,
            SipMethod::Options => Method::Options,
            SipMethod::Info => Method::Info,
            SipMethod::Update => Method::Update,
            SipMethod::Subscribe => Method::Subscribe,
            SipMethod::Notify => Method::Notify,
            SipMethod::Refer => Method::Refer,
            SipMethod::Message => Method::Message,
            SipMethod::Publish => Method::Publish,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Compact header forms (RFC 3261 section 7.3.3)
fn expand_compact(name: &str) -> &str {
    match name {
        "i" | "I" => "Call-ID",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "v" | "V" => "Via",
        "m" | "M" => "Contact",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        "o" | "O" => "Event",
        "r" | "R" => "Refer-To",
        "b" | "B" => "Referred-By",
        "k" | "K" => "Supported",
        other => other,
    }
}

/// Split a rendered header into name and value
fn split_header(header: &Header) -> Option<(String, String)> {
    let rendered = header.to_string();
    let (name, value) = rendered.split_once(':')?;
    Some((
        expand_compact(name.trim()).to_string(),
        value.trim().to_string(),
    ))
}

/// All values of a header, in message order
pub fn header_values(headers: &Headers, name: &str) -> Vec<String> {
    headers
        .iter()
        .filter_map(split_header)
        .filter(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
        .collect()
}

/// First value of a header
pub fn header_value(headers: &Headers, name: &str) -> Option<String> {
    headers
        .iter()
        .filter_map(split_header)
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}

/// `;name=value` parameter of a header value, outside the `<...>` part
pub fn header_param(value: &str, name: &str) -> Option<String> {
    let params = match value.rfind('>') {
        Some(end) => &value[end + 1..],
        None => value.split_once(';').map(|(_, p)| p).unwrap_or(""),
    };
    params
        .split(';')
        .filter_map(|p| {
            let p = p.trim();
            match p.split_once('=') {
                Some((k, v)) => Some((k.trim(), v.trim())),
                None => Some((p, "")),
            }
        })
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.to_string())
}

/// URI inside a name-addr (`"Bob" <sip:bob@host>;tag=x`) or a bare addr-spec
pub fn name_addr_uri(value: &str) -> String {
    match (value.find('<'), value.find('>')) {
        (Some(start), Some(end)) if start < end => value[start + 1..end].trim().to_string(),
        _ => value.split(';').next().unwrap_or(value).trim().to_string(),
    }
}

/// Quoted display name of a name-addr
pub fn display_name(value: &str) -> Option<String> {
    let before = &value[..value.find('<')?];
    let name = before.trim().trim_matches('"').trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Parsed `CSeq` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeqValue {
    pub seq: u32,
    pub method: String,
}

impl CSeqValue {
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split_whitespace();
        Some(Self {
            seq: parts.next()?.parse().ok()?,
            method: parts.next()?.to_ascii_uppercase(),
        })
    }
}

/// Header accessors shared by requests and responses
pub trait HeaderAccess {
    fn headers(&self) -> &Headers;

    fn header(&self, name: &str) -> Option<String> {
        header_value(self.headers(), name)
    }

    fn call_id(&self) -> Option<String> {
        self.header("Call-ID")
    }

    fn from_header(&self) -> Option<String> {
        self.header("From")
    }

    fn to_header(&self) -> Option<String> {
        self.header("To")
    }

    fn from_tag(&self) -> Option<String> {
        self.from_header().and_then(|v| header_param(&v, "tag"))
    }

    fn to_tag(&self) -> Option<String> {
        self.to_header().and_then(|v| header_param(&v, "tag"))
    }

    fn cseq(&self) -> Option<CSeqValue> {
        self.header("CSeq").and_then(|v| CSeqValue::parse(&v))
    }

    /// Topmost Via
    fn top_via(&self) -> Option<String> {
        self.header("Via")
    }

    fn via_branch(&self) -> Option<String> {
        self.top_via().and_then(|v| header_param(&v, "branch"))
    }

    fn content_type(&self) -> Option<String> {
        self.header("Content-Type")
            .map(|v| v.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
    }

    fn contact_uri(&self) -> Option<String> {
        self.header("Contact").map(|v| name_addr_uri(&v))
    }

    /// Record-Route entries, one per route even when comma-joined
    fn record_routes(&self) -> Vec<String> {
        header_values(self.headers(), "Record-Route")
            .iter()
            .flat_map(|v| v.split(','))
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect()
    }
}

/// SIP Request wrapper
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Ok(Self::new(request))
    }

    pub fn method(&self) -> Option<SipMethod> {
        SipMethod::from_rsip(&self.inner.method)
    }

    pub fn method_name(&self) -> String {
        self.inner.method.to_string()
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn body_str(&self) -> Option<&str> {
        if self.inner.body.is_empty() {
            None
        } else {
            std::str::from_utf8(&self.inner.body).ok()
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

impl HeaderAccess for SipRequest {
    fn headers(&self) -> &Headers {
        &self.inner.headers
    }
}

/// SIP Response wrapper
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn reason(&self) -> String {
        let rendered = self.inner.status_code.to_string();
        rendered
            .split_once(' ')
            .map(|(_, reason)| reason.to_string())
            .unwrap_or_default()
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn body_str(&self) -> Option<&str> {
        if self.inner.body.is_empty() {
            None
        } else {
            std::str::from_utf8(&self.inner.body).ok()
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.status_code() < 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code())
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

impl HeaderAccess for SipResponse {
    fn headers(&self) -> &Headers {
        &self.inner.headers
    }
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        if data.starts_with(b"SIP/2.0 ") {
            return SipResponse::parse(data).map(SipMessage::Response);
        }
        SipRequest::parse(data).map(SipMessage::Request)
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, SipMessage::Response(_))
    }

    pub fn as_request(&self) -> Option<&SipRequest> {
        match self {
            SipMessage::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&SipResponse> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}

/// Standard reason phrase for a status code
pub fn reason_phrase(code: u16) -> String {
    let rendered = rsip::StatusCode::from(code).to_string();
    rendered
        .split_once(' ')
        .map(|(_, reason)| reason.to_string())
        .unwrap_or_default()
}

/// Dialog identifiers carried in a `Replaces` header (RFC 3891)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacesValue {
    pub call_id: String,
    pub to_tag: String,
    pub from_tag: String,
}

impl ReplacesValue {
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split(';');
        let call_id = parts.next()?.trim().to_string();
        let mut to_tag = None;
        let mut from_tag = None;
        for part in parts {
            match part.trim().split_once('=') {
                Some(("to-tag", v)) => to_tag = Some(v.to_string()),
                Some(("from-tag", v)) => from_tag = Some(v.to_string()),
                _ => {}
            }
        }
        if call_id.is_empty() {
            return None;
        }
        Some(Self {
            call_id,
            to_tag: to_tag?,
            from_tag: from_tag?,
        })
    }

    /// Escaped form used as a URI header parameter
    pub fn to_uri_header(&self) -> String {
        format!(
            "Replaces={}%3Bto-tag%3D{}%3Bfrom-tag%3D{}",
            escape_uri_header(&self.call_id),
            self.to_tag,
            self.from_tag
        )
    }
}

impl fmt::Display for ReplacesValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};to-tag={};from-tag={}", self.call_id, self.to_tag, self.from_tag)
    }
}

fn escape_uri_header(value: &str) -> String {
    value
        .replace('%', "%25")
        .replace('@', "%40")
        .replace(';', "%3B")
        .replace('=', "%3D")
}

/// Decode the `%XX` escapes of a URI header value
pub fn unescape_uri(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
            if let Ok(byte) = u8::from_str_radix(hex, 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Split `sip:bob@host?Replaces=...` into the bare target and its Replaces
pub fn split_refer_target(target: &str) -> (String, Option<ReplacesValue>) {
    let uri = name_addr_uri(target);
    match uri.split_once('?') {
        Some((base, headers)) => {
            let replaces = headers
                .split('&')
                .filter_map(|h| h.split_once('='))
                .find(|(k, _)| k.eq_ignore_ascii_case("Replaces"))
                .and_then(|(_, v)| ReplacesValue::parse(&unescape_uri(v)));
            (base.to_string(), replaces)
        }
        None => (uri, None),
    }
}
