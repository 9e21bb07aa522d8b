//! SDP session description model (RFC 4566)

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SdpError {
    #[error("SDP parse error: {0}")]
    Parse(String),

    #[error("No local session description")]
    MissingLocal,

    #[error("No remote session description")]
    MissingRemote,

    #[error("SDP negotiation failed: {0}")]
    Negotiation(String),
}

/// Media kind of an `m=` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
    Other(String),
}

impl MediaKind {
    pub fn parse(value: &str) -> Self {
        match value {
            "audio" => MediaKind::Audio,
            "video" => MediaKind::Video,
            other => MediaKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Other(other) => other,
        }
    }
}

/// Stream direction attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    pub const ATTRIBUTES: [&'static str; 4] = ["sendrecv", "sendonly", "recvonly", "inactive"];

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "sendrecv" => Some(Direction::SendRecv),
            "sendonly" => Some(Direction::SendOnly),
            "recvonly" => Some(Direction::RecvOnly),
            "inactive" => Some(Direction::Inactive),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        }
    }

    /// The same stream seen from the other end
    pub fn reverse(&self) -> Self {
        match self {
            Direction::SendRecv => Direction::SendRecv,
            Direction::SendOnly => Direction::RecvOnly,
            Direction::RecvOnly => Direction::SendOnly,
            Direction::Inactive => Direction::Inactive,
        }
    }

    /// Direction an answerer with `local` capability puts in its answer
    /// to an offer carrying `self`.
    pub fn answer_with(&self, local: Direction) -> Direction {
        match (self.reverse(), local) {
            (Direction::Inactive, _) | (_, Direction::Inactive) => Direction::Inactive,
            (Direction::SendRecv, d) | (d, Direction::SendRecv) => d,
            (a, b) if a == b => a,
            _ => Direction::Inactive,
        }
    }
}

/// `a=` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub value: Option<String>,
}

impl Attribute {
    pub fn property(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value: None,
        }
    }

    pub fn value(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: Some(value.into()),
        }
    }

    fn parse(line: &str) -> Self {
        match line.split_once(':') {
            Some((name, value)) => Self::value(name, value.trim()),
            None => Self::property(line),
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "a={}:{}", self.name, value),
            None => write!(f, "a={}", self.name),
        }
    }
}

/// Parsed `a=rtpmap` value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub payload_type: u8,
    pub encoding: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
}

impl RtpMap {
    /// Parse `96 H264/90000` or `0 PCMU/8000/1`
    pub fn parse(value: &str) -> Option<Self> {
        let (pt, encoding) = value.trim().split_once(' ')?;
        let mut parts = encoding.trim().split('/');
        let name = parts.next()?.to_string();
        let clock_rate = parts.next()?.parse().ok()?;
        let channels = parts.next().and_then(|c| c.parse().ok());
        Some(Self {
            payload_type: pt.parse().ok()?,
            encoding: name,
            clock_rate,
            channels,
        })
    }

    pub fn same_encoding(&self, other: &RtpMap) -> bool {
        self.encoding.eq_ignore_ascii_case(&other.encoding)
            && self.clock_rate == other.clock_rate
            && self.channels.unwrap_or(1) == other.channels.unwrap_or(1)
    }
}

impl fmt::Display for RtpMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.payload_type, self.encoding, self.clock_rate)?;
        if let Some(channels) = self.channels {
            write!(f, "/{}", channels)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub username: String,
    pub session_id: u64,
    pub session_version: u64,
    pub address_type: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub address_type: String,
    pub address: String,
}

impl Connection {
    pub fn ip4(address: impl Into<String>) -> Self {
        Self {
            address_type: "IP4".to_string(),
            address: address.into(),
        }
    }
}

/// One `m=` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    pub kind: MediaKind,
    pub port: u16,
    pub protocol: String,
    pub formats: Vec<String>,
    pub connection: Option<Connection>,
    pub attributes: Vec<Attribute>,
}

impl MediaDescription {
    pub fn new(kind: MediaKind, port: u16, protocol: &str) -> Self {
        Self {
            kind,
            port,
            protocol: protocol.to_string(),
            formats: Vec::new(),
            connection: None,
            attributes: Vec::new(),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn attribute_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.attributes
            .iter()
            .filter(move |a| a.name == name)
            .filter_map(|a| a.value.as_deref())
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attribute(name).is_some()
    }

    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    pub fn remove_attribute(&mut self, name: &str) {
        self.attributes.retain(|a| a.name != name);
    }

    pub fn rtpmaps(&self) -> Vec<RtpMap> {
        self.attribute_values("rtpmap").filter_map(RtpMap::parse).collect()
    }

    pub fn rtpmap(&self, payload_type: u8) -> Option<RtpMap> {
        self.rtpmaps().into_iter().find(|r| r.payload_type == payload_type)
    }

    /// fmtp parameters of a payload type
    pub fn fmtp(&self, payload_type: u8) -> Option<&str> {
        let prefix = payload_type.to_string();
        self.attribute_values("fmtp").find_map(|value| {
            value
                .split_once(' ')
                .filter(|(pt, _)| *pt == prefix)
                .map(|(_, params)| params)
        })
    }

    /// Explicit direction attribute, if any
    pub fn explicit_direction(&self) -> Option<Direction> {
        self.attributes
            .iter()
            .filter(|a| a.value.is_none())
            .find_map(|a| Direction::parse(&a.name))
    }

    /// Replace every direction attribute by `direction`
    pub fn set_direction(&mut self, direction: Direction) {
        self.attributes
            .retain(|a| !(a.value.is_none() && Direction::parse(&a.name).is_some()));
        self.attributes.push(Attribute::property(direction.as_str()));
    }

    /// `a=crypto` values
    pub fn crypto_values(&self) -> Vec<String> {
        self.attribute_values("crypto").map(str::to_string).collect()
    }

    pub fn is_rejected(&self) -> bool {
        self.port == 0
    }

    /// Payload numbers of the format list
    pub fn payload_types(&self) -> Vec<u8> {
        self.formats.iter().filter_map(|f| f.parse().ok()).collect()
    }
}

/// Complete session description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub origin: Origin,
    pub session_name: String,
    pub connection: Option<Connection>,
    pub timing: (u64, u64),
    pub attributes: Vec<Attribute>,
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    /// Parse SDP from string
    pub fn parse(body: &str) -> Result<Self, SdpError> {
        let mut version_seen = false;
        let mut origin = None;
        let mut session_name = String::new();
        let mut connection = None;
        let mut timing = (0, 0);
        let mut attributes = Vec::new();
        let mut media: Vec<MediaDescription> = Vec::new();

        for raw in body.lines() {
            let line = raw.trim_end_matches('\r').trim();
            if line.is_empty() {
                continue;
            }
            if line.len() < 2 || line.as_bytes()[1] != b'=' {
                return Err(SdpError::Parse(format!("invalid line '{}'", line)));
            }

            let (field_type, value) = line.split_at(2);
            let value = value.trim();

            match field_type {
                "v=" => {
                    if value != "0" {
                        return Err(SdpError::Parse(format!("unsupported version {}", value)));
                    }
                    version_seen = true;
                }
                "o=" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() < 6 {
                        return Err(SdpError::Parse(format!("invalid origin '{}'", value)));
                    }
                    origin = Some(Origin {
                        username: parts[0].to_string(),
                        session_id: parts[1]
                            .parse()
                            .map_err(|_| SdpError::Parse(format!("invalid session id '{}'", parts[1])))?,
                        session_version: parts[2]
                            .parse()
                            .map_err(|_| SdpError::Parse(format!("invalid session version '{}'", parts[2])))?,
                        address_type: parts[4].to_string(),
                        address: parts[5].to_string(),
                    });
                }
                "s=" => session_name = value.to_string(),
                "c=" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() < 3 {
                        return Err(SdpError::Parse(format!("invalid connection '{}'", value)));
                    }
                    let conn = Connection {
                        address_type: parts[1].to_string(),
                        // Drop a multicast TTL suffix
                        address: parts[2].split('/').next().unwrap_or(parts[2]).to_string(),
                    };
                    match media.last_mut() {
                        Some(m) => m.connection = Some(conn),
                        None => connection = Some(conn),
                    }
                }
                "t=" => {
                    let mut parts = value.split_whitespace().map(|p| p.parse::<u64>());
                    if let (Some(Ok(start)), Some(Ok(stop))) = (parts.next(), parts.next()) {
                        timing = (start, stop);
                    }
                }
                "m=" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() < 3 {
                        return Err(SdpError::Parse(format!("invalid media '{}'", value)));
                    }
                    // Port may carry a "/count" suffix
                    let port_str = parts[1].split('/').next().unwrap_or(parts[1]);
                    let port = port_str
                        .parse()
                        .map_err(|_| SdpError::Parse(format!("invalid port '{}'", parts[1])))?;
                    let mut m = MediaDescription::new(MediaKind::parse(parts[0]), port, parts[2]);
                    m.formats = parts[3..].iter().map(|s| s.to_string()).collect();
                    media.push(m);
                }
                "a=" => {
                    let attribute = Attribute::parse(value);
                    match media.last_mut() {
                        Some(m) => m.attributes.push(attribute),
                        None => attributes.push(attribute),
                    }
                }
                // b=, i=, u=, e=, p=, k=, z=, r= are not needed
                _ => {}
            }
        }

        if !version_seen {
            return Err(SdpError::Parse("missing v= line".to_string()));
        }
        let origin = origin.ok_or_else(|| SdpError::Parse("missing o= line".to_string()))?;

        Ok(Self {
            origin,
            session_name,
            connection,
            timing,
            attributes,
            media,
        })
    }

    pub fn audio(&self) -> Option<&MediaDescription> {
        self.media.iter().find(|m| m.kind == MediaKind::Audio)
    }

    pub fn audio_mut(&mut self) -> Option<&mut MediaDescription> {
        self.media.iter_mut().find(|m| m.kind == MediaKind::Audio)
    }

    pub fn video(&self) -> Option<&MediaDescription> {
        self.media.iter().find(|m| m.kind == MediaKind::Video)
    }

    pub fn video_mut(&mut self) -> Option<&mut MediaDescription> {
        self.media.iter_mut().find(|m| m.kind == MediaKind::Video)
    }

    /// Connection for a media section, falling back to the session level
    pub fn connection_for<'a>(&'a self, media: &'a MediaDescription) -> Option<&'a Connection> {
        media.connection.as_ref().or(self.connection.as_ref())
    }

    /// Effective direction of a media section
    pub fn direction_of(&self, media: &MediaDescription) -> Direction {
        media
            .explicit_direction()
            .or_else(|| {
                self.attributes
                    .iter()
                    .filter(|a| a.value.is_none())
                    .find_map(|a| Direction::parse(&a.name))
            })
            .unwrap_or(Direction::SendRecv)
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v=0\r\n")?;
        write!(
            f,
            "o={} {} {} IN {} {}\r\n",
            self.origin.username,
            self.origin.session_id,
            self.origin.session_version,
            self.origin.address_type,
            self.origin.address
        )?;
        let name = if self.session_name.is_empty() {
            "-"
        } else {
            self.session_name.as_str()
        };
        write!(f, "s={}\r\n", name)?;
        if let Some(c) = &self.connection {
            write!(f, "c=IN {} {}\r\n", c.address_type, c.address)?;
        }
        write!(f, "t={} {}\r\n", self.timing.0, self.timing.1)?;
        for attribute in &self.attributes {
            write!(f, "{}\r\n", attribute)?;
        }

        for m in &self.media {
            write!(f, "m={} {} {}", m.kind.as_str(), m.port, m.protocol)?;
            for format in &m.formats {
                write!(f, " {}", format)?;
            }
            write!(f, "\r\n")?;
            if let Some(c) = &m.connection {
                write!(f, "c=IN {} {}\r\n", c.address_type, c.address)?;
            }
            for attribute in &m.attributes {
                write!(f, "{}\r\n", attribute)?;
            }
        }
        Ok(())
    }
}
