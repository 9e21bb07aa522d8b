/// STUN binding messages (RFC 5389)
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StunError {
    #[error("Malformed STUN message: {0}")]
    Malformed(String),

    #[error("STUN server returned error {0}")]
    ErrorResponse(u16),

    #[error("STUN transaction ID mismatch")]
    TransactionMismatch,

    #[error("No mapped address in STUN response")]
    NoMappedAddress,

    #[error("STUN I/O error: {0}")]
    Io(String),

    #[error("STUN request to {0} timed out")]
    Timeout(SocketAddr),
}

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;
const BINDING_ERROR_RESPONSE: u16 = 0x0111;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_ERROR_CODE: u16 = 0x0009;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_SOFTWARE: u16 = 0x8022;

pub const MAGIC_COOKIE: u32 = 0x2112A442;
const HEADER_LEN: usize = 20;

/// Outgoing binding request
#[derive(Debug, Clone)]
pub struct BindingRequest {
    pub transaction_id: [u8; 12],
    pub software: Option<String>,
}

impl BindingRequest {
    pub fn new() -> Self {
        Self {
            transaction_id: rand::random(),
            software: None,
        }
    }

    pub fn with_software(mut self, software: &str) -> Self {
        self.software = Some(software.to_string());
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(HEADER_LEN + 64);
        buffer.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
        // Length, patched below
        buffer.extend_from_slice(&0u16.to_be_bytes());
        buffer.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buffer.extend_from_slice(&self.transaction_id);

        if let Some(software) = &self.software {
            buffer.extend_from_slice(&ATTR_SOFTWARE.to_be_bytes());
            buffer.extend_from_slice(&(software.len() as u16).to_be_bytes());
            buffer.extend_from_slice(software.as_bytes());
            let padding = (4 - software.len() % 4) % 4;
            buffer.extend(std::iter::repeat(0u8).take(padding));
        }

        let length = (buffer.len() - HEADER_LEN) as u16;
        buffer[2..4].copy_from_slice(&length.to_be_bytes());
        buffer
    }
}

impl Default for BindingRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// True when the datagram looks like STUN rather than SIP
pub fn is_stun_packet(data: &[u8]) -> bool {
    data.len() >= HEADER_LEN
        && data[0] & 0xC0 == 0
        && u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == MAGIC_COOKIE
}

fn decode_address(data: &[u8], xor: bool, transaction_id: &[u8; 12]) -> Option<SocketAddr> {
    if data.len() < 8 {
        return None;
    }
    let family = data[1];
    let mut port = u16::from_be_bytes([data[2], data[3]]);
    if xor {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match family {
        0x01 => {
            let mut raw = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            if xor {
                raw ^= MAGIC_COOKIE;
            }
            IpAddr::V4(Ipv4Addr::from(raw))
        }
        0x02 if data.len() >= 20 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[4..20]);
            if xor {
                let mut key = [0u8; 16];
                key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                key[4..].copy_from_slice(transaction_id);
                for (octet, k) in octets.iter_mut().zip(key) {
                    *octet ^= k;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

/// Mapped address carried by a binding response to `request`
pub fn parse_binding_response(data: &[u8], request: &BindingRequest) -> Result<SocketAddr, StunError> {
    if data.len() < HEADER_LEN {
        return Err(StunError::Malformed("message too short".to_string()));
    }
    let message_type = u16::from_be_bytes([data[0], data[1]]);
    let length = u16::from_be_bytes([data[2], data[3]]) as usize;
    if u32::from_be_bytes([data[4], data[5], data[6], data[7]]) != MAGIC_COOKIE {
        return Err(StunError::Malformed("invalid magic cookie".to_string()));
    }
    if data[8..20] != request.transaction_id {
        return Err(StunError::TransactionMismatch);
    }
    if data.len() < HEADER_LEN + length {
        return Err(StunError::Malformed("truncated attributes".to_string()));
    }

    let mut mapped = None;
    let mut xor_mapped = None;
    let mut error_code = None;

    let mut offset = HEADER_LEN;
    while offset + 4 <= HEADER_LEN + length {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;
        if offset + attr_len > data.len() {
            break;
        }
        let value = &data[offset..offset + attr_len];
        match attr_type {
            ATTR_MAPPED_ADDRESS => mapped = decode_address(value, false, &request.transaction_id),
            ATTR_XOR_MAPPED_ADDRESS => {
                xor_mapped = decode_address(value, true, &request.transaction_id)
            }
            ATTR_ERROR_CODE if value.len() >= 4 => {
                error_code = Some(u16::from(value[2] & 0x07) * 100 + u16::from(value[3]));
            }
            _ => {}
        }
        offset += attr_len + (4 - attr_len % 4) % 4;
    }

    match message_type {
        BINDING_RESPONSE => xor_mapped.or(mapped).ok_or(StunError::NoMappedAddress),
        BINDING_ERROR_RESPONSE => Err(StunError::ErrorResponse(error_code.unwrap_or(0))),
        other => Err(StunError::Malformed(format!("unexpected message type {:#06x}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(request: &BindingRequest, attr_type: u16, value: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        data.extend_from_slice(&((value.len() + 4) as u16).to_be_bytes());
        data.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        data.extend_from_slice(&request.transaction_id);
        data.extend_from_slice(&attr_type.to_be_bytes());
        data.extend_from_slice(&(value.len() as u16).to_be_bytes());
        data.extend_from_slice(value);
        data
    }

    #[test]
    fn test_request_encoding() {
        let request = BindingRequest::new().with_software("voiplink");
        let bytes = request.to_bytes();
        assert_eq!(&bytes[0..2], &[0x00, 0x01]);
        // 4 header + 8 bytes software
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 12);
        assert!(is_stun_packet(&bytes));
        assert!(!is_stun_packet(b"OPTIONS sip:a SIP/2.0\r\n\r\n"));
    }

    #[test]
    fn test_xor_mapped_address() {
        let request = BindingRequest::new();
        let port = 5060u16 ^ (MAGIC_COOKIE >> 16) as u16;
        let ip = u32::from(Ipv4Addr::new(203, 0, 113, 7)) ^ MAGIC_COOKIE;
        let mut value = vec![0x00, 0x01];
        value.extend_from_slice(&port.to_be_bytes());
        value.extend_from_slice(&ip.to_be_bytes());

        let addr = parse_binding_response(&response(&request, ATTR_XOR_MAPPED_ADDRESS, &value), &request)
            .unwrap();
        assert_eq!(addr, "203.0.113.7:5060".parse().unwrap());
    }

    #[test]
    fn test_plain_mapped_address_and_mismatch() {
        let request = BindingRequest::new();
        let value = [0x00, 0x01, 0x13, 0xc4, 192, 0, 2, 1];
        let data = response(&request, ATTR_MAPPED_ADDRESS, &value);
        assert_eq!(
            parse_binding_response(&data, &request).unwrap(),
            "192.0.2.1:5060".parse().unwrap()
        );

        let other = BindingRequest::new();
        assert_eq!(
            parse_binding_response(&data, &other),
            Err(StunError::TransactionMismatch)
        );
    }
}
