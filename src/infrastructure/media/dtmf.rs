//! DTMF digits and their out-of-band (SIP INFO) encoding

/// DTMF digit representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DtmfDigit {
    Zero,
    One,
    Two,
    Three,
    Four,
    Five,
    Six,
    Seven,
    Eight,
    Nine,
    Star,
    Pound,
    A,
    B,
    C,
    D,
}

/// Content type of SIP INFO DTMF bodies
pub const DTMF_RELAY_CONTENT_TYPE: &str = "application/dtmf-relay";

impl DtmfDigit {
    /// Convert to character representation
    pub fn to_char(&self) -> char {
        match self {
            DtmfDigit::Zero => '0',
            DtmfDigit::One => '1',
            DtmfDigit::Two => '2',
            DtmfDigit::Three => '3',
            DtmfDigit::Four => '4',
            DtmfDigit::Five => '5',
            DtmfDigit::Six => '6',
            DtmfDigit::Seven => '7',
            DtmfDigit::Eight => '8',
            DtmfDigit::Nine => '9',
            DtmfDigit::Star => '*',
            DtmfDigit::Pound => '#',
            DtmfDigit::A => 'A',
            DtmfDigit::B => 'B',
            DtmfDigit::C => 'C',
            DtmfDigit::D => 'D',
        }
    }

    /// Parse from character
    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            '0' => Some(DtmfDigit::Zero),
            '1' => Some(DtmfDigit::One),
            '2' => Some(DtmfDigit::Two),
            '3' => Some(DtmfDigit::Three),
            '4' => Some(DtmfDigit::Four),
            '5' => Some(DtmfDigit::Five),
            '6' => Some(DtmfDigit::Six),
            '7' => Some(DtmfDigit::Seven),
            '8' => Some(DtmfDigit::Eight),
            '9' => Some(DtmfDigit::Nine),
            '*' => Some(DtmfDigit::Star),
            '#' => Some(DtmfDigit::Pound),
            'A' => Some(DtmfDigit::A),
            'B' => Some(DtmfDigit::B),
            'C' => Some(DtmfDigit::C),
            'D' => Some(DtmfDigit::D),
            _ => None,
        }
    }

    /// RFC 4733 event code
    pub fn event_code(&self) -> u8 {
        match self {
            DtmfDigit::Zero => 0,
            DtmfDigit::One => 1,
            DtmfDigit::Two => 2,
            DtmfDigit::Three => 3,
            DtmfDigit::Four => 4,
            DtmfDigit::Five => 5,
            DtmfDigit::Six => 6,
            DtmfDigit::Seven => 7,
            DtmfDigit::Eight => 8,
            DtmfDigit::Nine => 9,
            DtmfDigit::Star => 10,
            DtmfDigit::Pound => 11,
            DtmfDigit::A => 12,
            DtmfDigit::B => 13,
            DtmfDigit::C => 14,
            DtmfDigit::D => 15,
        }
    }

    /// `application/dtmf-relay` body for a digit of `duration_ms`
    pub fn info_body(&self, duration_ms: u32) -> String {
        format!("Signal={}\r\nDuration={}\r\n", self.to_char(), duration_ms)
    }

    /// Digit carried in a received `application/dtmf-relay` body
    pub fn from_info_body(body: &str) -> Option<Self> {
        body.lines()
            .filter_map(|line| line.split_once('='))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("signal"))
            .and_then(|(_, value)| value.trim().chars().next())
            .and_then(Self::from_char)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_char_conversion() {
        for c in "0123456789*#ABCD".chars() {
            assert_eq!(DtmfDigit::from_char(c).unwrap().to_char(), c);
        }
        assert_eq!(DtmfDigit::from_char('x'), None);
    }

    #[test]
    fn test_info_body() {
        assert_eq!(DtmfDigit::Five.info_body(140), "Signal=5\r\nDuration=140\r\n");
    }

    #[test]
    fn test_parse_info_body() {
        assert_eq!(DtmfDigit::from_info_body("Signal=#\r\nDuration=250\r\n"), Some(DtmfDigit::Pound));
        assert_eq!(DtmfDigit::from_info_body("Duration=250\r\n"), None);
    }

    #[test]
    fn test_event_codes() {
        assert_eq!(DtmfDigit::Star.event_code(), 10);
        assert_eq!(DtmfDigit::D.event_code(), 15);
    }
}
