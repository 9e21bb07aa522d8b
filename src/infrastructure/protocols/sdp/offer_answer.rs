//! Offer/answer model (RFC 3264)
//!
//! The answer keeps the offer's media count and order. Payload numbers come
//! from the offer: static formats match by number, dynamic ones by encoding.

use super::session::{
    Attribute, Direction, MediaDescription, MediaKind, RtpMap, SdpError, SessionDescription,
};
use crate::infrastructure::media::srtp::CryptoAttribute;
use tracing::{debug, warn};

pub const TELEPHONE_EVENT: &str = "telephone-event";

const PROTO_AVP: &str = "RTP/AVP";
const PROTO_SAVP: &str = "RTP/SAVP";

fn is_telephone_event(rtpmap: Option<&RtpMap>) -> bool {
    rtpmap.map_or(false, |r| r.encoding.eq_ignore_ascii_case(TELEPHONE_EVENT))
}

/// Local rtpmap compatible with an offered payload type
fn match_format(local: &MediaDescription, offered: &MediaDescription, pt: u8) -> Option<RtpMap> {
    let local_maps = local.rtpmaps();
    match offered.rtpmap(pt) {
        Some(remote_map) if pt >= 96 || is_telephone_event(Some(&remote_map)) => local_maps
            .into_iter()
            .find(|l| l.same_encoding(&remote_map)),
        _ => {
            if !local.payload_types().contains(&pt) {
                return None;
            }
            local_maps
                .into_iter()
                .find(|l| l.payload_type == pt)
                .or_else(|| offered.rtpmap(pt))
        }
    }
}

/// Answer crypto line: first offered suite we also offer, carrying our key
fn select_crypto(local: &MediaDescription, offered: &MediaDescription) -> Option<String> {
    let local_lines: Vec<CryptoAttribute> = local
        .crypto_values()
        .iter()
        .filter_map(|line| CryptoAttribute::parse(line).ok())
        .collect();

    for line in offered.crypto_values() {
        let remote = match CryptoAttribute::parse(&line) {
            Ok(remote) => remote,
            Err(e) => {
                warn!("Skipping offered crypto line: {}", e);
                continue;
            }
        };
        if let Some(ours) = local_lines.iter().find(|l| l.crypto_suite == remote.crypto_suite) {
            return Some(format!(
                "{} {} {}:{}",
                remote.tag, ours.crypto_suite, ours.key_method, ours.key_info
            ));
        }
    }
    None
}

fn rejected(offered: &MediaDescription) -> MediaDescription {
    let mut media = MediaDescription::new(offered.kind.clone(), 0, &offered.protocol);
    media.formats = offered.formats.clone();
    media
}

fn answer_media(
    local_session: &SessionDescription,
    local: &MediaDescription,
    offer: &SessionDescription,
    offered: &MediaDescription,
) -> MediaDescription {
    if offered.is_rejected() {
        return rejected(offered);
    }

    let mut formats = Vec::new();
    let mut attributes = Vec::new();
    let mut has_codec = false;

    for pt in offered.payload_types() {
        let Some(local_map) = match_format(local, offered, pt) else {
            continue;
        };
        if !is_telephone_event(Some(&local_map)) {
            has_codec = true;
        }
        let local_pt = local_map.payload_type;
        formats.push(pt.to_string());
        attributes.push(Attribute::value(
            "rtpmap",
            RtpMap {
                payload_type: pt,
                ..local_map
            }
            .to_string(),
        ));
        if let Some(params) = local.fmtp(local_pt) {
            attributes.push(Attribute::value("fmtp", format!("{} {}", pt, params)));
        }
    }

    if !has_codec {
        debug!(kind = offered.kind.as_str(), "No common format, rejecting media");
        return rejected(offered);
    }

    let direction = offer
        .direction_of(offered)
        .answer_with(local_session.direction_of(local));
    attributes.push(Attribute::property(direction.as_str()));

    for attribute in &local.attributes {
        let structural = matches!(attribute.name.as_str(), "rtpmap" | "fmtp" | "crypto")
            || (attribute.value.is_none() && Direction::parse(&attribute.name).is_some());
        if !structural {
            attributes.push(attribute.clone());
        }
    }

    let crypto = if offered.has_attribute("crypto") {
        select_crypto(local, offered)
    } else {
        None
    };
    let protocol = if crypto.is_some() { PROTO_SAVP } else { PROTO_AVP };
    if let Some(line) = crypto {
        attributes.push(Attribute::value("crypto", line));
    }

    MediaDescription {
        kind: offered.kind.clone(),
        port: local.port,
        protocol: protocol.to_string(),
        formats,
        connection: local.connection.clone(),
        attributes,
    }
}

/// Build the answer to `offer` from our capabilities in `local`.
///
/// Fails when the audio stream cannot be accepted.
pub fn create_answer(
    local: &SessionDescription,
    offer: &SessionDescription,
) -> Result<SessionDescription, SdpError> {
    let mut media = Vec::with_capacity(offer.media.len());
    let mut used_local = vec![false; local.media.len()];

    for offered in &offer.media {
        // Pair with the first unused local stream of the same kind
        let local_index = local
            .media
            .iter()
            .enumerate()
            .find(|(i, m)| !used_local[*i] && m.kind == offered.kind)
            .map(|(i, _)| i);

        let answered = match local_index {
            Some(i) => {
                used_local[i] = true;
                answer_media(local, &local.media[i], offer, offered)
            }
            None => rejected(offered),
        };
        media.push(answered);
    }

    let audio_ok = media
        .iter()
        .any(|m| m.kind == MediaKind::Audio && !m.is_rejected());
    if !audio_ok {
        return Err(SdpError::Negotiation("no common audio codec".to_string()));
    }

    Ok(SessionDescription {
        origin: local.origin.clone(),
        session_name: local.session_name.clone(),
        connection: local.connection.clone(),
        timing: (0, 0),
        attributes: Vec::new(),
        media,
    })
}

/// Narrow our offer to what the peer accepted in `answer`.
///
/// Returns the active local session; the answer itself is the active
/// remote session.
pub fn apply_answer(
    local: &SessionDescription,
    answer: &SessionDescription,
) -> Result<SessionDescription, SdpError> {
    if answer.media.len() != local.media.len() {
        return Err(SdpError::Negotiation(format!(
            "answer has {} media, offer had {}",
            answer.media.len(),
            local.media.len()
        )));
    }

    let mut active = local.clone();
    active.media.clear();

    for (ours, theirs) in local.media.iter().zip(&answer.media) {
        if ours.kind != theirs.kind {
            return Err(SdpError::Negotiation(format!(
                "media kind mismatch: {} answered with {}",
                ours.kind.as_str(),
                theirs.kind.as_str()
            )));
        }

        if theirs.is_rejected() {
            if ours.kind == MediaKind::Audio {
                return Err(SdpError::Negotiation("audio rejected by peer".to_string()));
            }
            let mut m = ours.clone();
            m.port = 0;
            active.media.push(m);
            continue;
        }

        let accepted = theirs.payload_types();
        let mut m = ours.clone();
        m.formats.retain(|f| f.parse::<u8>().map_or(false, |pt| accepted.contains(&pt)));
        if m.formats.is_empty() {
            return Err(SdpError::Negotiation(format!(
                "no common {} format in answer",
                ours.kind.as_str()
            )));
        }

        let kept: Vec<String> = m.formats.clone();
        let answered_suite = theirs
            .crypto_values()
            .first()
            .and_then(|line| CryptoAttribute::parse(line).ok())
            .map(|c| c.crypto_suite);

        m.attributes.retain(|a| match a.name.as_str() {
            "rtpmap" | "fmtp" => a
                .value
                .as_deref()
                .and_then(|v| v.split_whitespace().next())
                .map_or(false, |pt| kept.iter().any(|k| k == pt)),
            "crypto" => match (&answered_suite, a.value.as_deref()) {
                (Some(suite), Some(value)) => CryptoAttribute::parse(value)
                    .map_or(false, |c| &c.crypto_suite == suite),
                _ => false,
            },
            _ => true,
        });
        if answered_suite.is_none() {
            m.protocol = PROTO_AVP.to_string();
        }
        active.media.push(m);
    }

    Ok(active)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "d0RmdmcmVCspeEc3QGZiNWpVLFJhQX1cfHAwJSoj";

    fn local() -> SessionDescription {
        SessionDescription::parse(&format!(
            "v=0\r\n\
o=host 1 0 IN IP4 10.0.0.1\r\n\
s=voiplink\r\n\
c=IN IP4 10.0.0.1\r\n\
t=0 0\r\n\
m=audio 20000 RTP/SAVP 9 0 101\r\n\
a=rtpmap:9 G722/8000\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:101 telephone-event/8000\r\n\
a=fmtp:101 0-15\r\n\
a=sendrecv\r\n\
a=crypto:1 AES_CM_128_HMAC_SHA1_80 inline:{key}\r\n\
a=crypto:2 AES_CM_128_HMAC_SHA1_32 inline:{key}\r\n\
m=video 20002 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n\
a=fmtp:96 profile-level-id=428014\r\n\
a=sendrecv\r\n",
            key = KEY
        ))
        .unwrap()
    }

    #[test]
    fn test_answer_keeps_offer_order_and_numbers() {
        let offer = SessionDescription::parse(
            "v=0\r\n\
o=peer 5 5 IN IP4 10.0.0.2\r\n\
s=-\r\n\
c=IN IP4 10.0.0.2\r\n\
t=0 0\r\n\
m=audio 30000 RTP/AVP 8 0 100\r\n\
a=rtpmap:8 PCMA/8000\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:100 telephone-event/8000\r\n\
a=sendonly\r\n\
m=video 30002 RTP/AVP 120\r\n\
a=rtpmap:120 H264/90000\r\n",
        )
        .unwrap();

        let answer = create_answer(&local(), &offer).unwrap();
        assert_eq!(answer.media.len(), 2);

        let audio = &answer.media[0];
        assert_eq!(audio.formats, vec!["0", "100"]);
        assert_eq!(audio.fmtp(100), Some("0-15"));
        assert_eq!(audio.protocol, "RTP/AVP");
        assert_eq!(audio.explicit_direction(), Some(Direction::RecvOnly));
        assert!(!audio.has_attribute("crypto"));

        let video = &answer.media[1];
        assert_eq!(video.kind, MediaKind::Video);
        assert_eq!(video.formats, vec!["120"]);
        assert_eq!(video.rtpmap(120).unwrap().encoding, "H264");
        assert_eq!(video.fmtp(120), Some("profile-level-id=428014"));
    }

    #[test]
    fn test_answer_selects_crypto_with_offer_tag() {
        let offer = SessionDescription::parse(&format!(
            "v=0\r\n\
o=peer 5 5 IN IP4 10.0.0.2\r\n\
s=-\r\n\
c=IN IP4 10.0.0.2\r\n\
t=0 0\r\n\
m=audio 30000 RTP/SAVP 0\r\n\
a=crypto:7 F8_128_HMAC_SHA1_80 inline:{key}\r\n\
a=crypto:8 AES_CM_128_HMAC_SHA1_32 inline:{key}\r\n",
            key = KEY
        ))
        .unwrap();

        let answer = create_answer(&local(), &offer).unwrap();
        let audio = &answer.media[0];
        assert_eq!(audio.protocol, "RTP/SAVP");
        assert_eq!(
            audio.crypto_values(),
            vec![format!("8 AES_CM_128_HMAC_SHA1_32 inline:{}", KEY)]
        );
    }

    #[test]
    fn test_unknown_media_is_rejected_in_place() {
        let offer = SessionDescription::parse(
            "v=0\r\n\
o=peer 5 5 IN IP4 10.0.0.2\r\n\
s=-\r\n\
t=0 0\r\n\
m=application 9 UDP/BFCP *\r\n\
m=audio 30000 RTP/AVP 0\r\n",
        )
        .unwrap();

        let answer = create_answer(&local(), &offer).unwrap();
        assert_eq!(answer.media.len(), 2);
        assert!(answer.media[0].is_rejected());
        assert_eq!(answer.media[1].port, 20000);
    }

    #[test]
    fn test_no_common_audio_fails() {
        let offer = SessionDescription::parse(
            "v=0\r\n\
o=peer 5 5 IN IP4 10.0.0.2\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 30000 RTP/AVP 18 101\r\n\
a=rtpmap:101 telephone-event/8000\r\n",
        )
        .unwrap();

        assert!(matches!(
            create_answer(&local(), &offer),
            Err(SdpError::Negotiation(_))
        ));
    }

    #[test]
    fn test_apply_answer_narrows_offer() {
        let ours = local();
        let answer = SessionDescription::parse(&format!(
            "v=0\r\n\
o=peer 5 5 IN IP4 10.0.0.2\r\n\
s=-\r\n\
c=IN IP4 10.0.0.2\r\n\
t=0 0\r\n\
m=audio 30000 RTP/SAVP 0 101\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:101 telephone-event/8000\r\n\
a=crypto:2 AES_CM_128_HMAC_SHA1_32 inline:{key}\r\n\
m=video 0 RTP/AVP 96\r\n",
            key = KEY
        ))
        .unwrap();

        let active = apply_answer(&ours, &answer).unwrap();
        let audio = active.audio().unwrap();
        assert_eq!(audio.formats, vec!["0", "101"]);
        assert!(audio.rtpmap(9).is_none());
        assert_eq!(audio.crypto_values().len(), 1);
        assert!(audio.crypto_values()[0].contains("AES_CM_128_HMAC_SHA1_32"));
        assert!(active.video().unwrap().is_rejected());
    }

    #[test]
    fn test_apply_answer_media_count_mismatch() {
        let answer = SessionDescription::parse(
            "v=0\r\no=peer 5 5 IN IP4 10.0.0.2\r\ns=-\r\nt=0 0\r\nm=audio 30000 RTP/AVP 0\r\n",
        )
        .unwrap();
        assert!(apply_answer(&local(), &answer).is_err());
    }
}
