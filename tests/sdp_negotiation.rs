//! SDP offer/answer between two negotiators exchanging SDP text

use voiplink::infrastructure::media::{AudioCodec, CodecRegistry, VideoCodec};
use voiplink::infrastructure::protocols::sdp::{
    Direction, MediaKind, NegotiationState, SdpNegotiator, SessionDescription,
};

fn endpoint(ip: &str, audio_port: u16) -> SdpNegotiator {
    let mut nego = SdpNegotiator::new(CodecRegistry::new(), "voiplink", "voiplink", ip);
    nego.set_local_ports(audio_port, audio_port + 2);
    nego
}

fn audio(payloads: &[u8]) -> Vec<AudioCodec> {
    CodecRegistry::new().resolve_audio(payloads)
}

fn video(names: &[&str]) -> Vec<VideoCodec> {
    CodecRegistry::new().resolve_video(names.iter().copied())
}

/// What actually travels in the INVITE or 200 body
fn over_the_wire(session: &SessionDescription) -> SessionDescription {
    SessionDescription::parse(&session.to_string()).unwrap()
}

#[test]
fn test_offer_answer_agrees_on_common_codec() {
    let mut alice = endpoint("10.0.0.1", 20000);
    let mut bob = endpoint("10.0.0.2", 30000);

    let offer = over_the_wire(alice.create_offer(&audio(&[0, 8]), &video(&["H264"])));
    bob.receive_offer(Some(&offer), &audio(&[8, 9]), &video(&["H264"]))
        .unwrap();
    bob.start_negotiation().unwrap();

    let answer = over_the_wire(bob.active_local().unwrap());
    assert_eq!(answer.media.len(), offer.media.len());
    assert_eq!(answer.media[0].kind, MediaKind::Audio);
    assert_eq!(answer.media[1].kind, MediaKind::Video);
    assert_eq!(bob.session_audio_codec().unwrap().name, "PCMA");
    assert_eq!(bob.session_video_codec(), Some("H264"));

    alice.receive_answer(&answer).unwrap();
    alice.start_negotiation().unwrap();

    assert_eq!(alice.state(), NegotiationState::Done);
    assert_eq!(alice.session_audio_codec().unwrap().name, "PCMA");
    assert_eq!(alice.telephone_event_payload(), 101);
    assert_eq!(alice.remote_ip(), Some("10.0.0.2"));
    assert_eq!(alice.remote_audio_port(), 30000);
    assert_eq!(bob.remote_audio_port(), 20000);
}

#[test]
fn test_unmodified_self_answer_is_idempotent() {
    let mut nego = endpoint("10.0.0.1", 20000);
    let offer = nego.create_offer(&audio(&[0, 8]), &[]).clone();

    nego.receive_offer(Some(&over_the_wire(&offer)), &[], &[]).unwrap();
    nego.start_negotiation().unwrap();

    assert_eq!(nego.active_local(), Some(&offer));
}

#[test]
fn test_g722_is_advertised_at_8000() {
    let mut alice = endpoint("10.0.0.1", 20000);
    let text = alice.create_offer(&audio(&[9]), &[]).to_string();
    assert!(text.contains("a=rtpmap:9 G722/8000\r\n"));
    assert!(!text.contains("G722/16000"));

    let mut bob = endpoint("10.0.0.2", 30000);
    bob.receive_offer(Some(&SessionDescription::parse(&text).unwrap()), &audio(&[9]), &[])
        .unwrap();
    bob.start_negotiation().unwrap();
    let codec = bob.session_audio_codec().unwrap();
    assert_eq!(codec.name, "G722");
    assert_eq!(codec.clock_rate, 16000);
}

#[test]
fn test_no_common_audio_fails_negotiation() {
    let mut alice = endpoint("10.0.0.1", 20000);
    let offer = over_the_wire(alice.create_offer(&audio(&[18]), &[]));

    let mut bob = endpoint("10.0.0.2", 30000);
    bob.receive_offer(Some(&offer), &audio(&[8]), &[]).unwrap();
    assert!(bob.start_negotiation().is_err());
}

#[test]
fn test_hold_and_resume_keep_codec() {
    let mut alice = endpoint("10.0.0.1", 20000);
    let mut bob = endpoint("10.0.0.2", 30000);

    let offer = over_the_wire(alice.create_offer(&audio(&[8, 0]), &[]));
    bob.receive_offer(Some(&offer), &audio(&[0, 8]), &[]).unwrap();
    bob.start_negotiation().unwrap();
    alice
        .receive_answer(&over_the_wire(bob.active_local().unwrap()))
        .unwrap();
    alice.start_negotiation().unwrap();
    assert_eq!(alice.session_audio_codec().unwrap().name, "PCMA");

    // Hold: sendonly offer, recvonly answer
    let held = over_the_wire(alice.hold().unwrap());
    bob.receive_offer(Some(&held), &[], &[]).unwrap();
    bob.start_negotiation().unwrap();
    let answer = over_the_wire(bob.active_local().unwrap());
    assert_eq!(answer.direction_of(&answer.media[0]), Direction::RecvOnly);
    alice.receive_answer(&answer).unwrap();
    alice.start_negotiation().unwrap();

    // Resume restores sendrecv with the same codec
    let resumed = over_the_wire(alice.resume().unwrap());
    bob.receive_offer(Some(&resumed), &[], &[]).unwrap();
    bob.start_negotiation().unwrap();
    let answer = over_the_wire(bob.active_local().unwrap());
    assert_eq!(answer.direction_of(&answer.media[0]), Direction::SendRecv);
    alice.receive_answer(&answer).unwrap();
    alice.start_negotiation().unwrap();

    assert_eq!(alice.session_audio_codec().unwrap().name, "PCMA");
    assert_eq!(alice.round(), 3);
}
