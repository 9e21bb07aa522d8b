//! Two links calling each other over real UDP on 127.0.0.1

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;
use voiplink::config::Config;
use voiplink::domain::call::CallStatus;
use voiplink::domain::shared::value_objects::{AccountId, CallId};
use voiplink::infrastructure::media::RecordingMediaFactory;
use voiplink::{Signal, SipVoipLink};

async fn loopback_link() -> SipVoipLink {
    let mut config = Config::default();
    config.sip.interface = "127.0.0.1".to_string();
    config.sip.port = 0;
    config.sip.shutdown_grace_secs = 1;
    let link = SipVoipLink::new(&config, Arc::new(RecordingMediaFactory::new()))
        .await
        .unwrap();
    link.start().await.unwrap();
    link
}

async fn wait_for<F>(signals: &mut broadcast::Receiver<Signal>, mut wanted: F) -> Signal
where
    F: FnMut(&Signal) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            match signals.recv().await {
                Ok(signal) if wanted(&signal) => return signal,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("signal channel closed"),
            }
        }
    })
    .await
    .expect("signal not received in time")
}

async fn wait_for_state(signals: &mut broadcast::Receiver<Signal>, call: CallId, wanted: CallStatus) {
    wait_for(signals, |signal| {
        matches!(signal, Signal::CallStateChanged { call_id, state, .. } if *call_id == call && *state == wanted)
    })
    .await;
}

#[tokio::test]
async fn test_call_hold_dtmf_hangup() {
    let alice = loopback_link().await;
    let bob = loopback_link().await;
    alice
        .update_account(&AccountId::ip2ip(), |account| {
            account.dtmf_type = "sipinfo".to_string();
        })
        .await
        .unwrap();

    let mut alice_signals = alice.subscribe();
    let mut bob_signals = bob.subscribe();
    let bob_addr = bob.local_addr().await.unwrap();

    let outgoing = alice
        .place_call(&AccountId::ip2ip(), &format!("sip:bob@{}", bob_addr))
        .await
        .unwrap();

    let incoming = match wait_for(&mut bob_signals, |s| matches!(s, Signal::IncomingCall { .. })).await {
        Signal::IncomingCall { account_id, call_id, .. } => {
            assert!(account_id.is_ip2ip());
            call_id
        }
        _ => unreachable!(),
    };
    wait_for_state(&mut alice_signals, outgoing, CallStatus::Ringing).await;

    bob.answer(&incoming).await.unwrap();
    wait_for_state(&mut bob_signals, incoming, CallStatus::Current).await;
    wait_for_state(&mut alice_signals, outgoing, CallStatus::Current).await;

    alice.hold(&outgoing).await.unwrap();
    wait_for_state(&mut alice_signals, outgoing, CallStatus::Hold).await;
    alice.resume(&outgoing).await.unwrap();
    wait_for_state(&mut alice_signals, outgoing, CallStatus::Unhold).await;

    alice.send_dtmf(&outgoing, '5').await.unwrap();
    let dtmf = wait_for(&mut bob_signals, |s| matches!(s, Signal::IncomingDtmf { .. })).await;
    assert_eq!(
        dtmf,
        Signal::IncomingDtmf {
            call_id: incoming,
            digit: '5'
        }
    );

    alice.send_text_message(&outgoing, "ping").await.unwrap();
    let message = wait_for(&mut bob_signals, |s| matches!(s, Signal::IncomingMessage { .. })).await;
    match message {
        Signal::IncomingMessage { call_id, from, text } => {
            assert_eq!(call_id, incoming);
            assert!(from.starts_with("sip:"));
            assert_eq!(text, "ping");
        }
        other => panic!("unexpected signal {:?}", other),
    }

    alice.hangup(&outgoing).await.unwrap();
    wait_for_state(&mut alice_signals, outgoing, CallStatus::Hungup).await;
    wait_for_state(&mut bob_signals, incoming, CallStatus::Hungup).await;
    assert!(alice.active_calls().await.is_empty());
    assert!(bob.active_calls().await.is_empty());

    alice.shutdown().await.unwrap();
    bob.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_refused_call_fails_for_caller() {
    let alice = loopback_link().await;
    let bob = loopback_link().await;
    let mut alice_signals = alice.subscribe();
    let mut bob_signals = bob.subscribe();
    let bob_addr = bob.local_addr().await.unwrap();

    let outgoing = alice
        .place_call(&AccountId::ip2ip(), &bob_addr.to_string())
        .await
        .unwrap();
    let incoming = match wait_for(&mut bob_signals, |s| matches!(s, Signal::IncomingCall { .. })).await {
        Signal::IncomingCall { call_id, .. } => call_id,
        _ => unreachable!(),
    };

    bob.refuse(&incoming).await.unwrap();
    let failed = wait_for(&mut alice_signals, |s| {
        matches!(s, Signal::CallStateChanged { call_id, state: CallStatus::Failure | CallStatus::Busy, .. } if *call_id == outgoing)
    })
    .await;
    match failed {
        Signal::CallStateChanged { sip_status, .. } => {
            assert_eq!(sip_status.map(|(code, _)| code), Some(603));
        }
        _ => unreachable!(),
    }

    alice.shutdown().await.unwrap();
    bob.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_hangs_up_live_calls() {
    let alice = loopback_link().await;
    let bob = loopback_link().await;
    let mut bob_signals = bob.subscribe();
    let bob_addr = bob.local_addr().await.unwrap();

    alice
        .place_call(&AccountId::ip2ip(), &bob_addr.to_string())
        .await
        .unwrap();
    let incoming = match wait_for(&mut bob_signals, |s| matches!(s, Signal::IncomingCall { .. })).await {
        Signal::IncomingCall { call_id, .. } => call_id,
        _ => unreachable!(),
    };
    bob.answer(&incoming).await.unwrap();
    wait_for_state(&mut bob_signals, incoming, CallStatus::Current).await;

    alice.shutdown().await.unwrap();
    wait_for_state(&mut bob_signals, incoming, CallStatus::Hungup).await;
    assert!(!alice.is_running());

    bob.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_blind_transfer_dials_target_and_drops_referrer() {
    let alice = loopback_link().await;
    let bob = loopback_link().await;
    let carol = loopback_link().await;
    let mut alice_signals = alice.subscribe();
    let mut bob_signals = bob.subscribe();
    let mut carol_signals = carol.subscribe();
    let bob_addr = bob.local_addr().await.unwrap();
    let carol_addr = carol.local_addr().await.unwrap();

    let outgoing = alice
        .place_call(&AccountId::ip2ip(), &format!("sip:bob@{}", bob_addr))
        .await
        .unwrap();
    let incoming = match wait_for(&mut bob_signals, |s| matches!(s, Signal::IncomingCall { .. })).await {
        Signal::IncomingCall { call_id, .. } => call_id,
        _ => unreachable!(),
    };
    bob.answer(&incoming).await.unwrap();
    wait_for_state(&mut alice_signals, outgoing, CallStatus::Current).await;

    bob.transfer(&incoming, &format!("sip:carol@{}", carol_addr))
        .await
        .unwrap();

    // Alice dials Carol on Bob's behalf
    wait_for(&mut carol_signals, |s| matches!(s, Signal::IncomingCall { .. })).await;
    wait_for(&mut bob_signals, |s| {
        matches!(s, Signal::TransferSucceeded { call_id } if *call_id == incoming)
    })
    .await;

    // Once Carol rings, the call with Bob goes away on both sides
    wait_for_state(&mut alice_signals, outgoing, CallStatus::Hungup).await;
    wait_for_state(&mut bob_signals, incoming, CallStatus::Hungup).await;
    assert_eq!(alice.active_calls().await.len(), 1);

    alice.shutdown().await.unwrap();
    bob.shutdown().await.unwrap();
    carol.shutdown().await.unwrap();
}
